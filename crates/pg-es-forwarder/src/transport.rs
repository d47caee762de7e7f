//! HTTP transport shared by the index writer and the enrichment resolver
//!
//! Every request carries `Content-Type` and `Accept` set to
//! `application/json`; callers may override or add headers per request.
//! Statuses outside [200, 300) are errors: the body is read and logged.

use pg_es_core::prelude::*;
use reqwest::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use tracing::{trace, warn};

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            username: None,
            password: None,
            api_key: None,
        }
    }
}

impl From<&pg_es_core::IndexConfig> for TransportConfig {
    fn from(config: &pg_es_core::IndexConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            username: config.username.clone(),
            password: config.password.clone(),
            api_key: config.api_key.clone(),
        }
    }
}

impl From<&pg_es_core::EnrichmentConfig> for TransportConfig {
    fn from(config: &pg_es_core::EnrichmentConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            request_timeout: config.request_timeout,
            ..Default::default()
        }
    }
}

/// Successful response, body fully read
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

/// Request/response executor with uniform error classification
pub struct TransportClient {
    client: Client,
    config: TransportConfig,
}

impl TransportClient {
    pub fn new(config: TransportConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::request_with_source("Failed to create HTTP client", e))?;

        Ok(Self { client, config })
    }

    /// Send a request; non-2xx statuses become [`SyncError::HttpStatus`]
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(&str, &str)],
    ) -> Result<Response> {
        let request = self.build(method.clone(), url, body, headers)?;

        let resp = self.client.execute(request).await.map_err(|e| {
            SyncError::transport_with_source(format!("{} {} failed", method, url), e)
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            SyncError::transport_with_source(format!("Failed to read response from {}", url), e)
        })?;

        if !status.is_success() {
            return Err(SyncError::HttpStatus {
                method: method.to_string(),
                url: url.to_string(),
                status: status.as_u16(),
                body: text,
            });
        }

        trace!(%method, url, status = status.as_u16(), "Request completed");
        Ok(Response {
            status: status.as_u16(),
            body: text,
        })
    }

    /// Send a request; a non-2xx status is logged and yields `Ok(None)`
    ///
    /// Construction and transport failures are still returned as errors so
    /// the caller can apply its failure mode.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(&str, &str)],
    ) -> Result<Option<Response>> {
        match self.send(method, url, body, headers).await {
            Ok(resp) => Ok(Some(resp)),
            Err(SyncError::HttpStatus {
                method,
                url,
                status,
                body,
            }) => {
                warn!(%method, %url, status, %body, "HTTP error");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn build(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        headers: &[(&str, &str)],
    ) -> Result<reqwest::Request> {
        let mut builder = self.client.request(method.clone(), url);

        if let Some(ref api_key) = self.config.api_key {
            builder = builder.header(AUTHORIZATION, format!("ApiKey {}", api_key));
        } else if let (Some(ref user), Some(ref pass)) =
            (&self.config.username, &self.config.password)
        {
            builder = builder.basic_auth(user, Some(pass));
        }

        if let Some(body) = body {
            let bytes = serde_json::to_vec(body)
                .map_err(|e| SyncError::request_with_source("Failed to serialize body", e))?;
            builder = builder.body(bytes);
        }

        let mut request = builder.build().map_err(|e| {
            SyncError::request_with_source(format!("Invalid request {} {}", method, url), e)
        })?;

        let map = request.headers_mut();
        map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        map.insert(ACCEPT, HeaderValue::from_static("application/json"));

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                SyncError::request_with_source(format!("Invalid header name '{}'", name), e)
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                SyncError::request_with_source(format!("Invalid value for header '{}'", name), e)
            })?;
            map.insert(name, value);
        }

        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestServer;
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_uniform_headers_and_body() {
        let server = TestServer::start(StatusCode::OK, "{}").await;
        let client = TransportClient::new(TransportConfig::default()).unwrap();

        let url = format!("{}/users/data/users_1", server.base_url);
        let resp = client
            .execute(Method::PUT, &url, Some(&json!({"name": "Ana"})), &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status, 200);

        let requests = server.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "PUT");
        assert_eq!(requests[0].path, "/users/data/users_1");
        assert_eq!(requests[0].header("content-type"), Some("application/json"));
        assert_eq!(requests[0].header("accept"), Some("application/json"));
        assert_eq!(requests[0].json(), json!({"name": "Ana"}));
    }

    #[tokio::test]
    async fn test_extra_headers_override_accept() {
        let server = TestServer::start(StatusCode::OK, "{}").await;
        let client = TransportClient::new(TransportConfig::default()).unwrap();

        let url = format!("{}/api/users/1", server.base_url);
        client
            .execute(
                Method::GET,
                &url,
                None,
                &[("Accept", "application/vnd.users+json"), ("gateway", "s3cret")],
            )
            .await
            .unwrap();

        let requests = server.requests().await;
        assert_eq!(requests[0].header("accept"), Some("application/vnd.users+json"));
        assert_eq!(requests[0].header("gateway"), Some("s3cret"));
        assert!(requests[0].body.is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status_yields_none() {
        let server = TestServer::start(StatusCode::BAD_REQUEST, "mapper_parsing_exception").await;
        let client = TransportClient::new(TransportConfig::default()).unwrap();
        let url = format!("{}/users/data/users_1", server.base_url);

        let resp = client.execute(Method::DELETE, &url, None, &[]).await.unwrap();
        assert!(resp.is_none());

        match client.send(Method::DELETE, &url, None, &[]).await {
            Err(SyncError::HttpStatus { status, body, .. }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "mapper_parsing_exception");
            }
            other => panic!("expected HttpStatus, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_construction_failures() {
        let client = TransportClient::new(TransportConfig::default()).unwrap();

        let err = client
            .execute(Method::GET, "not a url", None, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RequestConstruction { .. }));

        let err = client
            .execute(Method::GET, "http://localhost:9/", None, &[("bad header", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RequestConstruction { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transport_error() {
        let url = format!("{}/users/data/users_1", crate::testing::unused_base_url().await);
        let client = TransportClient::new(TransportConfig::default()).unwrap();

        let err = client.execute(Method::GET, &url, None, &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
    }
}
