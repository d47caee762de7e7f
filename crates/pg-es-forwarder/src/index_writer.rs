//! Per-event index writer for Elasticsearch
//!
//! Each change becomes exactly one request: `PUT {base}/{path}/{key}` with the
//! document body for upserts, `DELETE {base}/{path}/{key}` for deletes.
//! Table names and keys are percent-encoded as single path segments.

use async_trait::async_trait;
use pg_es_core::prelude::*;
use pg_es_core::{ForwarderMetrics, IndexConfig, LatencyTimer};
use reqwest::Method;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::transport::{TransportClient, TransportConfig};

/// Index writer configuration
#[derive(Debug, Clone)]
pub struct HttpIndexWriterConfig {
    pub base_url: String,
    /// `{table}` is replaced by the event's table name
    pub path_template: String,
    pub transport: TransportConfig,
    pub failure_mode: FailureMode,
}

impl Default for HttpIndexWriterConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            path_template: "{table}/data".to_string(),
            transport: TransportConfig::default(),
            failure_mode: FailureMode::default(),
        }
    }
}

impl HttpIndexWriterConfig {
    pub fn from_index(index: &IndexConfig, failure_mode: FailureMode) -> Self {
        Self {
            base_url: index.base_url.clone(),
            path_template: index.path_template.clone(),
            transport: TransportConfig::from(index),
            failure_mode,
        }
    }
}

/// Writes one document per request
pub struct HttpIndexWriter {
    transport: TransportClient,
    base: Url,
    config: HttpIndexWriterConfig,
    metrics: ForwarderMetrics,
    running: AtomicBool,
}

impl HttpIndexWriter {
    pub fn new(config: HttpIndexWriterConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url).map_err(|e| {
            SyncError::config(format!("index base URL '{}': {}", config.base_url, e))
        })?;
        if base.cannot_be_a_base() {
            return Err(SyncError::config(format!(
                "index base URL '{}' cannot carry a path",
                config.base_url
            )));
        }

        Ok(Self {
            transport: TransportClient::new(config.transport.clone())?,
            base,
            config,
            metrics: ForwarderMetrics::new("index_writer"),
            running: AtomicBool::new(false),
        })
    }

    /// Document URL for `key` within `table`
    ///
    /// Every template segment and the key are pushed as one encoded segment,
    /// so `/`, `?`, `#` and `%` in a table name cannot reshape the URL. A
    /// segment that would resolve to `.` or `..` is refused.
    pub fn document_url(&self, table: &str, key: &DocumentKey) -> Result<Url> {
        let parts = self
            .config
            .path_template
            .split('/')
            .filter(|part| !part.is_empty())
            .map(|part| part.replace("{table}", table))
            .chain(std::iter::once(key.to_string()));

        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SyncError::request(format!("{} cannot carry a path", self.base)))?;
            segments.pop_if_empty();
            for part in parts {
                if part == "." || part == ".." {
                    return Err(SyncError::request(format!(
                        "table '{}' yields path segment '{}'",
                        table, part
                    )));
                }
                segments.push(&part);
            }
        }
        Ok(url)
    }

    async fn send(&self, request: &IndexRequest<'_>, url: &str) -> Result<WriteOutcome> {
        let operation = request.action.operation();
        let _timer = LatencyTimer::start(|d| self.metrics.record_index_latency(d));

        let outcome = match operation {
            IndexOperation::Delete => {
                self.transport.execute(Method::DELETE, url, None, &[]).await
            }
            IndexOperation::Upsert => {
                self.transport
                    .execute(Method::PUT, url, request.payload, &[])
                    .await
            }
        };

        match outcome {
            Ok(Some(resp)) => {
                match operation {
                    IndexOperation::Delete => info!(key = %request.key, "DELETE"),
                    IndexOperation::Upsert => {
                        info!(key = %request.key, action = %request.action, "ADD/UPDATE")
                    }
                }
                debug!(status = resp.status, body = %resp.body, "Index response");
                self.metrics.record_index_op(operation.as_str(), true);
                Ok(WriteOutcome::Applied)
            }
            Ok(None) => {
                self.log_failure(request, None);
                self.metrics.record_index_op(operation.as_str(), false);
                Ok(WriteOutcome::Failed)
            }
            Err(e) => {
                self.log_failure(request, Some(&e));
                self.metrics.record_index_op(operation.as_str(), false);
                if e.is_fatal(self.config.failure_mode) {
                    Err(e)
                } else {
                    Ok(WriteOutcome::Failed)
                }
            }
        }
    }

    fn log_failure(&self, request: &IndexRequest<'_>, cause: Option<&SyncError>) {
        let cause = cause.map(|e| e.to_string());
        let cause = cause.as_deref();
        match request.payload {
            Some(payload) if !request.action.is_delete() => error!(
                key = %request.key,
                error = cause,
                payload = %payload,
                "Failed to index document"
            ),
            _ => error!(
                key = %request.key,
                action = %request.action,
                error = cause,
                "Failed to apply change"
            ),
        }
    }
}

#[async_trait]
impl Lifecycle for HttpIndexWriter {
    async fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for HttpIndexWriter {
    async fn health_check(&self) -> Result<()> {
        self.transport
            .send(Method::GET, &self.config.base_url, None, &[])
            .await
            .map(|_| ())
    }

    fn component_name(&self) -> &'static str {
        "index_writer"
    }
}

#[async_trait]
impl IndexWriter for HttpIndexWriter {
    async fn apply(&self, request: IndexRequest<'_>) -> Result<WriteOutcome> {
        if !request.action.is_delete() && request.payload.is_none() {
            let e = SyncError::MissingPayload {
                key: request.key.to_string(),
            };
            warn!(error = %e, table = request.table, "Skipping upsert");
            return Ok(WriteOutcome::Skipped(e.kind()));
        }

        let url = match self.document_url(request.table, request.key) {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, key = %request.key, "Skipping change");
                return Ok(WriteOutcome::Skipped(e.kind()));
            }
        };
        self.send(&request, url.as_str()).await
    }
}
