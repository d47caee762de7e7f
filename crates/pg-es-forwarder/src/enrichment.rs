//! Enrichment resolver
//!
//! Fetches the authoritative current row from an external API instead of
//! trusting the notification payload: `GET {route.url}{row_id}`.

use async_trait::async_trait;
use pg_es_core::prelude::*;
use pg_es_core::{EnrichmentConfig, ForwarderMetrics, LatencyTimer};
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::routing::RoutingTable;
use crate::transport::{TransportClient, TransportConfig};

/// Resolves rows through the routing table
pub struct EnrichmentResolver {
    routes: Arc<RoutingTable>,
    transport: TransportClient,
    metrics: ForwarderMetrics,
}

impl EnrichmentResolver {
    pub fn new(routes: Arc<RoutingTable>, transport: TransportConfig) -> Result<Self> {
        Ok(Self {
            routes,
            transport: TransportClient::new(transport)?,
            metrics: ForwarderMetrics::new("enrichment"),
        })
    }

    pub fn from_config(routes: Arc<RoutingTable>, config: &EnrichmentConfig) -> Result<Self> {
        Self::new(routes, TransportConfig::from(config))
    }
}

#[async_trait]
impl Enricher for EnrichmentResolver {
    async fn resolve(&self, table: &str, row_id: i64) -> Result<Value> {
        let snapshot = self.routes.snapshot().await;
        let route = snapshot
            .route(table)
            .ok_or_else(|| SyncError::route_not_found(table))?;

        let url = format!("{}{}", route.url, row_id);
        let mut headers = vec![("Accept", route.accept.as_str())];
        if !snapshot.key.is_empty() {
            headers.push((snapshot.auth_header.as_str(), snapshot.key.as_str()));
        }

        let timer = LatencyTimer::start(|d| self.metrics.record_enrich_latency(d));
        let resp = self.transport.send(Method::GET, &url, None, &headers).await?;
        timer.stop();

        debug!(table, row_id, %url, "Resolved row");
        serde_json::from_str(&resp.body).map_err(|e| {
            SyncError::malformed_with_source(format!("Response from {} is not JSON", url), e)
        })
    }
}
