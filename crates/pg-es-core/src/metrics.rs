//! Metrics for the forwarder
//!
//! Emits through the `metrics` facade; the embedding binary decides whether
//! an exporter is installed.

use metrics::{counter, histogram};
use std::time::{Duration, Instant};

/// Metric names as constants for consistency
pub mod names {
    // Source metrics
    pub const SOURCE_NOTIFICATIONS_TOTAL: &str = "pg_notify_notifications_total";
    pub const SOURCE_ERRORS_TOTAL: &str = "pg_notify_errors_total";
    pub const SOURCE_RECONNECTS_TOTAL: &str = "pg_notify_reconnects_total";
    pub const SOURCE_PROBES_TOTAL: &str = "pg_notify_liveness_probes_total";

    // Forwarder metrics
    pub const FORWARDER_EVENTS_TOTAL: &str = "pg_es_events_total";
    pub const FORWARDER_EVENTS_DROPPED: &str = "pg_es_events_dropped_total";
    pub const FORWARDER_INDEX_OPS: &str = "pg_es_index_operations_total";
    pub const FORWARDER_INDEX_LATENCY: &str = "pg_es_index_latency_seconds";
    pub const FORWARDER_ENRICH_LATENCY: &str = "pg_es_enrichment_latency_seconds";
}

/// Labels for metrics
pub mod labels {
    pub const COMPONENT: &str = "component";
    pub const TABLE: &str = "table";
    pub const OPERATION: &str = "operation";
    pub const REASON: &str = "reason";
    pub const STATUS: &str = "status";
    pub const OUTCOME: &str = "outcome";
}

/// Source metrics
#[derive(Clone)]
pub struct SourceMetrics {
    component: String,
}

impl SourceMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn record_notification(&self) {
        counter!(
            names::SOURCE_NOTIFICATIONS_TOTAL,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    pub fn record_error(&self, reason: &str) {
        counter!(
            names::SOURCE_ERRORS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    pub fn record_reconnect(&self) {
        counter!(
            names::SOURCE_RECONNECTS_TOTAL,
            labels::COMPONENT => self.component.clone(),
        )
        .increment(1);
    }

    /// Record a liveness probe and whether it succeeded
    pub fn record_probe(&self, healthy: bool) {
        counter!(
            names::SOURCE_PROBES_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::OUTCOME => if healthy { "ok" } else { "failed" },
        )
        .increment(1);
    }
}

/// Forwarder metrics
#[derive(Clone)]
pub struct ForwarderMetrics {
    component: String,
}

impl ForwarderMetrics {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
        }
    }

    pub fn record_event(&self, table: &str, operation: &str) {
        counter!(
            names::FORWARDER_EVENTS_TOTAL,
            labels::COMPONENT => self.component.clone(),
            labels::TABLE => table.to_string(),
            labels::OPERATION => operation.to_string(),
        )
        .increment(1);
    }

    pub fn record_dropped(&self, reason: &str) {
        counter!(
            names::FORWARDER_EVENTS_DROPPED,
            labels::COMPONENT => self.component.clone(),
            labels::REASON => reason.to_string(),
        )
        .increment(1);
    }

    pub fn record_index_op(&self, operation: &str, success: bool) {
        counter!(
            names::FORWARDER_INDEX_OPS,
            labels::COMPONENT => self.component.clone(),
            labels::OPERATION => operation.to_string(),
            labels::STATUS => if success { "success" } else { "failure" },
        )
        .increment(1);
    }

    pub fn record_index_latency(&self, duration: Duration) {
        histogram!(
            names::FORWARDER_INDEX_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }

    pub fn record_enrich_latency(&self, duration: Duration) {
        histogram!(
            names::FORWARDER_ENRICH_LATENCY,
            labels::COMPONENT => self.component.clone(),
        )
        .record(duration.as_secs_f64());
    }
}

/// Timer guard for automatic latency recording
pub struct LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    /// Start a new timer
    pub fn start(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Stop timer and record
    pub fn stop(mut self) -> Duration {
        let elapsed = self.start.elapsed();
        if let Some(f) = self.on_drop.take() {
            f(elapsed);
        }
        elapsed
    }
}

impl<F> Drop for LatencyTimer<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}
