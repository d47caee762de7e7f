//! # pg-es-forwarder
//!
//! Consumes PostgreSQL change notifications and applies each one to an
//! Elasticsearch index, one request per event.
//!
//! ## Components
//!
//! - `Forwarder`: the event loop (decode, optional enrichment, write)
//! - `HttpIndexWriter`: PUT/DELETE against `{base}/{path}/{key}`
//! - `EnrichmentResolver`: fetches current rows through a `RoutingTable`
//! - `TransportClient`: shared HTTP plumbing
//!
//! ## Variants
//!
//! Without an enricher the event's embedded `data` is indexed as-is. With one,
//! every upsert is resolved against the external API first and the embedded
//! payload is ignored. Deletes never consult the enricher.

pub mod enrichment;
pub mod index_writer;
pub mod routing;
pub mod transport;

#[cfg(test)]
mod testing;

pub use enrichment::*;
pub use index_writer::*;
pub use routing::*;
pub use transport::*;

use pg_es_core::prelude::*;
use pg_es_core::{ErrorContext, ErrorContextExt, ForwarderMetrics};
use pg_notify_source::{IdleMonitor, Wake};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What happened to one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Indexed,
    Deleted,
    /// Never reached the index
    Dropped(&'static str),
    /// Reached the index and was rejected or could not be delivered
    Failed,
}

/// Counters since the forwarder was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub received: u64,
    pub indexed: u64,
    pub deleted: u64,
    pub dropped: u64,
    pub failed: u64,
    pub probes: u64,
}

/// Forwarder options
#[derive(Debug, Clone)]
pub struct ForwarderOptions {
    pub idle_window: Duration,
    pub failure_mode: FailureMode,
    pub strict_actions: bool,
}

impl Default for ForwarderOptions {
    fn default() -> Self {
        Self {
            idle_window: Duration::from_secs(90),
            failure_mode: FailureMode::default(),
            strict_actions: false,
        }
    }
}

impl From<&ForwarderConfig> for ForwarderOptions {
    fn from(config: &ForwarderConfig) -> Self {
        Self {
            idle_window: config.listener.idle_window,
            failure_mode: config.failure_mode,
            strict_actions: config.strict_actions,
        }
    }
}

/// Main forwarder orchestrator
pub struct Forwarder<S, W>
where
    S: EventSource,
    W: IndexWriter,
{
    source: Arc<S>,
    writer: Arc<W>,
    enricher: Option<Arc<dyn Enricher>>,
    monitor: IdleMonitor,
    options: ForwarderOptions,
    metrics: ForwarderMetrics,
    running: AtomicBool,
    received: AtomicU64,
    indexed: AtomicU64,
    deleted: AtomicU64,
    dropped: AtomicU64,
    failed: AtomicU64,
}

impl<S, W> Forwarder<S, W>
where
    S: EventSource + 'static,
    W: IndexWriter + 'static,
{
    /// Create new forwarder
    pub fn new(source: S, writer: W, options: ForwarderOptions) -> Self {
        let source = Arc::new(source);
        let monitor = IdleMonitor::new(source.clone(), options.idle_window);

        Self {
            source,
            writer: Arc::new(writer),
            enricher: None,
            monitor,
            options,
            metrics: ForwarderMetrics::new("forwarder"),
            running: AtomicBool::new(false),
            received: AtomicU64::new(0),
            indexed: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Resolve every upsert through `enricher`
    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    pub fn writer(&self) -> &Arc<W> {
        &self.writer
    }

    /// Run until Ctrl-C, the end of the stream, or a fatal error
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Run until `shutdown` resolves, the stream ends, or a fatal error
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(channel = self.source.channel(), "Starting forwarder");

        self.source.start().await?;
        self.writer.start().await?;
        self.running.store(true, Ordering::SeqCst);

        let mut stream = self.source.notifications().await?;
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                wake = self.monitor.next(&mut stream) => match wake {
                    Wake::Item(Some(Ok(notification))) => {
                        if let Err(e) = self.handle_notification(&notification).await {
                            break Err(e);
                        }
                    }
                    Wake::Item(Some(Err(e))) => {
                        warn!(error = %e, "Listener reported an error");
                    }
                    Wake::Item(None) => {
                        info!("Notification stream ended");
                        break Ok(());
                    }
                    Wake::Idle => {}
                },
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break Ok(());
                }
            }
        };

        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.writer.stop().await {
            warn!(error = %e, "Failed to stop index writer");
        }
        if let Err(e) = self.source.stop().await {
            warn!(error = %e, "Failed to stop event source");
        }

        let stats = self.stats();
        info!(
            received = stats.received,
            indexed = stats.indexed,
            deleted = stats.deleted,
            dropped = stats.dropped,
            failed = stats.failed,
            "Forwarder stopped"
        );
        result
    }

    /// Process one raw notification
    ///
    /// Only failures that must stop the forwarder are returned as `Err`.
    pub async fn handle_notification(&self, notification: &Notification) -> Result<EventOutcome> {
        self.received.fetch_add(1, Ordering::Relaxed);

        let event = match decode(notification.payload.as_bytes()) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    error = %e,
                    channel = %notification.channel,
                    payload = %notification.payload,
                    "Dropping malformed notification"
                );
                return Ok(self.drop_event(e.kind()));
            }
        };

        self.handle_event(&event).await
    }

    /// Process one decoded change
    pub async fn handle_event(&self, event: &ChangeEvent) -> Result<EventOutcome> {
        let ctx = ErrorContext::new("forwarder").with_event(
            &event.table,
            event.row_id,
            event.action.as_str(),
        );

        if self.options.strict_actions && !event.action.is_recognized() {
            let e = SyncError::UnknownAction {
                action: event.action.to_string(),
            };
            warn!(error = %e, %ctx, "Dropping event");
            return Ok(self.drop_event(e.kind()));
        }

        let operation = event.operation();
        let key = event.document_key();
        self.metrics.record_event(&event.table, operation.as_str());
        debug!(%key, %operation, "Processing change");

        let resolved;
        let payload = match (operation, &self.enricher) {
            (IndexOperation::Delete, _) => None,
            (IndexOperation::Upsert, None) => event.payload.as_ref(),
            (IndexOperation::Upsert, Some(enricher)) => {
                match enricher.resolve(&event.table, event.row_id).await {
                    Ok(row) => {
                        resolved = row;
                        Some(&resolved)
                    }
                    Err(e) if e.is_fatal(self.options.failure_mode) => {
                        return Err::<EventOutcome, _>(e).with_context(&ctx);
                    }
                    Err(e) => {
                        warn!(error = %e, %ctx, "Enrichment failed, skipping event");
                        return Ok(self.drop_event(e.kind()));
                    }
                }
            }
        };

        let request = IndexRequest {
            table: &event.table,
            key: &key,
            action: &event.action,
            payload,
        };

        match self.writer.apply(request).await.with_context(&ctx)? {
            WriteOutcome::Applied if operation == IndexOperation::Delete => {
                self.deleted.fetch_add(1, Ordering::Relaxed);
                Ok(EventOutcome::Deleted)
            }
            WriteOutcome::Applied => {
                self.indexed.fetch_add(1, Ordering::Relaxed);
                Ok(EventOutcome::Indexed)
            }
            WriteOutcome::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Ok(EventOutcome::Failed)
            }
            WriteOutcome::Skipped(reason) => Ok(self.drop_event(reason)),
        }
    }

    fn drop_event(&self, reason: &'static str) -> EventOutcome {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_dropped(reason);
        EventOutcome::Dropped(reason)
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwarderStats {
        ForwarderStats {
            received: self.received.load(Ordering::Relaxed),
            indexed: self.indexed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            probes: self.monitor.probes_fired(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{unused_base_url, TestServer};
    use axum::http::StatusCode;
    use pg_notify_source::{ChannelSender, ChannelSource};
    use serde_json::json;

    type TestForwarder = Forwarder<ChannelSource, HttpIndexWriter>;

    fn forwarder(index_url: &str, template: &str, options: ForwarderOptions) -> (TestForwarder, ChannelSender) {
        let (source, sender) = ChannelSource::new("events");
        let writer = HttpIndexWriter::new(HttpIndexWriterConfig {
            base_url: index_url.to_string(),
            path_template: template.to_string(),
            failure_mode: options.failure_mode,
            ..Default::default()
        })
        .unwrap();
        (Forwarder::new(source, writer, options), sender)
    }

    fn users_route(api_base: &str) -> Arc<dyn Enricher> {
        let mut routes = Routes {
            key: "s3cret".to_string(),
            ..Default::default()
        };
        routes.routes.insert(
            "users".to_string(),
            Route {
                url: format!("{}/api/users/", api_base),
                accept: "application/vnd.users+json".to_string(),
            },
        );
        let table = Arc::new(RoutingTable::from_routes(routes));
        Arc::new(EnrichmentResolver::new(table, TransportConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn test_update_is_indexed_with_embedded_payload() {
        let index = TestServer::start(StatusCode::OK, "{}").await;
        let (fwd, sender) = forwarder(&index.base_url, "{table}/data", ForwarderOptions::default());

        sender.notify(r#"{"table":"users","id":42,"action":"UPDATE","data":{"name":"Ana"}}"#);
        drop(sender);
        fwd.run_until(std::future::pending()).await.unwrap();

        let requests = index.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "PUT");
        assert_eq!(requests[0].path, "/users/data/users_42");
        assert_eq!(requests[0].json(), json!({"name": "Ana"}));

        let stats = fwd.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.indexed, 1);
    }

    #[tokio::test]
    async fn test_delete_ignores_data_and_fixed_index_path() {
        let index = TestServer::start(StatusCode::OK, "{}").await;
        let (fwd, sender) = forwarder(&index.base_url, "app/doc", ForwarderOptions::default());

        sender.notify(r#"{"table":"users","id":42,"action":"DELETE","data":{"name":"Ana"}}"#);
        drop(sender);
        fwd.run_until(std::future::pending()).await.unwrap();

        let requests = index.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "DELETE");
        assert_eq!(requests[0].path, "/app/doc/users_42");
        assert_eq!(fwd.stats().deleted, 1);
    }

    #[tokio::test]
    async fn test_malformed_notification_does_not_stop_loop() {
        let index = TestServer::start(StatusCode::OK, "{}").await;
        let (fwd, sender) = forwarder(&index.base_url, "{table}/data", ForwarderOptions::default());

        sender.notify("not json at all");
        sender.notify(r#"{"table":"users","action":"UPDATE"}"#);
        sender.fail("connection reset");
        sender.notify(r#"{"table":"teams","id":3,"action":"INSERT","data":{"name":"core"}}"#);
        drop(sender);
        fwd.run_until(std::future::pending()).await.unwrap();

        let requests = index.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, "/teams/data/teams_3");

        let stats = fwd.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.indexed, 1);
    }

    #[tokio::test]
    async fn test_enrichment_replaces_payload() {
        let index = TestServer::start(StatusCode::OK, "{}").await;
        let api = TestServer::start(StatusCode::OK, r#"{"name":"Ana","team":"core"}"#).await;
        let (fwd, sender) = forwarder(&index.base_url, "{table}/data", ForwarderOptions::default());
        let fwd = fwd.with_enricher(users_route(&api.base_url));

        sender.notify(r#"{"table":"users","id":42,"action":"UPDATE","data":{"name":"stale"}}"#);
        sender.notify(r#"{"table":"users","id":42,"action":"DELETE"}"#);
        drop(sender);
        fwd.run_until(std::future::pending()).await.unwrap();

        let api_requests = api.requests().await;
        assert_eq!(api_requests.len(), 1);
        assert_eq!(api_requests[0].path, "/api/users/42");
        assert_eq!(api_requests[0].header("gateway"), Some("s3cret"));

        let requests = index.requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, "PUT");
        assert_eq!(requests[0].json(), json!({"name": "Ana", "team": "core"}));
        assert_eq!(requests[1].method, "DELETE");
    }

    #[tokio::test]
    async fn test_unrouted_table_makes_no_requests() {
        let index = TestServer::start(StatusCode::OK, "{}").await;
        let api = TestServer::start(StatusCode::OK, "{}").await;
        let (fwd, _sender) = forwarder(&index.base_url, "{table}/data", ForwarderOptions::default());
        let fwd = fwd.with_enricher(users_route(&api.base_url));

        let outcome = fwd
            .handle_notification(&Notification::new(
                "events",
                r#"{"table":"orders","id":7,"action":"INSERT"}"#,
                0,
            ))
            .await
            .unwrap();

        assert_eq!(outcome, EventOutcome::Dropped("route_not_found"));
        assert!(api.requests().await.is_empty());
        assert!(index.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_insert_without_data_is_dropped() {
        let index = TestServer::start(StatusCode::OK, "{}").await;
        let (fwd, sender) = forwarder(&index.base_url, "{table}/data", ForwarderOptions::default());

        let outcome = fwd
            .handle_notification(&Notification::new(
                "events",
                r#"{"table":"users","id":7,"action":"INSERT"}"#,
                0,
            ))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Dropped("missing_payload"));

        sender.notify(r#"{"table":"users","id":8,"action":"UPDATE"}"#);
        drop(sender);
        fwd.run_until(std::future::pending()).await.unwrap();

        let stats = fwd.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.failed, 0);
        assert!(index.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_table_lookup_is_case_sensitive() {
        let index = TestServer::start(StatusCode::OK, "{}").await;
        let api = TestServer::start(StatusCode::OK, r#"{"name":"Ana"}"#).await;
        let (fwd, _sender) = forwarder(&index.base_url, "{table}/data", ForwarderOptions::default());
        let fwd = fwd.with_enricher(users_route(&api.base_url));

        let outcome = fwd
            .handle_notification(&Notification::new(
                "events",
                r#"{"table":"USERS","id":42,"action":"UPDATE"}"#,
                0,
            ))
            .await
            .unwrap();

        assert_eq!(outcome, EventOutcome::Dropped("route_not_found"));
        assert!(api.requests().await.is_empty());
        assert!(index.requests().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_write_counts_as_failed() {
        let index = TestServer::start(StatusCode::BAD_REQUEST, "mapper_parsing_exception").await;
        let options = ForwarderOptions {
            failure_mode: FailureMode::FailFast,
            ..Default::default()
        };
        let (fwd, sender) = forwarder(&index.base_url, "{table}/data", options);

        sender.notify(r#"{"table":"users","id":1,"action":"INSERT","data":{"n":1}}"#);
        sender.notify(r#"{"table":"users","id":2,"action":"INSERT","data":{"n":2}}"#);
        drop(sender);
        fwd.run_until(std::future::pending()).await.unwrap();

        assert_eq!(index.requests().await.len(), 2);
        assert_eq!(fwd.stats().failed, 2);
    }

    #[tokio::test]
    async fn test_strict_actions() {
        let index = TestServer::start(StatusCode::OK, "{}").await;
        let payload = r#"{"table":"users","id":5,"action":"TRUNCATE","data":{"n":5}}"#;

        let (lenient, _tx) = forwarder(&index.base_url, "{table}/data", ForwarderOptions::default());
        let outcome = lenient
            .handle_notification(&Notification::new("events", payload, 0))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Indexed);
        assert_eq!(index.requests().await[0].method, "PUT");

        let options = ForwarderOptions {
            strict_actions: true,
            ..Default::default()
        };
        let (strict, _tx) = forwarder(&index.base_url, "{table}/data", options);
        let outcome = strict
            .handle_notification(&Notification::new("events", payload, 0))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Dropped("unknown_action"));
        assert_eq!(index.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_index_depends_on_failure_mode() {
        let base = unused_base_url().await;
        let payload = r#"{"table":"users","id":1,"action":"UPDATE","data":{"n":1}}"#;

        let (resilient, sender) = forwarder(&base, "{table}/data", ForwarderOptions::default());
        sender.notify(payload);
        drop(sender);
        resilient.run_until(std::future::pending()).await.unwrap();
        assert_eq!(resilient.stats().failed, 1);

        let options = ForwarderOptions {
            failure_mode: FailureMode::FailFast,
            ..Default::default()
        };
        let (strict, sender) = forwarder(&base, "{table}/data", options);
        sender.notify(payload);
        sender.notify(payload);
        let err = strict.run_until(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { .. }));
        assert_eq!(strict.stats().received, 1);
        assert!(!strict.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_channel_is_probed() {
        let (fwd, _sender) = forwarder("http://127.0.0.1:9", "{table}/data", ForwarderOptions::default());

        fwd.run_until(tokio::time::sleep(Duration::from_secs(200)))
            .await
            .unwrap();

        assert_eq!(fwd.stats().probes, 2);
        assert_eq!(fwd.source().probe_count(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_components() {
        let (fwd, _sender) = forwarder("http://127.0.0.1:9", "{table}/data", ForwarderOptions::default());
        fwd.run_until(async {}).await.unwrap();

        assert!(!fwd.is_running());
        assert!(!fwd.source().is_running());
        assert!(!fwd.writer().is_running());
    }
}
