//! Change event sources
//!
//! Implements the EventSource strategy trait with two backends:
//! - PgNotifySource: PostgreSQL LISTEN/NOTIFY over tokio-postgres
//! - ChannelSource: in-memory channel for tests and embedding

use async_trait::async_trait;
use futures::{stream, StreamExt};
use pg_es_core::prelude::*;
use pg_es_core::SourceMetrics;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_postgres::tls::NoTlsStream;
use tokio_postgres::{AsyncMessage, Client, Connection, NoTls, Socket};
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;

type NotificationSender = mpsc::Sender<Result<Notification>>;
type NotificationReceiver = mpsc::Receiver<Result<Notification>>;

/// Queue depth used when none is configured
pub const DEFAULT_BUFFER: usize = 1024;

// ============================================================================
// PostgreSQL LISTEN/NOTIFY Source
// ============================================================================

/// Configuration for the PostgreSQL source
#[derive(Debug, Clone)]
pub struct PgNotifySourceConfig {
    /// Connection string
    pub database_url: String,
    /// Channel to LISTEN on
    pub channel: String,
    /// Delay schedule after a lost connection
    pub reconnect: ReconnectPolicy,
    /// Notifications queued ahead of the consumer before reading pauses
    pub buffer: usize,
}

impl Default for PgNotifySourceConfig {
    fn default() -> Self {
        Self {
            database_url: "host=localhost user=postgres".to_string(),
            channel: "events".to_string(),
            reconnect: ReconnectPolicy::default(),
            buffer: DEFAULT_BUFFER,
        }
    }
}

impl From<&pg_es_core::ListenerConfig> for PgNotifySourceConfig {
    fn from(config: &pg_es_core::ListenerConfig) -> Self {
        Self {
            database_url: config.database_url.clone(),
            channel: config.channel.clone(),
            reconnect: ReconnectPolicy::new(config.reconnect_min, config.reconnect_max),
            buffer: config.notification_buffer,
        }
    }
}

/// Shared state between the source handle and its supervisor task
struct Shared {
    config: PgNotifySourceConfig,
    client: RwLock<Option<Arc<Client>>>,
    running: AtomicBool,
    metrics: SourceMetrics,
}

/// PostgreSQL notification source
///
/// `start()` connects and issues `LISTEN`; failure there is a setup failure.
/// Once listening, a lost connection is reported on the stream as a
/// [`SyncError::Listener`] and re-established in the background.
pub struct PgNotifySource {
    shared: Arc<Shared>,
    receiver: Mutex<Option<NotificationReceiver>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl PgNotifySource {
    /// Create new source
    pub fn new(config: PgNotifySourceConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                client: RwLock::new(None),
                running: AtomicBool::new(false),
                metrics: SourceMetrics::new("pg_notify_source"),
            }),
            receiver: Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }
}

/// Quote a channel name the way LISTEN expects an identifier
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Forward notifications from a connection until it fails or closes
fn drive(
    mut connection: Connection<Socket, NoTlsStream>,
    tx: NotificationSender,
    metrics: SourceMetrics,
) -> JoinHandle<Option<tokio_postgres::Error>> {
    tokio::spawn(async move {
        let messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(messages);
        while let Some(message) = messages.next().await {
            match message {
                Ok(AsyncMessage::Notification(n)) => {
                    metrics.record_notification();
                    let notification = Notification::new(n.channel(), n.payload(), n.process_id());
                    // Waits while the queue is full
                    if tx.send(Ok(notification)).await.is_err() {
                        // Consumer gone
                        return None;
                    }
                }
                Ok(AsyncMessage::Notice(notice)) => {
                    debug!(notice = %notice, "Server notice");
                }
                Ok(_) => {}
                Err(e) => return Some(e),
            }
        }
        None
    })
}

/// Connect, start driving the connection and LISTEN on the channel
async fn establish(
    config: &PgNotifySourceConfig,
    tx: NotificationSender,
    metrics: SourceMetrics,
) -> Result<(Client, JoinHandle<Option<tokio_postgres::Error>>)> {
    let (client, connection) = tokio_postgres::connect(&config.database_url, NoTls)
        .await
        .map_err(|e| SyncError::connection_with_source("Failed to connect to PostgreSQL", e))?;

    // The connection must be polled for LISTEN to complete
    let driver = drive(connection, tx, metrics);

    let listen = format!("LISTEN {}", quote_ident(&config.channel));
    if let Err(e) = client.batch_execute(&listen).await {
        driver.abort();
        return Err(SyncError::connection_with_source(
            format!("Failed to LISTEN on '{}'", config.channel),
            e,
        ));
    }

    Ok((client, driver))
}

/// Watch the active connection and reconnect when it is lost
async fn supervise(
    shared: Arc<Shared>,
    tx: NotificationSender,
    mut driver: JoinHandle<Option<tokio_postgres::Error>>,
) {
    loop {
        let outcome = driver.await;
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }

        *shared.client.write().await = None;
        let message = match outcome {
            Ok(Some(e)) => format!("connection lost: {}", e),
            Ok(None) => "connection closed by server".to_string(),
            Err(e) => format!("connection task failed: {}", e),
        };
        error!(channel = %shared.config.channel, reason = %message, "Listener connection lost");
        shared.metrics.record_error("connection_lost");

        if tx.send(Err(SyncError::listener(message))).await.is_err() {
            return;
        }

        let mut attempt = 0;
        driver = loop {
            attempt += 1;
            let delay = shared.config.reconnect.delay(attempt);
            tokio::time::sleep(delay).await;

            if !shared.running.load(Ordering::SeqCst) {
                return;
            }

            match establish(&shared.config, tx.clone(), shared.metrics.clone()).await {
                Ok((client, handle)) => {
                    *shared.client.write().await = Some(Arc::new(client));
                    shared.metrics.record_reconnect();
                    info!(channel = %shared.config.channel, attempt, "Listener reconnected");
                    break handle;
                }
                Err(e) => {
                    warn!(error = %e, attempt, delay_secs = delay.as_secs(), "Reconnect failed");
                    shared.metrics.record_error("reconnect_failed");
                }
            }
        };
    }
}

#[async_trait]
impl Lifecycle for PgNotifySource {
    async fn start(&self) -> Result<()> {
        let config = &self.shared.config;
        info!(channel = %config.channel, "Connecting to PostgreSQL");

        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let (client, driver) = establish(config, tx.clone(), self.shared.metrics.clone()).await?;

        *self.shared.client.write().await = Some(Arc::new(client));
        *self.receiver.lock().await = Some(rx);
        self.shared.running.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(supervise(self.shared.clone(), tx, driver));
        *self.supervisor.lock().await = Some(handle);

        info!(channel = %config.channel, "Listening for notifications");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }
        // Dropping the client closes the connection and ends its driver
        *self.shared.client.write().await = None;

        info!(channel = %self.shared.config.channel, "PostgreSQL source stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthCheck for PgNotifySource {
    async fn health_check(&self) -> Result<()> {
        let client = self.shared.client.read().await.clone();
        match client {
            Some(client) if !client.is_closed() => client
                .batch_execute("SELECT 1")
                .await
                .map_err(|e| SyncError::listener_with_source("Liveness probe failed", e)),
            Some(_) => Err(SyncError::listener("Connection closed")),
            None => Err(SyncError::listener("Not connected")),
        }
    }

    fn component_name(&self) -> &'static str {
        "pg_notify_source"
    }
}

#[async_trait]
impl EventSource for PgNotifySource {
    async fn notifications(&self) -> Result<NotificationStream> {
        let mut rx = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| SyncError::listener("Source not started or stream already taken"))?;

        let stream = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };

        Ok(Box::pin(stream))
    }

    fn channel(&self) -> &str {
        &self.shared.config.channel
    }
}

// ============================================================================
// Channel Source (in-memory)
// ============================================================================

/// Sending half of a [`ChannelSource`]
///
/// The source's stream ends once every sender has been dropped.
#[derive(Clone)]
pub struct ChannelSender {
    channel: String,
    tx: NotificationSender,
}

impl ChannelSender {
    /// Deliver a payload as if it had been NOTIFYed
    ///
    /// Returns `false` when the queue is full or the source is gone.
    pub fn notify(&self, payload: impl Into<String>) -> bool {
        self.tx
            .try_send(Ok(Notification::new(self.channel.clone(), payload, 0)))
            .is_ok()
    }

    /// Deliver a listener failure
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.tx.try_send(Err(SyncError::listener(message))).is_ok()
    }
}

/// In-memory event source
pub struct ChannelSource {
    channel: String,
    receiver: Mutex<Option<NotificationReceiver>>,
    healthy: AtomicBool,
    probes: AtomicU64,
    running: AtomicBool,
}

impl ChannelSource {
    /// Create a source and its sender
    pub fn new(channel: impl Into<String>) -> (Self, ChannelSender) {
        Self::with_capacity(channel, DEFAULT_BUFFER)
    }

    /// Create a source holding at most `capacity` undelivered items
    pub fn with_capacity(channel: impl Into<String>, capacity: usize) -> (Self, ChannelSender) {
        let channel = channel.into();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let source = Self {
            channel: channel.clone(),
            receiver: Mutex::new(Some(rx)),
            healthy: AtomicBool::new(true),
            probes: AtomicU64::new(0),
            running: AtomicBool::new(false),
        };
        (source, ChannelSender { channel, tx })
    }

    /// Make subsequent health checks fail or succeed
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Number of health checks received
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Lifecycle for ChannelSource {
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
impl HealthCheck for ChannelSource {
    async fn health_check(&self) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SyncError::listener("channel source marked unhealthy"))
        }
    }

    fn component_name(&self) -> &'static str {
        "channel_source"
    }
}

#[async_trait]
impl EventSource for ChannelSource {
    async fn notifications(&self) -> Result<NotificationStream> {
        let mut rx = self
            .receiver
            .lock()
            .await
            .take()
            .ok_or_else(|| SyncError::listener("Stream already taken"))?;

        let stream = async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        };

        Ok(Box::pin(stream))
    }

    fn channel(&self) -> &str {
        &self.channel
    }
}
