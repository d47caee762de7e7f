//! Strategy traits for the forwarder pipeline
//!
//! Each trait is a seam where an implementation can be swapped: the real
//! PostgreSQL listener against an in-memory channel, the HTTP index writer
//! against a recording fake, and so on.
//!
//! ```text
//! Lifecycle (start/stop)
//!     │
//!     ├── EventSource (delivers raw notifications)
//!     │       └── PgNotifySource, ChannelSource
//!     │
//!     └── IndexWriter (applies upserts/deletes)
//!             └── HttpIndexWriter
//!
//! Enricher (resolves the current row from an external API)
//!     └── EnrichmentResolver
//! ```

use crate::error::Result;
use crate::event::{Action, DocumentKey, Notification};
use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use std::pin::Pin;

/// Boxed async stream of notifications
///
/// Errors on the stream are failures reported by an established listener;
/// consumers log them and keep reading.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Result<Notification>> + Send>>;

// ============================================================================
// Lifecycle Management
// ============================================================================

/// Lifecycle management for components
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Start the component
    ///
    /// Called once before any operations. Failures here are setup failures.
    async fn start(&self) -> Result<()>;

    /// Stop the component gracefully
    async fn stop(&self) -> Result<()>;

    /// Check if the component is running
    fn is_running(&self) -> bool;
}

/// Health check capability
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Perform health check
    ///
    /// For event sources this is the liveness probe fired after an idle window.
    async fn health_check(&self) -> Result<()>;

    /// Get component name for health reporting
    fn component_name(&self) -> &'static str;
}

// ============================================================================
// Source
// ============================================================================

/// Change event source - delivers raw notifications in arrival order
#[async_trait]
pub trait EventSource: Lifecycle + HealthCheck {
    /// Stream notifications from the source
    ///
    /// Must be called after `start()`. Delivery order is preserved; no
    /// deduplication happens at this layer.
    async fn notifications(&self) -> Result<NotificationStream>;

    /// Name of the channel being watched
    fn channel(&self) -> &str;
}

// ============================================================================
// Enrichment
// ============================================================================

/// Resolves the authoritative current representation of a row
#[async_trait]
pub trait Enricher: Send + Sync {
    /// Fetch the row, replacing whatever payload the event carried
    ///
    /// Fails with `RouteNotFound` when the table has no configured endpoint.
    async fn resolve(&self, table: &str, row_id: i64) -> Result<Value>;
}

// ============================================================================
// Writer
// ============================================================================

/// A single change to apply to the index
#[derive(Debug, Clone, Copy)]
pub struct IndexRequest<'a> {
    pub table: &'a str,
    pub key: &'a DocumentKey,
    pub action: &'a Action,
    pub payload: Option<&'a Value>,
}

/// Result of applying one change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Acknowledged by the index
    Applied,
    /// Sent, then rejected or lost in transit
    Failed,
    /// Refused before any request was made, with the reason
    Skipped(&'static str),
}

/// Index writer strategy - applies one change at a time
#[async_trait]
pub trait IndexWriter: Lifecycle + HealthCheck {
    /// Apply an upsert or delete
    ///
    /// Non-fatal problems are logged and reported through [`WriteOutcome`].
    /// `Err` is reserved for failures that must stop the forwarder.
    async fn apply(&self, request: IndexRequest<'_>) -> Result<WriteOutcome>;
}
