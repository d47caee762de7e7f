//! # pg-es-core
//!
//! Core types, strategy traits, and utilities for forwarding PostgreSQL
//! change notifications into an Elasticsearch index.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐    ┌─────────┐    ┌──────────┐    ┌─────────────┐
//! │ EventSource │───►│ decode  │───►│ Enricher │───►│ IndexWriter │
//! │ (LISTEN)    │    │         │    │ optional │    │ (HTTP)      │
//! └─────────────┘    └─────────┘    └──────────┘    └─────────────┘
//!        ▲
//!        └── idle monitor probes liveness after a quiet window
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod strategy;

pub use self::config::*;
pub use error::*;
pub use event::*;
pub use self::metrics::*;
pub use strategy::*;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::ForwarderConfig;
    pub use crate::error::{FailureMode, Result, SyncError};
    pub use crate::event::{decode, Action, ChangeEvent, DocumentKey, IndexOperation, Notification};
    pub use crate::strategy::{
        Enricher, EventSource, HealthCheck, IndexRequest, IndexWriter, Lifecycle,
        NotificationStream, WriteOutcome,
    };
}
