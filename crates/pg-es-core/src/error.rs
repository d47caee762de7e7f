//! Error types for the PostgreSQL to Elasticsearch forwarder
//!
//! Uses `thiserror` for ergonomic error handling with full context preservation.
//! Errors are split into a recoverable runtime tier (the event is dropped and
//! the loop continues) and an unrecoverable tier that ends the process. Which
//! transport failures fall in which tier depends on [`FailureMode`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias for forwarder operations
pub type Result<T> = std::result::Result<T, SyncError>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Primary error type for all forwarder operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Notification payload could not be parsed into a change event
    #[error("Malformed payload: {message}")]
    MalformedPayload {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Action string not recognised while strict action matching is on
    #[error("Unknown action '{action}'")]
    UnknownAction { action: String },

    /// No enrichment route configured for the table
    #[error("No enrichment route for table '{table}'")]
    RouteNotFound { table: String },

    /// Remote answered with a status outside [200, 300)
    #[error("HTTP {status} from {method} {url}: {body}")]
    HttpStatus {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    /// Request could not be delivered (connect failure, timeout, reset)
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Outbound request could not be built
    #[error("Request construction failed: {message}")]
    RequestConstruction {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Database connection or LISTEN setup failed
    #[error("Connection setup failed: {message}")]
    ConnectionSetup {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Failure reported by an already established listener
    #[error("Listener error: {message}")]
    Listener {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Upsert requested without a document body
    #[error("Refusing upsert of {key} without payload")]
    MissingPayload { key: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl SyncError {
    /// Create a malformed payload error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload {
            message: message.into(),
            source: None,
        }
    }

    /// Create a malformed payload error with source
    pub fn malformed_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::MalformedPayload {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a route-not-found error
    pub fn route_not_found(table: impl Into<String>) -> Self {
        Self::RouteNotFound {
            table: table.into(),
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a request construction error
    pub fn request(message: impl Into<String>) -> Self {
        Self::RequestConstruction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a request construction error with source
    pub fn request_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::RequestConstruction {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection setup error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConnectionSetup {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a listener error
    pub fn listener(message: impl Into<String>) -> Self {
        Self::Listener {
            message: message.into(),
            source: None,
        }
    }

    /// Create a listener error with source
    pub fn listener_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Listener {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error must terminate the process under `mode`
    pub fn is_fatal(&self, mode: FailureMode) -> bool {
        match self {
            Self::ConnectionSetup { .. } | Self::Configuration { .. } => true,
            Self::Transport { .. } | Self::RequestConstruction { .. } => {
                mode == FailureMode::FailFast
            }
            _ => false,
        }
    }

    /// Short label used as a metric dimension
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::UnknownAction { .. } => "unknown_action",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::HttpStatus { .. } => "http_status",
            Self::Transport { .. } => "transport",
            Self::RequestConstruction { .. } => "request_construction",
            Self::ConnectionSetup { .. } => "connection_setup",
            Self::Listener { .. } => "listener",
            Self::MissingPayload { .. } => "missing_payload",
            Self::Configuration { .. } => "configuration",
        }
    }
}

/// How transport-level failures are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Log the failure, drop the event and keep consuming
    #[default]
    Resilient,
    /// Treat request construction and transport failures as unrecoverable
    FailFast,
}

/// Error context for correlating failures with source rows
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: &'static str,
    pub table: Option<String>,
    pub row_id: Option<i64>,
    pub action: Option<String>,
}

impl ErrorContext {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            table: None,
            row_id: None,
            action: None,
        }
    }

    pub fn with_event(mut self, table: &str, row_id: i64, action: &str) -> Self {
        self.table = Some(table.to_string());
        self.row_id = Some(row_id);
        self.action = Some(action.to_string());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.component)?;
        if let Some(ref table) = self.table {
            write!(f, " table={}", table)?;
        }
        if let Some(id) = self.row_id {
            write!(f, " id={}", id)?;
        }
        if let Some(ref action) = self.action {
            write!(f, " action={}", action)?;
        }
        Ok(())
    }
}

/// Extension trait for logging errors with context before propagating
pub trait ErrorContextExt<T> {
    fn with_context(self, ctx: &ErrorContext) -> Result<T>;
}

impl<T> ErrorContextExt<T> for Result<T> {
    fn with_context(self, ctx: &ErrorContext) -> Result<T> {
        self.map_err(|e| {
            tracing::error!(
                error = %e,
                kind = e.kind(),
                component = ctx.component,
                table = ?ctx.table,
                row_id = ?ctx.row_id,
                action = ?ctx.action,
                "Operation failed"
            );
            e
        })
    }
}
