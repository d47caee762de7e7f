//! Configuration types for the forwarder
//!
//! Uses the `config` crate for layered configuration from files and environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::{FailureMode, Result, SyncError};

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Change event source
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Target search index
    #[serde(default)]
    pub index: IndexConfig,

    /// Optional enrichment hop
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Treatment of transport-level failures
    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Reject actions other than INSERT/UPDATE/DELETE instead of upserting
    #[serde(default)]
    pub strict_actions: bool,

    /// Logging
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ============================================================================
// Listener Configuration
// ============================================================================

/// PostgreSQL LISTEN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// libpq-style connection string or postgres:// URL
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Notification channel
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Silence tolerated before probing the connection
    #[serde(with = "humantime_serde", default = "default_idle_window")]
    pub idle_window: Duration,

    /// First reconnect delay after a lost connection
    #[serde(with = "humantime_serde", default = "default_reconnect_min")]
    pub reconnect_min: Duration,

    /// Upper bound for the reconnect delay
    #[serde(with = "humantime_serde", default = "default_reconnect_max")]
    pub reconnect_max: Duration,

    /// Notifications held between the listener and the forwarder; when full,
    /// the listener stops reading and PostgreSQL queues them server-side
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

fn default_database_url() -> String {
    "host=localhost port=5432 user=postgres dbname=postgres sslmode=disable".to_string()
}

fn default_channel() -> String {
    "events".to_string()
}

fn default_idle_window() -> Duration {
    Duration::from_secs(90)
}

fn default_reconnect_min() -> Duration {
    Duration::from_secs(10)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(60)
}

fn default_notification_buffer() -> usize {
    1024
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            channel: default_channel(),
            idle_window: default_idle_window(),
            reconnect_min: default_reconnect_min(),
            reconnect_max: default_reconnect_max(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

// ============================================================================
// Index Configuration
// ============================================================================

/// Elasticsearch target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Base URL of the index store
    #[serde(default = "default_index_url")]
    pub base_url: String,

    /// Path between base URL and document key; `{table}` is substituted
    ///
    /// `{table}/data` addresses `/{table}/data/{key}`; a fixed value such as
    /// `app/doc` sends every table to one index.
    #[serde(default = "default_path_template")]
    pub path_template: String,

    /// Optional username for basic authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Optional password for basic authentication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Optional API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Connection timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Per-request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

fn default_index_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_path_template() -> String {
    "{table}/data".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            base_url: default_index_url(),
            path_template: default_path_template(),
            username: None,
            password: None,
            api_key: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

// ============================================================================
// Enrichment Configuration
// ============================================================================

/// External API enrichment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Resolve every upsert through the routing table
    #[serde(default)]
    pub enabled: bool,

    /// Table routing file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes_path: Option<String>,

    /// Connection timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Per-request timeout
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            routes_path: None,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "json" or "pretty"
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

// ============================================================================
// Configuration Loading
// ============================================================================

impl ForwarderConfig {
    /// Load configuration from file and environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default values
        builder = builder.add_source(config::Config::try_from(&Self::default())?);

        // Add config file if specified
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        // Add environment variables with prefix PG_ES_SYNC_
        builder = builder.add_source(
            config::Environment::with_prefix("PG_ES_SYNC")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Check values that would otherwise only fail once events arrive
    pub fn validate(&self) -> Result<()> {
        if self.listener.channel.trim().is_empty() {
            return Err(SyncError::config("listener.channel must not be empty"));
        }
        if self.listener.idle_window.is_zero() {
            return Err(SyncError::config("listener.idle_window must be positive"));
        }
        if self.listener.reconnect_min > self.listener.reconnect_max {
            return Err(SyncError::config(
                "listener.reconnect_min must not exceed listener.reconnect_max",
            ));
        }
        if self.listener.notification_buffer == 0 {
            return Err(SyncError::config(
                "listener.notification_buffer must be positive",
            ));
        }

        Url::parse(&self.index.base_url).map_err(|e| {
            SyncError::config(format!("index.base_url '{}': {}", self.index.base_url, e))
        })?;

        if self.enrichment.enabled && self.enrichment.routes_path.is_none() {
            return Err(SyncError::config(
                "enrichment.routes_path is required when enrichment is enabled",
            ));
        }

        Ok(())
    }
}
