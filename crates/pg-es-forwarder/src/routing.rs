//! Table routing for the enrichment hop
//!
//! Maps a table name to the API endpoint that serves its current rows. The
//! format follows the file extension (`.json`, `.toml`, otherwise YAML) and
//! table names keep their case:
//!
//! ```yaml
//! key: s3cret
//! auth_header: gateway
//! routes:
//!   users:
//!     url: http://api.internal/users/
//!     accept: application/vnd.users+json
//! ```
//!
//! The loaded table is an immutable snapshot. [`RoutingTable::reload`] swaps
//! in a new snapshot; lookups already in flight keep the one they started with.

use pg_es_core::prelude::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Endpoint serving one table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
    /// Prefix the row id is appended to
    pub url: String,

    /// Sent as the `Accept` header
    #[serde(default = "default_accept")]
    pub accept: String,
}

fn default_accept() -> String {
    "application/json".to_string()
}

fn default_auth_header() -> String {
    "gateway".to_string()
}

/// One immutable view of the routing file
#[derive(Debug, Clone, Deserialize)]
pub struct Routes {
    /// Shared credential sent on every enrichment request
    #[serde(default)]
    pub key: String,

    /// Header carrying `key`
    #[serde(default = "default_auth_header")]
    pub auth_header: String,

    #[serde(default)]
    pub routes: HashMap<String, Route>,
}

impl Default for Routes {
    fn default() -> Self {
        Self {
            key: String::new(),
            auth_header: default_auth_header(),
            routes: HashMap::new(),
        }
    }
}

impl Routes {
    /// Route for `table`, matched exactly
    pub fn route(&self, table: &str) -> Option<&Route> {
        self.routes.get(table)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| invalid(path, e))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(|e| invalid(path, e)),
            Some("toml") => toml::from_str(&content).map_err(|e| invalid(path, e)),
            _ => serde_yaml::from_str(&content).map_err(|e| invalid(path, e)),
        }
    }
}

fn invalid(path: &Path, e: impl std::fmt::Display) -> SyncError {
    SyncError::config(format!("routing file {}: {}", path.display(), e))
}

/// Reloadable routing table
#[derive(Debug)]
pub struct RoutingTable {
    path: Option<PathBuf>,
    current: RwLock<Arc<Routes>>,
}

impl RoutingTable {
    /// Load from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let routes = Routes::read(&path)?;
        info!(path = %path.display(), tables = routes.len(), "Loaded routing table");

        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(routes)),
        })
    }

    /// Fixed table with no backing file
    pub fn from_routes(routes: Routes) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(routes)),
        }
    }

    /// Current snapshot
    pub async fn snapshot(&self) -> Arc<Routes> {
        self.current.read().await.clone()
    }

    /// Re-read the backing file
    ///
    /// On failure the previous snapshot stays in effect.
    pub async fn reload(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        match Routes::read(path) {
            Ok(routes) => {
                info!(path = %path.display(), tables = routes.len(), "Reloaded routing table");
                *self.current.write().await = Arc::new(routes);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Routing reload failed, keeping previous table");
                Err(e)
            }
        }
    }
}
