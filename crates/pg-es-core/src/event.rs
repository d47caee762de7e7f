//! Change event model and decoder
//!
//! A [`Notification`] is what the database delivers on the watched channel.
//! [`decode`] turns its payload into a [`ChangeEvent`], the unit of work that
//! flows through the forwarder. Events are immutable once decoded.
//!
//! Wire shape of a payload:
//!
//! ```json
//! {"table": "users", "id": 42, "action": "UPDATE", "data": {"name": "Ana"}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, Level};

use crate::error::{Result, SyncError};

/// Raw notification received from the change channel
#[derive(Debug, Clone)]
pub struct Notification {
    /// Channel the notification was published on
    pub channel: String,
    /// Opaque textual payload
    pub payload: String,
    /// Backend process that issued the NOTIFY
    pub process_id: i32,
    /// Local receive time
    pub received_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>, process_id: i32) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            process_id,
            received_at: Utc::now(),
        }
    }
}

/// Row-level action reported by the source trigger
///
/// Matching is exact: only the literal `DELETE` removes a document, every
/// other value (including unrecognised ones) is an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    Insert,
    Update,
    Delete,
    Other(String),
}

impl Action {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "INSERT" => Self::Insert,
            "UPDATE" => Self::Update,
            "DELETE" => Self::Delete,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Other(raw) => raw,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Self::Delete)
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// Index operation this action maps to
    pub fn operation(&self) -> IndexOperation {
        if self.is_delete() {
            IndexOperation::Delete
        } else {
            IndexOperation::Upsert
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Action {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Operation applied to the search index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexOperation {
    /// Full document replace
    Upsert,
    /// Delete by id
    Delete,
}

impl IndexOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upsert => "upsert",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for IndexOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Index document identifier derived from `(table, row id)`
///
/// Format: `{table}_{row_id}`. The row id never contains `_`, so the last
/// separator always splits the two parts and distinct pairs yield distinct
/// keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn new(table: &str, row_id: i64) -> Self {
        Self(format!("{}_{}", table, row_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DocumentKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Decoded row change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    /// Source relation
    pub table: String,
    /// Row identifier, unique within `table`
    pub row_id: i64,
    /// Reported action
    pub action: Action,
    /// Row data embedded by the trigger, if any
    pub payload: Option<Value>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, row_id: i64, action: Action, payload: Option<Value>) -> Self {
        Self {
            table: table.into(),
            row_id,
            action,
            payload,
        }
    }

    pub fn document_key(&self) -> DocumentKey {
        DocumentKey::new(&self.table, self.row_id)
    }

    pub fn operation(&self) -> IndexOperation {
        self.action.operation()
    }
}

#[derive(Deserialize)]
struct WireEvent {
    table: String,
    id: i64,
    action: Action,
    #[serde(default)]
    data: Option<Value>,
}

/// Decode a raw notification payload
///
/// Fails with [`SyncError::MalformedPayload`] when the payload is not JSON,
/// when a required field is missing or mistyped, or when `table` is empty.
pub fn decode(raw: &[u8]) -> Result<ChangeEvent> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| SyncError::malformed_with_source("payload is not valid JSON", e))?;

    if tracing::enabled!(Level::DEBUG) {
        let pretty = serde_json::to_string_pretty(&value).unwrap_or_default();
        debug!(payload = %pretty, "Incoming notification");
    }

    let wire: WireEvent = serde_json::from_value(value)
        .map_err(|e| SyncError::malformed_with_source("payload fields missing or invalid", e))?;

    if wire.table.is_empty() {
        return Err(SyncError::malformed("table must not be empty"));
    }

    // Triggers send `"data": null` for deletes
    let payload = wire.data.filter(|v| !v.is_null());

    Ok(ChangeEvent::new(wire.table, wire.id, wire.action, payload))
}
