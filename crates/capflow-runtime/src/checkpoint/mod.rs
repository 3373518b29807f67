//! Per-binding checkpoints
//!
//! A checkpoint is the connector's opaque resume state plus an optional ordered
//! cursor. Checkpoints exist only for incremental bindings and are keyed by
//! capture name, stream, namespace and the binding's backfill counter.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// Ordered position within a stream
///
/// Integers compare numerically. Strings compare chronologically when both sides
/// parse as RFC 3339 timestamps (or plain dates) and lexically when neither does.
/// An integer and a string are not comparable, nor are a timestamp and other text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cursor {
    Int(i64),
    Text(String),
}

impl Cursor {
    fn as_instant(text: &str) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }

    /// Build a cursor from an arbitrary JSON value (e.g. a `start_date` field)
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Cursor::Int),
            Value::String(s) => Some(Cursor::Text(s.clone())),
            _ => None,
        }
    }
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(Ordering::Equal)
    }
}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Cursor::Int(a), Cursor::Int(b)) => Some(a.cmp(b)),
            (Cursor::Text(a), Cursor::Text(b)) => {
                match (Cursor::as_instant(a), Cursor::as_instant(b)) {
                    (Some(x), Some(y)) => Some(x.cmp(&y)),
                    (None, None) => Some(a.cmp(b)),
                    _ => None,
                }
            },
            _ => None,
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::Int(n) => write!(f, "{}", n),
            Cursor::Text(s) => f.write_str(s),
        }
    }
}

/// Identity of a binding's checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub capture: String,
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub backfill: u32,
}

impl CheckpointKey {
    pub fn new(capture: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            capture: capture.into(),
            stream: stream.into(),
            namespace: None,
            backfill: 0,
        }
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_backfill(mut self, backfill: u32) -> Self {
        self.backfill = backfill;
        self
    }

    /// Whether `other` is an earlier backfill of the same binding
    pub fn supersedes(&self, other: &CheckpointKey) -> bool {
        self.capture == other.capture
            && self.stream == other.stream
            && self.namespace == other.namespace
            && other.backfill < self.backfill
    }
}

impl std::fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}#{}.{}", self.capture, ns, self.stream)?,
            None => write!(f, "{}#{}", self.capture, self.stream)?,
        }
        if self.backfill > 0 {
            write!(f, "@v{}", self.backfill)?;
        }
        Ok(())
    }
}

/// Durable resume point of an incremental binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Opaque connector state
    pub state: Value,
    /// Highest cursor committed so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    /// Records committed for this binding across all sessions
    pub records: u64,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(state: Value, cursor: Option<Cursor>, records: u64) -> Self {
        Self {
            state,
            cursor,
            records,
            updated_at: Utc::now(),
        }
    }
}

/// Checkpoint persistence failures
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Checkpoint database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Failed to encode checkpoint: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Checkpoint store error: {0}")]
    Store(String),
}

impl CheckpointError {
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}

/// Storage for binding checkpoints (dependency injection)
///
/// `persist` must be atomic per key: a reader observes either the previous
/// checkpoint or the new one, never a partial write.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a binding, if one exists
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Replace the checkpoint for a binding
    async fn persist(&self, key: &CheckpointKey, checkpoint: &Checkpoint)
        -> Result<(), CheckpointError>;

    /// Remove the checkpoint for a binding. Returns whether one existed.
    async fn clear(&self, key: &CheckpointKey) -> Result<bool, CheckpointError>;

    /// List stored checkpoints, optionally restricted to one capture
    async fn list(
        &self,
        capture: Option<&str>,
    ) -> Result<Vec<(CheckpointKey, Checkpoint)>, CheckpointError>;
}
