//! Connector protocol messages
//!
//! Connectors answer four verbs: `spec`, `discover`, `validate` and `read`. Each
//! request is a single JSON document; each response is a sequence of
//! newline-delimited JSON messages, externally tagged by kind:
//!
//! ```text
//! {"spec": {"config_schema": {...}, "resource_schema": {...}}}
//! {"discovered": {"streams": [{"name": "clients", "supported_sync_modes": ["incremental"]}]}}
//! {"validated": {"status": "ok"}}
//! {"record": {"stream": "clients", "data": {...}}}
//! {"checkpoint": {"stream": "clients", "state": {...}, "cursor": "2024-02-01T00:00:00Z"}}
//! {"log": {"level": "info", "message": "fetched page 3"}}
//! {"error": {"message": "rate limited", "retryable": true}}
//! ```

use crate::checkpoint::Cursor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Extraction strategy for a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Re-read the whole stream on every run
    FullRefresh,
    /// Resume from the last persisted checkpoint
    Incremental,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::FullRefresh => "full_refresh",
            SyncMode::Incremental => "incremental",
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full_refresh" => Ok(SyncMode::FullRefresh),
            "incremental" => Ok(SyncMode::Incremental),
            other => Err(format!(
                "invalid sync mode '{}' (expected full_refresh or incremental)",
                other
            )),
        }
    }
}

/// Response to `spec`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecResponse {
    /// JSON schema of the endpoint configuration
    pub config_schema: Value,
    /// JSON schema of a binding's `resource` block, if the connector declares one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub documentation_url: Option<String>,
}

/// One stream of a connector's catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredStream {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// JSON schema of the stream's documents
    #[serde(default = "empty_schema")]
    pub json_schema: Value,
    pub supported_sync_modes: Vec<SyncMode>,
    #[serde(default)]
    pub source_defined_cursor: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default_cursor_field: Vec<String>,
    /// JSON pointers of the document key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key: Vec<String>,
}

fn empty_schema() -> Value {
    Value::Object(serde_json::Map::new())
}

impl DiscoveredStream {
    pub fn supports(&self, mode: SyncMode) -> bool {
        self.supported_sync_modes.contains(&mode)
    }

    /// Preferred sync mode when proposing a binding for this stream
    pub fn recommended_sync_mode(&self) -> SyncMode {
        if self.supports(SyncMode::Incremental) {
            SyncMode::Incremental
        } else {
            SyncMode::FullRefresh
        }
    }
}

/// Response to `discover`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoverResponse {
    pub streams: Vec<DiscoveredStream>,
}

/// Outcome reported by the connector's own `validate`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Ok,
    Failed,
}

/// Response to `validate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateResponse {
    pub status: ValidationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidateResponse {
    pub fn ok() -> Self {
        Self {
            status: ValidationStatus::Ok,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ValidationStatus::Failed,
            message: Some(message.into()),
        }
    }
}

/// A binding as sent to the connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingRequest {
    pub stream: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub sync_mode: SyncMode,
    /// Full `resource` block from the capture specification
    pub resource: Value,
    pub target: String,
}

/// Request for `validate`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub capture: String,
    pub config: Value,
    pub bindings: Vec<BindingRequest>,
}

/// Request for `read`, scoped to one binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub capture: String,
    pub config: Value,
    pub binding: BindingRequest,
    /// Connector state from the last persisted checkpoint (incremental only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    /// Lower bound for the first incremental read when no checkpoint exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_cursor: Option<Cursor>,
}

/// Envelope of a connector request on stdin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorRequest {
    Spec {},
    Discover { config: Value },
    Validate(ValidateRequest),
    Read(ReadRequest),
}

impl ConnectorRequest {
    /// Verb passed as the connector's command-line argument
    pub fn verb(&self) -> &'static str {
        match self {
            ConnectorRequest::Spec {} => "spec",
            ConnectorRequest::Discover { .. } => "discover",
            ConnectorRequest::Validate(_) => "validate",
            ConnectorRequest::Read(_) => "read",
        }
    }
}

/// A captured document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMessage {
    pub stream: String,
    pub data: Value,
}

/// Progress marker emitted after a consistent group of records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMessage {
    /// Stream the checkpoint belongs to; defaults to the binding being read
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
    /// Opaque connector state
    #[serde(default)]
    pub state: Value,
    /// Ordered position reached by this checkpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    /// `state` is an RFC 7396 merge patch over the previous state
    #[serde(default)]
    pub merge: bool,
}

/// Connector log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub message: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Connector-reported failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

/// Envelope of one connector output line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorMessage {
    Spec(SpecResponse),
    Discovered(DiscoverResponse),
    Validated(ValidateResponse),
    Record(RecordMessage),
    Checkpoint(CheckpointMessage),
    Log(LogMessage),
    Error(ErrorMessage),
}

impl ConnectorMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectorMessage::Spec(_) => "spec",
            ConnectorMessage::Discovered(_) => "discovered",
            ConnectorMessage::Validated(_) => "validated",
            ConnectorMessage::Record(_) => "record",
            ConnectorMessage::Checkpoint(_) => "checkpoint",
            ConnectorMessage::Log(_) => "log",
            ConnectorMessage::Error(_) => "error",
        }
    }
}

/// Message yielded by a `read` stream
#[derive(Debug, Clone, PartialEq)]
pub enum ReadMessage {
    Record(RecordMessage),
    Checkpoint(CheckpointMessage),
}

impl ReadMessage {
    pub fn record(stream: impl Into<String>, data: Value) -> Self {
        ReadMessage::Record(RecordMessage {
            stream: stream.into(),
            data,
        })
    }

    pub fn checkpoint(state: Value, cursor: Option<Cursor>) -> Self {
        ReadMessage::Checkpoint(CheckpointMessage {
            stream: None,
            state,
            cursor,
            merge: false,
        })
    }
}

/// Failures at the connector boundary
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// Malformed or unexpected connector output
    #[error("Connector protocol error: {0}")]
    Protocol(String),

    /// Network or API failure that may succeed on retry
    #[error("Transient connector error: {0}")]
    Transient(String),

    /// Connector reported a failure or exited unsuccessfully
    #[error("Connector failed: {0}")]
    Failed(String),

    /// The connector process could not be started
    #[error("Failed to launch connector '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConnectorError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

impl From<ErrorMessage> for ConnectorError {
    fn from(err: ErrorMessage) -> Self {
        if err.retryable {
            ConnectorError::Transient(err.message)
        } else {
            ConnectorError::Failed(err.message)
        }
    }
}
