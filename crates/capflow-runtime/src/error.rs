//! Runtime error taxonomy
//!
//! Each module owns the error type of its own failures; [`RuntimeError`] gathers
//! them and [`ErrorKind`] classifies them for reporting and retry decisions.

use crate::checkpoint::CheckpointError;
use crate::protocol::ConnectorError;
use crate::resolver::BindingResolutionError;
use crate::schema::{ConfigValidationError, SchemaError};
use crate::sink::SinkError;
use crate::spec::SpecError;
use crate::state::StateError;
use serde::Serialize;
use thiserror::Error;

/// Result type alias for runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    ConfigValidation(#[from] ConfigValidationError),

    #[error(transparent)]
    BindingResolution(#[from] BindingResolutionError),

    #[error("Connector declared an unusable {which} schema: {source}")]
    InvalidSchema {
        which: &'static str,
        #[source]
        source: SchemaError,
    },

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("No connector available for image '{0}'")]
    UnknownConnector(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture session cancelled")]
    Cancelled,
}

/// Error classes surfaced to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Spec,
    ConfigValidation,
    BindingResolution,
    ConnectorProtocol,
    TransientIo,
    ConnectorFailed,
    CheckpointPersistence,
    Sink,
    Config,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Spec => "spec",
            ErrorKind::ConfigValidation => "config_validation",
            ErrorKind::BindingResolution => "binding_resolution",
            ErrorKind::ConnectorProtocol => "connector_protocol",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::ConnectorFailed => "connector_failed",
            ErrorKind::CheckpointPersistence => "checkpoint_persistence",
            ErrorKind::Sink => "sink",
            ErrorKind::Config => "config",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RuntimeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Spec(_) => ErrorKind::Spec,
            RuntimeError::ConfigValidation(_) => ErrorKind::ConfigValidation,
            RuntimeError::BindingResolution(_) => ErrorKind::BindingResolution,
            RuntimeError::InvalidSchema { .. } | RuntimeError::State(_) => {
                ErrorKind::ConnectorProtocol
            },
            RuntimeError::Connector(err) => match err {
                ConnectorError::Protocol(_) => ErrorKind::ConnectorProtocol,
                ConnectorError::Transient(_) => ErrorKind::TransientIo,
                ConnectorError::Failed(_) | ConnectorError::Launch { .. } => {
                    ErrorKind::ConnectorFailed
                },
            },
            RuntimeError::Checkpoint(_) => ErrorKind::CheckpointPersistence,
            RuntimeError::Sink(_) => ErrorKind::Sink,
            RuntimeError::UnknownConnector(_) | RuntimeError::Config(_) => ErrorKind::Config,
            RuntimeError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying from the last checkpoint may succeed
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}
