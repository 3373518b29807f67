//! Error types for the capflow CLI
//!
//! Messages are user-facing and end with a hint on how to proceed.

use capflow_runtime::checkpoint::CheckpointError;
use capflow_runtime::spec::SpecError;
use capflow_runtime::{ErrorKind, RuntimeError};
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Capture specification could not be loaded
    #[error("Invalid capture specification: {0}. Fix the file and run 'capflow check' to verify it.")]
    Spec(#[from] SpecError),

    #[error("{0}{hint}", hint = runtime_hint(.0))]
    Runtime(#[from] RuntimeError),

    /// Checkpoint database could not be opened or updated
    #[error("Checkpoint database error: {0}. Check that CAPFLOW_CHECKPOINT_DB points to a writable location.")]
    Checkpoint(#[from] CheckpointError),

    #[error("No checkpoint stored for {0}. Run 'capflow checkpoints list' to see stored checkpoints.")]
    CheckpointNotFound(String),

    #[error("{failed} of {total} captures failed the check.")]
    CheckFailed { failed: usize, total: usize },

    #[error("Capture sessions did not complete: {0}. Bindings resume from their last checkpoint on the next run.")]
    SessionsFailed(String),

    #[error("Interrupted. Bindings resume from their last checkpoint on the next run.")]
    Cancelled,

    #[error("Failed to render YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to render JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn runtime_hint(err: &RuntimeError) -> &'static str {
    match err.kind() {
        ErrorKind::ConfigValidation => {
            "\nUpdate the configuration above and run 'capflow check' again."
        },
        ErrorKind::BindingResolution => {
            "\nRun 'capflow discover' to list the streams the connector offers."
        },
        ErrorKind::Config => ". Check the CAPFLOW_* environment variables and the capture's image.",
        ErrorKind::TransientIo => ". The connector kept failing; the next run resumes from the last checkpoint.",
        _ => "",
    }
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Cancelled => 130,
            _ => 1,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_errors_carry_hints() {
        let err: CliError = RuntimeError::UnknownConnector("ghcr.io/x:v1".to_string()).into();
        let message = err.to_string();
        assert!(message.starts_with("No connector available for image 'ghcr.io/x:v1'"));
        assert!(message.contains("CAPFLOW_"));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_cancelled_exit_code() {
        assert_eq!(CliError::Cancelled.exit_code(), 130);
    }
}
