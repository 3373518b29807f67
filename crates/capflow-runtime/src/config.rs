//! Runtime configuration
//!
//! Loaded from `CAPFLOW_*` environment variables (a `.env` file is honored),
//! falling back to the defaults below.

use crate::connector::ProcessLauncher;
use crate::error::{Result, RuntimeError};
use capflow_common::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Runtime Configuration Constants
// ============================================================================

/// Default number of bindings read concurrently.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default read attempts per binding, counting the first one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = capflow_common::retry::DEFAULT_MAX_ATTEMPTS;

/// Default delay before the first retry in milliseconds.
pub const DEFAULT_RETRY_INITIAL_BACKOFF_MS: u64 = capflow_common::retry::DEFAULT_INITIAL_BACKOFF_MS;

/// Default upper bound on retry delay in milliseconds.
pub const DEFAULT_RETRY_MAX_BACKOFF_MS: u64 = capflow_common::retry::DEFAULT_MAX_BACKOFF_MS;

/// Default checkpoint database location.
pub const DEFAULT_CHECKPOINT_DB: &str = "./capflow-checkpoints.db";

/// Default directory for JSON-lines collections.
pub const DEFAULT_OUTPUT_DIR: &str = "./collections";

/// Default program used to launch connector images.
pub const DEFAULT_CONNECTOR_PROGRAM: &str = "docker";

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub max_concurrency: usize,
    pub max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub checkpoint_db: PathBuf,
    pub output_dir: PathBuf,
    pub connector_program: String,
    pub docker_network: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_initial_backoff_ms: DEFAULT_RETRY_INITIAL_BACKOFF_MS,
            retry_max_backoff_ms: DEFAULT_RETRY_MAX_BACKOFF_MS,
            checkpoint_db: PathBuf::from(DEFAULT_CHECKPOINT_DB),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            connector_program: DEFAULT_CONNECTOR_PROGRAM.to_string(),
            docker_network: None,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from the environment and defaults
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            max_concurrency: parse_var(&lookup, "CAPFLOW_MAX_CONCURRENCY")?
                .unwrap_or(defaults.max_concurrency),
            max_attempts: parse_var(&lookup, "CAPFLOW_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            retry_initial_backoff_ms: parse_var(&lookup, "CAPFLOW_RETRY_INITIAL_BACKOFF_MS")?
                .unwrap_or(defaults.retry_initial_backoff_ms),
            retry_max_backoff_ms: parse_var(&lookup, "CAPFLOW_RETRY_MAX_BACKOFF_MS")?
                .unwrap_or(defaults.retry_max_backoff_ms),
            checkpoint_db: lookup("CAPFLOW_CHECKPOINT_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_db),
            output_dir: lookup("CAPFLOW_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            connector_program: lookup("CAPFLOW_CONNECTOR_PROGRAM")
                .unwrap_or(defaults.connector_program),
            docker_network: lookup("CAPFLOW_DOCKER_NETWORK").filter(|s| !s.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(RuntimeError::config("max_concurrency must be greater than 0"));
        }

        if self.connector_program.trim().is_empty() {
            return Err(RuntimeError::config("connector program cannot be empty"));
        }

        self.retry_policy()?;
        Ok(())
    }

    /// Retry policy for transient connector failures
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_initial_backoff_ms),
            Duration::from_millis(self.retry_max_backoff_ms),
        )
        .map_err(|e| RuntimeError::config(e.to_string()))
    }

    pub fn launcher(&self) -> ProcessLauncher {
        ProcessLauncher::new(self.connector_program.clone()).with_network(self.docker_network.clone())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| RuntimeError::config(format!("{}='{}' is invalid: {}", key, raw, e))),
    }
}
