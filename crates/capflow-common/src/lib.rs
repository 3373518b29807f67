//! Capflow Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the capflow workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used across all capflow workspace members:
//!
//! - **Error Handling**: Common error type and result alias
//! - **Logging**: Centralized `tracing` subscriber configuration
//! - **Retry**: Bounded exponential backoff for transient failures
//!
//! # Example
//!
//! ```no_run
//! use capflow_common::logging::{init_logging, LogConfig};
//! use capflow_common::retry::RetryPolicy;
//!
//! fn setup() -> anyhow::Result<RetryPolicy> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     Ok(RetryPolicy::default())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod retry;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use retry::RetryPolicy;
