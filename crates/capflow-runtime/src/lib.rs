//! Capflow Runtime
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Orchestrates source connectors and captures their output incrementally.
//!
//! # Overview
//!
//! - **Specifications**: captures, endpoints and bindings loaded from YAML
//! - **Connectors**: the `spec` / `discover` / `validate` / `read` protocol,
//!   in-process or as launched images speaking NDJSON
//! - **Validation**: endpoint and resource configs checked against the
//!   connector's JSON schemas, reporting every violation at once
//! - **Checkpoints**: monotonic per-binding resume points in SQLite
//! - **Sinks**: durable, append-only target collections
//!
//! # Example
//!
//! ```no_run
//! use capflow_runtime::{
//!     CaptureCatalog, CaptureOrchestrator, ConnectorRegistry, JsonlSink, ProcessConnectorFactory,
//!     RuntimeConfig, SessionOptions, SqliteCheckpointStore,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RuntimeConfig::from_env()?;
//!     let catalog = CaptureCatalog::load("flow.yaml")?;
//!     let orchestrator = CaptureOrchestrator::new(
//!         ConnectorRegistry::with_factory(ProcessConnectorFactory::new(config.launcher())),
//!         Arc::new(SqliteCheckpointStore::open(&config.checkpoint_db)?),
//!         Arc::new(JsonlSink::new(&config.output_dir)),
//!         SessionOptions::from_config(&config)?,
//!     );
//!
//!     for capture in catalog.select(None)? {
//!         let report = orchestrator.run(capture, CancellationToken::new()).await?;
//!         println!("{}: {}", report.capture, report.status);
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod resolver;
pub mod schema;
pub mod session;
pub mod sink;
pub mod spec;
pub mod state;

// Re-export commonly used types
pub use checkpoint::{
    Checkpoint, CheckpointKey, CheckpointStore, Cursor, MemoryCheckpointStore,
    SqliteCheckpointStore,
};
pub use config::RuntimeConfig;
pub use connector::{
    Connector, ConnectorFactory, ConnectorRegistry, MemoryConnector, ProcessConnectorFactory,
    ProcessLauncher,
};
pub use error::{ErrorKind, Result, RuntimeError};
pub use orchestrator::{CaptureOrchestrator, PreparedCapture, SessionOptions};
pub use protocol::{ConnectorError, ReadMessage, SyncMode};
pub use resolver::{BindingPlan, ResolvedBinding};
pub use schema::{ConfigValidationError, ValidatedConfig};
pub use session::{BindingOutcome, BindingReport, CaptureSession, SessionReport, SessionStatus};
pub use sink::{CollectionSink, JsonlSink, MemorySink};
pub use spec::{Binding, CaptureCatalog, CaptureSpec};
