//! CLI command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod check;
pub mod checkpoints;
pub mod discover;
pub mod run;

use crate::error::Result;
use crate::{CheckpointsCommand, Cli, Commands};
use capflow_runtime::{
    CaptureOrchestrator, ConnectorRegistry, JsonlSink, MemoryCheckpointStore, MemorySink,
    ProcessConnectorFactory, RuntimeConfig, SessionOptions, SqliteCheckpointStore,
};
use std::sync::Arc;

/// Execute the CLI command
pub async fn execute(cli: &Cli) -> Result<()> {
    let config = cli.runtime_config()?;

    match &cli.command {
        Commands::Check { spec, capture } => check::run(&config, spec, capture.as_deref()).await,

        Commands::Discover { spec, capture } => discover::run(&config, spec, capture).await,

        Commands::Run {
            spec,
            capture,
            json,
            once,
            ..
        } => run::run(&config, spec, capture.as_deref(), *json, *once).await,

        Commands::Checkpoints { command } => match command {
            CheckpointsCommand::List { capture } => checkpoints::list(&config, capture.as_deref()).await,
            CheckpointsCommand::Show {
                capture,
                stream,
                namespace,
                backfill,
            } => checkpoints::show(&config, capture, stream, namespace.clone(), *backfill).await,
            CheckpointsCommand::Reset {
                capture,
                stream,
                namespace,
            } => {
                checkpoints::reset(&config, capture, stream.as_deref(), namespace.clone()).await
            },
        },
    }
}

fn registry(config: &RuntimeConfig) -> ConnectorRegistry {
    ConnectorRegistry::with_factory(ProcessConnectorFactory::new(config.launcher()))
}

/// Orchestrator writing collections and checkpoints to disk
pub(crate) fn orchestrator(config: &RuntimeConfig) -> Result<CaptureOrchestrator> {
    Ok(CaptureOrchestrator::new(
        registry(config),
        Arc::new(SqliteCheckpointStore::open(&config.checkpoint_db)?),
        Arc::new(JsonlSink::new(&config.output_dir)),
        SessionOptions::from_config(config)?,
    ))
}

/// Orchestrator for commands that never read, so nothing touches the disk
pub(crate) fn dry_run_orchestrator(config: &RuntimeConfig) -> Result<CaptureOrchestrator> {
    Ok(CaptureOrchestrator::new(
        registry(config),
        Arc::new(MemoryCheckpointStore::new()),
        Arc::new(MemorySink::new()),
        SessionOptions::from_config(config)?,
    ))
}
