//! Capflow CLI Library
//!
//! Command-line interface for running captures.
//!
//! # Overview
//!
//! - **Checking**: Validate a capture specification end to end (`capflow check`)
//! - **Discovery**: Print a connector's streams as candidate bindings (`capflow discover`)
//! - **Running**: Run capture sessions until done or interrupted (`capflow run`)
//! - **Checkpoints**: Inspect and reset resume points (`capflow checkpoints`)

pub mod commands;
pub mod error;

// Re-export commonly used types
pub use error::{CliError, Result};

use capflow_runtime::RuntimeConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Capflow - connector orchestration and incremental capture
#[derive(Parser, Debug)]
#[command(name = "capflow")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// SQLite database holding checkpoints
    #[arg(long, env = "CAPFLOW_CHECKPOINT_DB", global = true)]
    pub checkpoint_db: Option<PathBuf>,

    /// Directory receiving JSON-lines collections
    #[arg(long, env = "CAPFLOW_OUTPUT_DIR", global = true)]
    pub output_dir: Option<PathBuf>,

    /// Program used to launch connector images (docker, podman, or an interpreter)
    #[arg(long, env = "CAPFLOW_CONNECTOR_PROGRAM", global = true)]
    pub connector_program: Option<String>,

    /// Container network for connectors
    #[arg(long, env = "CAPFLOW_DOCKER_NETWORK", global = true)]
    pub network: Option<String>,
}

impl Cli {
    /// Runtime configuration from the environment, overridden by flags
    pub fn runtime_config(&self) -> Result<RuntimeConfig> {
        let mut config = RuntimeConfig::from_env()?;

        if let Some(db) = &self.checkpoint_db {
            config.checkpoint_db = db.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(program) = &self.connector_program {
            config.connector_program = program.clone();
        }
        if let Some(network) = self.network.as_ref().filter(|n| !n.is_empty()) {
            config.docker_network = Some(network.clone());
        }
        if let Commands::Run {
            concurrency: Some(n),
            ..
        } = &self.command
        {
            config.max_concurrency = *n;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate captures without reading any data
    Check {
        /// Capture specification file
        spec: PathBuf,

        /// Only check this capture
        #[arg(short, long)]
        capture: Option<String>,
    },

    /// Print the streams of a capture's connector as candidate bindings
    Discover {
        /// Capture specification file
        spec: PathBuf,

        /// Capture to discover
        #[arg(short, long)]
        capture: String,
    },

    /// Run capture sessions
    Run {
        /// Capture specification file
        spec: PathBuf,

        /// Only run this capture
        #[arg(short, long)]
        capture: Option<String>,

        /// Bindings read at the same time
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Print session reports as JSON
        #[arg(long)]
        json: bool,

        /// Run each capture a single time, ignoring its interval
        #[arg(long)]
        once: bool,
    },

    /// Inspect and reset checkpoints
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointsCommand,
    },
}

/// Checkpoint subcommands
#[derive(Subcommand, Debug)]
pub enum CheckpointsCommand {
    /// List stored checkpoints
    List {
        /// Only list checkpoints of this capture
        capture: Option<String>,
    },

    /// Show one checkpoint
    Show {
        capture: String,
        stream: String,

        /// Stream namespace
        #[arg(long)]
        namespace: Option<String>,

        /// Backfill counter of the binding
        #[arg(long, default_value_t = 0)]
        backfill: u32,
    },

    /// Delete checkpoints so the next run starts over
    Reset {
        capture: String,

        /// Only reset this stream, across all of its backfills (defaults to
        /// every stream of the capture)
        stream: Option<String>,

        /// Stream namespace
        #[arg(long)]
        namespace: Option<String>,
    },
}
