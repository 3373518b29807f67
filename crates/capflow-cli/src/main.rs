//! Capflow CLI - Main entry point

use capflow_cli::Cli;
use capflow_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use clap::Parser;
use colored::Colorize;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // .env values feed the flags' `env` fallbacks
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Warn })
        .output(LogOutput::Console)
        .log_file_prefix("capflow")
        .build();

    // LOG_* variables take precedence
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);

    // The CLI works without logging
    let _guard = init_logging(&log_config).ok();

    if let Err(e) = capflow_cli::commands::execute(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("{} {}", "Error:".red().bold(), e);
        process::exit(e.exit_code());
    }
}
