//! `capflow check` command implementation
//!
//! Loads the specification and runs every pre-read step for each capture:
//! spec, config validation, discovery, binding resolution and connector
//! validation. All captures are checked even when one fails.

use crate::error::{CliError, Result};
use capflow_runtime::{CaptureCatalog, RuntimeConfig};
use colored::Colorize;
use std::path::Path;

pub async fn run(config: &RuntimeConfig, spec: &Path, capture: Option<&str>) -> Result<()> {
    let catalog = CaptureCatalog::load(spec)?;
    let captures = catalog.select(capture)?;
    let orchestrator = super::dry_run_orchestrator(config)?;

    let mut failed = 0;
    for capture in &captures {
        match orchestrator.prepare(capture).await {
            Ok(prepared) => {
                println!("{} {}", "✓".green(), capture.name.bold());
                for binding in &prepared.plan.bindings {
                    println!(
                        "  {} → {} ({})",
                        binding.qualified_stream(),
                        binding.target.cyan(),
                        binding.sync_mode
                    );
                }
                for stream in &prepared.plan.disabled {
                    println!("  {}", format!("{} (disabled)", stream).dimmed());
                }
            },
            Err(e) => {
                failed += 1;
                println!("{} {}", "✗".red(), capture.name.bold());
                for line in e.to_string().lines() {
                    println!("  {}", line);
                }
            },
        }
    }

    if failed > 0 {
        return Err(CliError::CheckFailed {
            failed,
            total: captures.len(),
        });
    }
    Ok(())
}
