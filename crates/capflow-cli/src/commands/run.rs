//! `capflow run` command implementation
//!
//! Runs the selected captures side by side. A capture with an `interval` is
//! re-run that long after each session until interrupted, unless `--once` is
//! given. Ctrl-C cancels the running sessions; bindings stop after their
//! current commit.

use crate::error::{CliError, Result};
use anyhow::Context;
use capflow_runtime::{
    BindingOutcome, CaptureCatalog, CaptureOrchestrator, CaptureSpec, RuntimeConfig,
    SessionReport, SessionStatus,
};
use colored::Colorize;
use futures::future::join_all;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

pub async fn run(
    config: &RuntimeConfig,
    spec: &Path,
    capture: Option<&str>,
    json: bool,
    once: bool,
) -> Result<()> {
    let catalog = CaptureCatalog::load(spec)?;
    let captures = catalog.select(capture)?;
    let orchestrator = super::orchestrator(config)?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    let signals = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping capture");
            interrupt.cancel();
        }
    });

    let finished = join_all(
        captures
            .iter()
            .map(|capture| run_capture(&orchestrator, capture, cancel.clone(), json, once)),
    )
    .await;
    signals.abort();

    let unfinished: Vec<&str> = captures
        .iter()
        .zip(finished)
        .filter(|(_, ok)| !ok)
        .map(|(capture, _)| capture.name.as_str())
        .collect();

    if cancel.is_cancelled() {
        return Err(CliError::Cancelled);
    }
    if !unfinished.is_empty() {
        return Err(CliError::SessionsFailed(unfinished.join(", ")));
    }
    Ok(())
}

/// Whether the capture's last session completed
async fn run_capture(
    orchestrator: &CaptureOrchestrator,
    capture: &CaptureSpec,
    cancel: CancellationToken,
    json: bool,
    once: bool,
) -> bool {
    let print = |report: &SessionReport| {
        if let Err(e) = print_report(report, json) {
            error!(capture = %report.capture, error = %e, "Failed to print session report");
        }
    };

    let result = if once || capture.interval.is_none() {
        orchestrator.run(capture, cancel).await.map(|report| {
            print(&report);
            report
        })
    } else {
        orchestrator.run_on_interval(capture, cancel, print).await
    };

    match result {
        Ok(report) => report.is_success(),
        Err(e) => {
            error!(capture = %capture.name, error = %e, "Capture could not start");
            eprintln!("{} {}: {}", "✗".red(), capture.name.bold(), e);
            false
        },
    }
}

fn print_report(report: &SessionReport, json: bool) -> Result<()> {
    if json {
        let rendered =
            serde_json::to_string(report).context("Failed to serialize session report")?;
        println!("{}", rendered);
        return Ok(());
    }

    let status = match report.status {
        SessionStatus::Completed => report.status.as_str().green(),
        SessionStatus::Failed => report.status.as_str().red(),
        SessionStatus::Cancelled => report.status.as_str().yellow(),
    };
    println!("{} {} ({})", report.capture.bold(), status, report.session_id);

    for binding in &report.bindings {
        let outcome = match &binding.outcome {
            BindingOutcome::Completed => "completed".green().to_string(),
            BindingOutcome::Cancelled => "cancelled".yellow().to_string(),
            BindingOutcome::Failed { kind, message } => {
                format!("{} [{}] {}", "failed".red(), kind, message)
            },
        };
        println!(
            "  {} → {}  {}  {} records, {} commits",
            binding.stream,
            binding.target.cyan(),
            outcome,
            binding.records_forwarded,
            binding.commits
        );
        if let Some(checkpoint) = &binding.resume_checkpoint {
            let cursor = checkpoint
                .cursor
                .as_ref()
                .map_or_else(|| "-".to_string(), |c| c.to_string());
            println!("    resume at cursor {}", cursor.dimmed());
        }
    }
    for stream in &report.disabled {
        println!("  {}", format!("{} (disabled)", stream).dimmed());
    }
    Ok(())
}
