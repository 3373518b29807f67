//! `capflow discover` command implementation
//!
//! Prints the connector's catalog as YAML bindings ready to paste into the
//! capture specification.

use crate::error::Result;
use capflow_runtime::resolver::suggest_bindings;
use capflow_runtime::spec::BindingDef;
use capflow_runtime::{CaptureCatalog, RuntimeConfig};
use serde::Serialize;
use std::path::Path;
use tracing::info;

#[derive(Serialize)]
struct SuggestedBindings {
    bindings: Vec<BindingDef>,
}

pub async fn run(config: &RuntimeConfig, spec: &Path, capture: &str) -> Result<()> {
    let catalog = CaptureCatalog::load(spec)?;
    let orchestrator = super::dry_run_orchestrator(config)?;

    for capture in catalog.select(Some(capture))? {
        let discovered = orchestrator.discover(capture).await?;
        let bindings = suggest_bindings(&capture.name, &discovered);
        info!(capture = %capture.name, bindings = bindings.len(), "Suggesting bindings");

        print!("{}", serde_yaml::to_string(&SuggestedBindings { bindings })?);
    }
    Ok(())
}
