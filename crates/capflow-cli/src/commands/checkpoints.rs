//! `capflow checkpoints` command implementation

use crate::error::{CliError, Result};
use capflow_runtime::{CheckpointKey, CheckpointStore, RuntimeConfig, SqliteCheckpointStore};
use colored::Colorize;

fn open(config: &RuntimeConfig) -> Result<SqliteCheckpointStore> {
    Ok(SqliteCheckpointStore::open(&config.checkpoint_db)?)
}

/// List stored checkpoints
pub async fn list(config: &RuntimeConfig, capture: Option<&str>) -> Result<()> {
    let store = open(config)?;
    let checkpoints = store.list(capture).await?;

    if checkpoints.is_empty() {
        println!("No checkpoints stored.");
        return Ok(());
    }

    for (key, checkpoint) in &checkpoints {
        let cursor = checkpoint
            .cursor
            .as_ref()
            .map_or_else(|| "-".to_string(), |c| c.to_string());
        println!(
            "{}  cursor {}  {} records  updated {}",
            key.to_string().green(),
            cursor,
            checkpoint.records,
            checkpoint.updated_at.to_rfc3339()
        );
    }
    println!();
    println!("{} {}", "Total:".cyan().bold(), checkpoints.len());
    Ok(())
}

/// Print one checkpoint as JSON
pub async fn show(
    config: &RuntimeConfig,
    capture: &str,
    stream: &str,
    namespace: Option<String>,
    backfill: u32,
) -> Result<()> {
    let store = open(config)?;
    let key = CheckpointKey::new(capture, stream)
        .with_namespace(namespace)
        .with_backfill(backfill);

    let checkpoint = store
        .load(&key)
        .await?
        .ok_or_else(|| CliError::CheckpointNotFound(key.to_string()))?;
    println!("{}", serde_json::to_string_pretty(&checkpoint)?);
    Ok(())
}

/// Delete the checkpoints of one stream, or every checkpoint of a capture
pub async fn reset(
    config: &RuntimeConfig,
    capture: &str,
    stream: Option<&str>,
    namespace: Option<String>,
) -> Result<()> {
    let store = open(config)?;

    let keys: Vec<CheckpointKey> = store
        .list(Some(capture))
        .await?
        .into_iter()
        .map(|(key, _)| key)
        .filter(|key| match stream {
            Some(stream) => key.stream == stream && key.namespace == namespace,
            None => true,
        })
        .collect();

    let mut cleared = 0;
    for key in &keys {
        if store.clear(key).await? {
            println!("Reset {}", key.to_string().green());
            cleared += 1;
        }
    }

    if cleared == 0 {
        println!("No checkpoints to reset for {}.", capture);
    }
    Ok(())
}
