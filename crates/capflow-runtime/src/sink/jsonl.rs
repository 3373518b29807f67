//! JSON-lines files on local disk
//!
//! Collection `acmeCo/clients` is written to `<root>/acmeCo/clients.jsonl`, one
//! document per line.

use super::{CollectionSink, SinkError};
use crate::spec::validate_collection_name;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

/// Appends documents to `<root>/<collection>.jsonl`, fsyncing every batch
pub struct JsonlSink {
    root: PathBuf,
    /// Serializes appends per file
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl JsonlSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// File backing `collection`
    pub fn path_for(&self, collection: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", collection))
    }

    fn lock_for(&self, collection: &str) -> Arc<Mutex<()>> {
        match self.locks.lock() {
            Ok(mut locks) => locks.entry(collection.to_string()).or_default().clone(),
            // A poisoned map only loses serialization between writers
            Err(_) => Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl CollectionSink for JsonlSink {
    async fn commit(&self, collection: &str, documents: &[Value]) -> Result<(), SinkError> {
        validate_collection_name(collection).map_err(|reason| SinkError::InvalidCollection {
            collection: collection.to_string(),
            reason,
        })?;
        if documents.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for doc in documents {
            serde_json::to_writer(&mut buf, doc).map_err(|source| SinkError::Encoding {
                collection: collection.to_string(),
                source,
            })?;
            buf.push(b'\n');
        }

        let io_err = |source| SinkError::Io {
            collection: collection.to_string(),
            source,
        };

        let path = self.path_for(collection);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let lock = self.lock_for(collection);
        let _guard = lock.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(&buf).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;

        debug!(
            collection = collection,
            documents = documents.len(),
            path = %path.display(),
            "Committed batch"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_appends_lines_in_order() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path());

        sink.commit("acmeCo/clients", &[json!({"id": 1}), json!({"id": 2})])
            .await
            .unwrap();
        sink.commit("acmeCo/clients", &[json!({"id": 3})]).await.unwrap();

        let content = std::fs::read_to_string(dir.path().join("acmeCo/clients.jsonl")).unwrap();
        let ids: Vec<i64> = content
            .lines()
            .map(|l| serde_json::from_str::<Value>(l).unwrap()["id"].as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_batch_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path());
        sink.commit("acmeCo/clients", &[]).await.unwrap();
        assert!(!sink.path_for("acmeCo/clients").exists());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path());
        let err = sink
            .commit("acmeCo/../../etc/passwd", &[json!({})])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::InvalidCollection { .. }));
    }
}
