//! In-memory sink for tests

use super::{CollectionSink, SinkError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

/// Keeps committed documents per collection
#[derive(Debug, Default)]
pub struct MemorySink {
    collections: Mutex<BTreeMap<String, Vec<Value>>>,
    batches: Mutex<Vec<(String, usize)>>,
    failing: Mutex<HashSet<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Documents committed to `collection`, in commit order
    pub fn documents(&self, collection: &str) -> Vec<Value> {
        self.collections
            .lock()
            .ok()
            .and_then(|c| c.get(collection).cloned())
            .unwrap_or_default()
    }

    /// `(collection, batch size)` of every commit
    pub fn batches(&self) -> Vec<(String, usize)> {
        self.batches.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Reject every commit to `collection`
    pub fn fail_collection(&self, collection: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(collection.to_string());
        }
    }
}

#[async_trait]
impl CollectionSink for MemorySink {
    async fn commit(&self, collection: &str, documents: &[Value]) -> Result<(), SinkError> {
        let rejected = self
            .failing
            .lock()
            .map(|f| f.contains(collection))
            .unwrap_or(false);
        if rejected {
            return Err(SinkError::Rejected {
                collection: collection.to_string(),
                message: "collection is read-only".to_string(),
            });
        }

        let mut collections = self.collections.lock().map_err(|e| SinkError::Rejected {
            collection: collection.to_string(),
            message: format!("sink lock poisoned: {}", e),
        })?;
        collections
            .entry(collection.to_string())
            .or_default()
            .extend_from_slice(documents);

        if let Ok(mut batches) = self.batches.lock() {
            batches.push((collection.to_string(), documents.len()));
        }
        Ok(())
    }
}
