//! Collection sinks
//!
//! Captured documents are appended to their target collection in batches. A
//! batch is durable once `commit` returns, which is what allows the orchestrator
//! to persist the checkpoint that follows it.

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlSink;
pub use memory::MemorySink;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to write collection '{collection}': {source}")]
    Io {
        collection: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode document for '{collection}': {source}")]
    Encoding {
        collection: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid collection name '{collection}': {reason}")]
    InvalidCollection { collection: String, reason: String },

    #[error("Collection '{collection}' rejected the batch: {message}")]
    Rejected { collection: String, message: String },
}

/// Destination for captured documents (dependency injection)
#[async_trait]
pub trait CollectionSink: Send + Sync {
    /// Append `documents` to `collection` in order and make them durable
    async fn commit(&self, collection: &str, documents: &[Value]) -> Result<(), SinkError>;
}
