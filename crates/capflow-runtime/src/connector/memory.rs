//! Scripted in-process connector
//!
//! Used by tests and embedders that want to drive a capture without launching a
//! process. Each stream has a read script: a function from the read request to
//! the messages the connector emits.

use super::{Connector, ReadStream};
use crate::protocol::{
    ConnectorError, DiscoverResponse, DiscoveredStream, ReadMessage, ReadRequest, SpecResponse,
    SyncMode, ValidateRequest, ValidateResponse,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Messages emitted for one read request
pub type ReadScript =
    Arc<dyn Fn(&ReadRequest) -> Vec<Result<ReadMessage, ConnectorError>> + Send + Sync>;

pub struct MemoryConnector {
    spec: SpecResponse,
    streams: Vec<DiscoveredStream>,
    scripts: HashMap<String, ReadScript>,
    stalls: HashSet<String>,
    validation: ValidateResponse,
    reads: Mutex<Vec<ReadRequest>>,
    validations: Mutex<Vec<ValidateRequest>>,
}

impl MemoryConnector {
    /// Connector with the given endpoint schema and no streams
    pub fn new(config_schema: Value) -> Self {
        Self {
            spec: SpecResponse {
                config_schema,
                resource_schema: None,
                documentation_url: None,
            },
            streams: Vec::new(),
            scripts: HashMap::new(),
            stalls: HashSet::new(),
            validation: ValidateResponse::ok(),
            reads: Mutex::new(Vec::new()),
            validations: Mutex::new(Vec::new()),
        }
    }

    /// Declared stream with an object schema and the given sync modes
    pub fn stream(name: &str, modes: &[SyncMode]) -> DiscoveredStream {
        DiscoveredStream {
            name: name.to_string(),
            namespace: None,
            json_schema: json!({"type": "object"}),
            supported_sync_modes: modes.to_vec(),
            source_defined_cursor: modes.contains(&SyncMode::Incremental),
            default_cursor_field: Vec::new(),
            key: vec!["/id".to_string()],
        }
    }

    pub fn with_resource_schema(mut self, schema: Value) -> Self {
        self.spec.resource_schema = Some(schema);
        self
    }

    pub fn with_stream(mut self, stream: DiscoveredStream) -> Self {
        self.streams.push(stream);
        self
    }

    /// Emit `messages` on every read of `stream`
    pub fn with_messages(self, stream: &str, messages: Vec<ReadMessage>) -> Self {
        self.with_reader(stream, move |_| messages.iter().cloned().map(Ok).collect())
    }

    /// Compute the messages of each read of `stream` from its request
    pub fn with_reader<F>(mut self, stream: &str, reader: F) -> Self
    where
        F: Fn(&ReadRequest) -> Vec<Result<ReadMessage, ConnectorError>> + Send + Sync + 'static,
    {
        self.scripts.insert(stream.to_string(), Arc::new(reader));
        self
    }

    /// Keep reads of `stream` open after the script is exhausted
    pub fn stall_after_script(mut self, stream: &str) -> Self {
        self.stalls.insert(stream.to_string());
        self
    }

    pub fn with_validation(mut self, validation: ValidateResponse) -> Self {
        self.validation = validation;
        self
    }

    /// Every read request received so far
    pub fn read_requests(&self) -> Vec<ReadRequest> {
        self.reads.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Every validate request received so far
    pub fn validate_requests(&self) -> Vec<ValidateRequest> {
        self.validations.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn spec(&self) -> Result<SpecResponse, ConnectorError> {
        Ok(self.spec.clone())
    }

    async fn discover(&self, _config: &Value) -> Result<DiscoverResponse, ConnectorError> {
        Ok(DiscoverResponse {
            streams: self.streams.clone(),
        })
    }

    async fn validate(&self, request: &ValidateRequest) -> Result<ValidateResponse, ConnectorError> {
        if let Ok(mut validations) = self.validations.lock() {
            validations.push(request.clone());
        }
        Ok(self.validation.clone())
    }

    async fn read(&self, request: ReadRequest) -> Result<ReadStream, ConnectorError> {
        let stream = request.binding.stream.clone();
        let script = self
            .scripts
            .get(&stream)
            .ok_or_else(|| ConnectorError::failed(format!("no read script for stream '{}'", stream)))?;

        let messages = script(&request);
        if let Ok(mut reads) = self.reads.lock() {
            reads.push(request);
        }

        let emitted = stream::iter(messages);
        if self.stalls.contains(&stream) {
            Ok(emitted.chain(stream::pending()).boxed())
        } else {
            Ok(emitted.boxed())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::protocol::BindingRequest;

    fn read_request(stream: &str) -> ReadRequest {
        ReadRequest {
            capture: "acmeCo/source-x".to_string(),
            config: json!({}),
            binding: BindingRequest {
                stream: stream.to_string(),
                namespace: None,
                sync_mode: SyncMode::Incremental,
                resource: json!({"stream": stream}),
                target: format!("acmeCo/{}", stream),
            },
            state: None,
            start_cursor: None,
        }
    }

    #[tokio::test]
    async fn test_scripted_read() {
        let connector = MemoryConnector::new(json!({}))
            .with_stream(MemoryConnector::stream("clients", &[SyncMode::Incremental]))
            .with_messages(
                "clients",
                vec![
                    ReadMessage::record("clients", json!({"id": 1})),
                    ReadMessage::checkpoint(json!({"page": 1}), None),
                ],
            );

        let messages: Vec<_> = connector
            .read(read_request("clients"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(messages.len(), 2);
        assert_eq!(connector.read_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unscripted_stream_fails() {
        let connector = MemoryConnector::new(json!({}));
        assert!(connector.read(read_request("orders")).await.is_err());
    }
}
