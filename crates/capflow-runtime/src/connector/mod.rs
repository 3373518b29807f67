//! Connector implementations
//!
//! A [`Connector`] answers the four protocol verbs. Connectors are looked up by
//! image through an injected [`ConnectorRegistry`]; images that were not
//! registered explicitly fall back to a [`ConnectorFactory`], typically one that
//! launches the image as a process.

pub mod memory;
pub mod process;

pub use memory::MemoryConnector;
pub use process::{ProcessConnector, ProcessConnectorFactory, ProcessLauncher};

use crate::protocol::{
    ConnectorError, DiscoverResponse, ReadMessage, ReadRequest, SpecResponse, ValidateRequest,
    ValidateResponse,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Messages produced by a `read`, ending when the connector is done
pub type ReadStream = BoxStream<'static, Result<ReadMessage, ConnectorError>>;

/// A source connector speaking the capture protocol
#[async_trait]
pub trait Connector: Send + Sync {
    /// Configuration schema of the endpoint and its resources
    async fn spec(&self) -> Result<SpecResponse, ConnectorError>;

    /// Streams available with the given endpoint configuration
    async fn discover(&self, config: &Value) -> Result<DiscoverResponse, ConnectorError>;

    /// Connector-side validation of a resolved binding plan
    async fn validate(&self, request: &ValidateRequest) -> Result<ValidateResponse, ConnectorError>;

    /// Start reading one binding
    async fn read(&self, request: ReadRequest) -> Result<ReadStream, ConnectorError>;
}

/// Builds connectors for images that were not registered explicitly
pub trait ConnectorFactory: Send + Sync {
    fn create(&self, image: &str) -> Arc<dyn Connector>;
}

/// Image → connector lookup
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn Connector>>,
    fallback: Option<Arc<dyn ConnectorFactory>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that launches every image through `factory`
    pub fn with_factory(factory: impl ConnectorFactory + 'static) -> Self {
        Self {
            connectors: HashMap::new(),
            fallback: Some(Arc::new(factory)),
        }
    }

    /// Serve `image` with a specific connector
    pub fn register(&mut self, image: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connectors.insert(image.into(), connector);
    }

    pub fn resolve(&self, image: &str) -> Option<Arc<dyn Connector>> {
        self.connectors
            .get(image)
            .cloned()
            .or_else(|| self.fallback.as_ref().map(|f| f.create(image)))
    }

    /// Explicitly registered images, sorted
    pub fn images(&self) -> Vec<&str> {
        let mut images: Vec<&str> = self.connectors.keys().map(String::as_str).collect();
        images.sort_unstable();
        images
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("images", &self.images())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}
