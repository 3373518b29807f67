//! Capture specification files
//!
//! A capture specification is YAML of the shape:
//!
//! ```yaml
//! captures:
//!   acmeCo/source-airtable:
//!     endpoint:
//!       connector:
//!         image: ghcr.io/estuary/source-airtable:dev
//!         config: source-airtable.config.yaml
//!     bindings:
//!       - resource:
//!           stream: clients
//!           syncMode: incremental
//!         target: acmeCo/clients
//! ```
//!
//! `config` is either an inline mapping or a path (relative to the specification
//! file) of a YAML or JSON document.
//!
//! A capture may set `interval` (e.g. `5m`) to be re-run that long after each
//! session ends. Bumping a binding's `backfill` counter gives it a fresh
//! checkpoint, so its next incremental read starts over.

use crate::protocol::{BindingRequest, SyncMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Errors loading a capture specification
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{location}: {message}")]
    Invalid { location: String, message: String },

    #[error("Capture '{name}' is not defined (available: {available})")]
    UnknownCapture { name: String, available: String },
}

impl SpecError {
    fn invalid(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Top-level document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CatalogDef {
    #[serde(default)]
    pub captures: BTreeMap<String, CaptureDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CaptureDef {
    pub endpoint: EndpointDef,
    #[serde(default)]
    pub bindings: Vec<BindingDef>,
    /// Delay between sessions, as a human-readable duration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EndpointDef {
    pub connector: ConnectorDef,
    /// Misplaced `config`, accepted with a warning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ConnectorDef {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigSource>,
}

/// Inline configuration or a path to it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConfigSource {
    File(String),
    Inline(Map<String, Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BindingDef {
    pub resource: ResourceDef,
    pub target: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disable: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub backfill: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDef {
    pub stream: String,
    #[serde(rename = "syncMode")]
    pub sync_mode: SyncMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Connector-specific resource fields (cursor fields, page sizes, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A binding of a loaded capture
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub stream: String,
    pub namespace: Option<String>,
    pub sync_mode: SyncMode,
    pub target: String,
    /// Complete `resource` block as written
    pub resource: Value,
    pub disable: bool,
    /// Incremented to discard the binding's checkpoint
    pub backfill: u32,
}

impl Binding {
    pub fn new(stream: impl Into<String>, sync_mode: SyncMode, target: impl Into<String>) -> Self {
        let stream = stream.into();
        let resource = serde_json::json!({"stream": stream, "syncMode": sync_mode});
        Self {
            stream,
            namespace: None,
            sync_mode,
            target: target.into(),
            resource,
            disable: false,
            backfill: 0,
        }
    }

    fn from_def(def: BindingDef) -> Self {
        let ResourceDef {
            stream,
            sync_mode,
            namespace,
            extra,
        } = def.resource;

        let mut resource = extra;
        resource.insert("stream".to_string(), Value::String(stream.clone()));
        resource.insert(
            "syncMode".to_string(),
            Value::String(sync_mode.as_str().to_string()),
        );
        if let Some(ns) = &namespace {
            resource.insert("namespace".to_string(), Value::String(ns.clone()));
        }

        Self {
            stream,
            namespace,
            sync_mode,
            target: def.target,
            resource: Value::Object(resource),
            disable: def.disable,
            backfill: def.backfill,
        }
    }

    /// Human-readable stream name, qualified by namespace
    pub fn qualified_stream(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}.{}", ns, self.stream),
            None => self.stream.clone(),
        }
    }

    pub fn to_request(&self) -> BindingRequest {
        BindingRequest {
            stream: self.stream.clone(),
            namespace: self.namespace.clone(),
            sync_mode: self.sync_mode,
            resource: self.resource.clone(),
            target: self.target.clone(),
        }
    }
}

/// A capture with its configuration resolved
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSpec {
    pub name: String,
    pub image: String,
    /// Raw endpoint configuration (not yet validated)
    pub config: Value,
    pub bindings: Vec<Binding>,
    /// Re-run the capture this long after each session ends
    pub interval: Option<Duration>,
}

impl CaptureSpec {
    pub fn enabled_bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter().filter(|b| !b.disable)
    }
}

/// All captures of a specification file, ordered by name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureCatalog {
    pub captures: Vec<CaptureSpec>,
}

impl CaptureCatalog {
    /// Load a specification file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| SpecError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::parse(&content, &path.display().to_string(), &base_dir)
    }

    /// Parse specification YAML; config file paths resolve against `base_dir`
    pub fn from_yaml(content: &str, base_dir: impl AsRef<Path>) -> Result<Self, SpecError> {
        Self::parse(content, "<inline>", base_dir.as_ref())
    }

    fn parse(content: &str, origin: &str, base_dir: &Path) -> Result<Self, SpecError> {
        let def: CatalogDef = serde_yaml::from_str(content).map_err(|source| SpecError::Parse {
            path: origin.to_string(),
            source,
        })?;

        let mut captures = Vec::with_capacity(def.captures.len());
        for (name, capture) in def.captures {
            let location = format!("captures.{}", name);
            validate_capture_name(&name).map_err(|msg| SpecError::invalid(&location, msg))?;

            let connector_config = capture.endpoint.connector.config;
            let source = match (connector_config, capture.endpoint.config) {
                (Some(_), Some(_)) => {
                    return Err(SpecError::invalid(
                        format!("{}.endpoint", location),
                        "config is given both under 'connector' and directly under 'endpoint'",
                    ))
                },
                (Some(config), None) => Some(config),
                (None, Some(config)) => {
                    warn!(
                        capture = %name,
                        "endpoint.config should be nested under endpoint.connector.config; using it anyway"
                    );
                    Some(config)
                },
                (None, None) => None,
            };

            let config = match source {
                Some(ConfigSource::Inline(map)) => Value::Object(map),
                Some(ConfigSource::File(file)) => load_config_file(&base_dir.join(file), &location)?,
                None => Value::Object(Map::new()),
            };

            let image = capture.endpoint.connector.image;
            if image.trim().is_empty() {
                return Err(SpecError::invalid(
                    format!("{}.endpoint.connector.image", location),
                    "image must not be empty",
                ));
            }

            let interval = match capture.interval.as_deref() {
                Some(text) => Some(parse_interval(text).map_err(|msg| {
                    SpecError::invalid(format!("{}.interval", location), msg)
                })?),
                None => None,
            };

            captures.push(CaptureSpec {
                name,
                image,
                config,
                bindings: capture.bindings.into_iter().map(Binding::from_def).collect(),
                interval,
            });
        }

        Ok(Self { captures })
    }

    pub fn get(&self, name: &str) -> Option<&CaptureSpec> {
        self.captures.iter().find(|c| c.name == name)
    }

    /// One named capture, or all of them
    pub fn select(&self, name: Option<&str>) -> Result<Vec<&CaptureSpec>, SpecError> {
        match name {
            Some(name) => self
                .get(name)
                .map(|c| vec![c])
                .ok_or_else(|| SpecError::UnknownCapture {
                    name: name.to_string(),
                    available: self.names().join(", "),
                }),
            None => Ok(self.captures.iter().collect()),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.captures.iter().map(|c| c.name.as_str()).collect()
    }
}

fn load_config_file(path: &Path, location: &str) -> Result<Value, SpecError> {
    let content = std::fs::read_to_string(path).map_err(|source| SpecError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let value: Value = serde_yaml::from_str(&content).map_err(|source| SpecError::Parse {
        path: path.display().to_string(),
        source,
    })?;
    if !value.is_object() {
        return Err(SpecError::invalid(
            format!("{}.endpoint.connector.config", location),
            format!("{} must contain a mapping", path.display()),
        ));
    }
    Ok(value)
}

fn parse_interval(text: &str) -> Result<Duration, String> {
    let interval = humantime::parse_duration(text.trim())
        .map_err(|e| format!("'{}' is not a duration: {}", text, e))?;
    if interval.is_zero() {
        return Err("interval must be greater than zero".to_string());
    }
    Ok(interval)
}

fn validate_tokens(name: &str) -> Result<usize, String> {
    if name.is_empty() {
        return Err("name must not be empty".to_string());
    }
    let mut count = 0;
    for token in name.split('/') {
        if token.is_empty() {
            return Err(format!("'{}' has an empty path component", name));
        }
        if token == "." || token == ".." {
            return Err(format!("'{}' may not contain '{}' components", name, token));
        }
        if let Some(bad) = token
            .chars()
            .find(|c| !(c.is_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(format!("'{}' contains invalid character {:?}", name, bad));
        }
        count += 1;
    }
    Ok(count)
}

/// Capture names are `prefix/name` paths of letters, numbers, `-`, `_` and `.`
pub fn validate_capture_name(name: &str) -> Result<(), String> {
    if validate_tokens(name)? < 2 {
        return Err(format!(
            "capture name '{}' must have a prefix, e.g. 'acmeCo/{}'",
            name, name
        ));
    }
    Ok(())
}

/// Collection names are `/`-separated paths of letters, numbers, `-`, `_` and `.`
pub fn validate_collection_name(name: &str) -> Result<(), String> {
    validate_tokens(name).map(|_| ())
}
