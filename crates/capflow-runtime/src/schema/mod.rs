//! Connector configuration schemas
//!
//! Connectors declare their endpoint and resource configuration as a JSON schema.
//! The schema is compiled once into a [`SchemaNode`] tree; [`validate`] then walks a
//! configuration against it and reports every violation at once.
//!
//! Supported keywords: `type`, `properties`, `required`, `enum`, `default`, `items`,
//! `additionalProperties: false`, `minimum`, `maximum`, `minLength`, `maxLength`,
//! `pattern`, `format` (`date-time`, `date`, `uri`) and `secret` / `airbyte_secret`.
//! Other keywords (titles, descriptions, `order`, ...) are ignored.

pub mod validator;

pub use validator::{
    validate, ConfigValidationError, FieldViolation, ValidatedConfig, ViolationKind,
};

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

/// JSON value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JsonType {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl JsonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JsonType::Null => "null",
            JsonType::Boolean => "boolean",
            JsonType::Integer => "integer",
            JsonType::Number => "number",
            JsonType::String => "string",
            JsonType::Array => "array",
            JsonType::Object => "object",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "null" => JsonType::Null,
            "boolean" => JsonType::Boolean,
            "integer" => JsonType::Integer,
            "number" => JsonType::Number,
            "string" => JsonType::String,
            "array" => JsonType::Array,
            "object" => JsonType::Object,
            _ => return None,
        })
    }

    /// Most specific type of a value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonType::Null,
            Value::Bool(_) => JsonType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => JsonType::Integer,
            Value::Number(n) if n.as_f64().is_some_and(|f| f.fract() == 0.0) => JsonType::Integer,
            Value::Number(_) => JsonType::Number,
            Value::String(_) => JsonType::String,
            Value::Array(_) => JsonType::Array,
            Value::Object(_) => JsonType::Object,
        }
    }

    /// Whether `value` is an instance of this type (integers are numbers)
    pub fn matches(&self, value: &Value) -> bool {
        let actual = JsonType::of(value);
        actual == *self || (*self == JsonType::Number && actual == JsonType::Integer)
    }
}

impl std::fmt::Display for JsonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// String formats checked by the validator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Format {
    DateTime,
    Date,
    Uri,
    /// Declared but not checked
    Other(String),
}

impl Format {
    fn parse(name: &str) -> Self {
        match name {
            "date-time" => Format::DateTime,
            "date" => Format::Date,
            "uri" => Format::Uri,
            other => Format::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Format::DateTime => "date-time",
            Format::Date => "date",
            Format::Uri => "uri",
            Format::Other(name) => name,
        }
    }
}

/// A schema the runtime could not compile
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid schema at '{path}': {message}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl SchemaError {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: if path.is_empty() { "<root>".to_string() } else { path.to_string() },
            message: message.into(),
        }
    }
}

/// Compiled schema node
#[derive(Debug, Clone, Default)]
pub struct SchemaNode {
    /// Allowed types; empty means any
    pub types: Vec<JsonType>,
    pub properties: BTreeMap<String, SchemaNode>,
    pub required: Vec<String>,
    pub additional_properties: bool,
    pub items: Option<Box<SchemaNode>>,
    pub enum_values: Option<Vec<Value>>,
    pub default: Option<Value>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<Regex>,
    pub format: Option<Format>,
    pub secret: bool,
}

impl SchemaNode {
    /// Compile a JSON schema document
    pub fn compile(schema: &Value) -> Result<Self, SchemaError> {
        Self::compile_at(schema, "")
    }

    fn compile_at(schema: &Value, path: &str) -> Result<Self, SchemaError> {
        let obj = match schema {
            Value::Object(obj) => obj,
            // `true` accepts anything
            Value::Bool(true) => return Ok(Self::any()),
            other => {
                return Err(SchemaError::new(
                    path,
                    format!("expected a schema object, found {}", JsonType::of(other)),
                ))
            },
        };

        let mut node = SchemaNode {
            additional_properties: true,
            ..Default::default()
        };

        node.types = compile_types(obj, path)?;

        if let Some(props) = obj.get("properties") {
            let props = props
                .as_object()
                .ok_or_else(|| SchemaError::new(path, "'properties' must be an object"))?;
            for (name, sub) in props {
                let sub_path = join_key(path, name);
                node.properties
                    .insert(name.clone(), Self::compile_at(sub, &sub_path)?);
            }
        }

        if let Some(required) = obj.get("required") {
            let list = required
                .as_array()
                .ok_or_else(|| SchemaError::new(path, "'required' must be an array"))?;
            for name in list {
                let name = name
                    .as_str()
                    .ok_or_else(|| SchemaError::new(path, "'required' entries must be strings"))?;
                node.required.push(name.to_string());
            }
        }

        match obj.get("additionalProperties") {
            Some(Value::Bool(allowed)) => node.additional_properties = *allowed,
            Some(Value::Object(_)) | None => {},
            Some(_) => {
                return Err(SchemaError::new(
                    path,
                    "'additionalProperties' must be a boolean or a schema",
                ))
            },
        }

        if let Some(items) = obj.get("items") {
            let items_path = format!("{}[]", path);
            node.items = Some(Box::new(Self::compile_at(items, &items_path)?));
        }

        if let Some(values) = obj.get("enum") {
            let values = values
                .as_array()
                .ok_or_else(|| SchemaError::new(path, "'enum' must be an array"))?;
            node.enum_values = Some(values.clone());
        }

        node.default = obj.get("default").cloned();
        node.minimum = number_keyword(obj, "minimum", path)?;
        node.maximum = number_keyword(obj, "maximum", path)?;
        node.min_length = length_keyword(obj, "minLength", path)?;
        node.max_length = length_keyword(obj, "maxLength", path)?;

        if let Some(pattern) = obj.get("pattern") {
            let pattern = pattern
                .as_str()
                .ok_or_else(|| SchemaError::new(path, "'pattern' must be a string"))?;
            let regex = Regex::new(pattern)
                .map_err(|e| SchemaError::new(path, format!("invalid pattern: {}", e)))?;
            node.pattern = Some(regex);
        }

        if let Some(format) = obj.get("format").and_then(Value::as_str) {
            node.format = Some(Format::parse(format));
        }

        node.secret = ["secret", "airbyte_secret"]
            .iter()
            .any(|k| obj.get(*k).and_then(Value::as_bool).unwrap_or(false));

        Ok(node)
    }

    fn any() -> Self {
        SchemaNode {
            additional_properties: true,
            ..Default::default()
        }
    }

    /// Whether a required property is satisfied by its default
    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

fn compile_types(obj: &Map<String, Value>, path: &str) -> Result<Vec<JsonType>, SchemaError> {
    let names: Vec<&str> = match obj.get("type") {
        None => return Ok(Vec::new()),
        Some(Value::String(name)) => vec![name.as_str()],
        Some(Value::Array(list)) => list
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| SchemaError::new(path, "'type' entries must be strings"))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(SchemaError::new(path, "'type' must be a string or an array")),
    };

    names
        .into_iter()
        .map(|name| {
            JsonType::parse(name)
                .ok_or_else(|| SchemaError::new(path, format!("unknown type '{}'", name)))
        })
        .collect()
}

fn number_keyword(
    obj: &Map<String, Value>,
    keyword: &str,
    path: &str,
) -> Result<Option<f64>, SchemaError> {
    match obj.get(keyword) {
        None => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| SchemaError::new(path, format!("'{}' must be a number", keyword))),
    }
}

fn length_keyword(
    obj: &Map<String, Value>,
    keyword: &str,
    path: &str,
) -> Result<Option<usize>, SchemaError> {
    match obj.get(keyword) {
        None => Ok(None),
        Some(v) => v.as_u64().map(|n| Some(n as usize)).ok_or_else(|| {
            SchemaError::new(path, format!("'{}' must be a non-negative integer", keyword))
        }),
    }
}

/// Append an object key to a dotted path
pub(crate) fn join_key(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

/// Append an array index to a dotted path
pub(crate) fn join_index(path: &str, index: usize) -> String {
    format!("{}[{}]", path, index)
}
