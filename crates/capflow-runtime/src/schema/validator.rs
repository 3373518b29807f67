//! Configuration validation against a compiled schema

use super::{join_index, join_key, Format, JsonType, SchemaNode};
use crate::checkpoint::Cursor;
use chrono::{DateTime, NaiveDate};
use serde_json::{Map, Value};
use thiserror::Error;

/// Placeholder written over secret values
pub const REDACTED: &str = "***";

/// What is wrong with a field
#[derive(Debug, Clone, PartialEq)]
pub enum ViolationKind {
    Missing,
    WrongType {
        expected: Vec<JsonType>,
        found: JsonType,
    },
    /// `value` is omitted for secret fields
    NotInEnum {
        value: Option<Value>,
        allowed: Vec<Value>,
    },
    BelowMinimum(f64),
    AboveMaximum(f64),
    TooShort(usize),
    TooLong(usize),
    PatternMismatch(String),
    InvalidFormat(String),
    UnknownField,
    /// Rejected by the connector's own validation
    Rejected(String),
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationKind::Missing => write!(f, "missing required field"),
            ViolationKind::WrongType { expected, found } => {
                let expected: Vec<&str> = expected.iter().map(JsonType::as_str).collect();
                write!(f, "expected {}, found {}", expected.join(" or "), found)
            },
            ViolationKind::NotInEnum { value, allowed } => {
                let allowed: Vec<String> = allowed.iter().map(Value::to_string).collect();
                match value {
                    Some(v) => write!(f, "{} is not one of [{}]", v, allowed.join(", ")),
                    None => write!(f, "value is not one of [{}]", allowed.join(", ")),
                }
            },
            ViolationKind::BelowMinimum(min) => write!(f, "must be >= {}", min),
            ViolationKind::AboveMaximum(max) => write!(f, "must be <= {}", max),
            ViolationKind::TooShort(len) => write!(f, "must be at least {} characters", len),
            ViolationKind::TooLong(len) => write!(f, "must be at most {} characters", len),
            ViolationKind::PatternMismatch(pattern) => {
                write!(f, "does not match pattern '{}'", pattern)
            },
            ViolationKind::InvalidFormat(format) => write!(f, "is not a valid {}", format),
            ViolationKind::UnknownField => write!(f, "unknown field"),
            ViolationKind::Rejected(message) => write!(f, "{}", message),
        }
    }
}

/// A single invalid field
#[derive(Debug, Clone, PartialEq)]
pub struct FieldViolation {
    /// Dotted path, e.g. `credentials.api_key` or `accounts[2].id`
    pub path: String,
    pub kind: ViolationKind,
}

impl FieldViolation {
    pub fn new(path: impl Into<String>, kind: ViolationKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

impl std::fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = if self.path.is_empty() { "<root>" } else { &self.path };
        write!(f, "{}: {}", path, self.kind)
    }
}

/// Every violation found in a configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub struct ConfigValidationError {
    /// What was validated, e.g. `endpoint config of acmeCo/source-airtable`
    pub subject: String,
    pub violations: Vec<FieldViolation>,
}

impl ConfigValidationError {
    pub fn new(subject: impl Into<String>, violations: Vec<FieldViolation>) -> Self {
        Self {
            subject: subject.into(),
            violations,
        }
    }

    /// Whether a violation was reported for `path`
    pub fn has_violation(&self, path: &str) -> bool {
        self.violations.iter().any(|v| v.path == path)
    }

    /// Prefix every violation path, e.g. with `bindings[0].resource`
    pub fn prefixed(mut self, prefix: &str) -> Self {
        for v in &mut self.violations {
            v.path = if v.path.is_empty() {
                prefix.to_string()
            } else {
                format!("{}.{}", prefix, v.path)
            };
        }
        self
    }
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.violations.len();
        write!(
            f,
            "{} has {} invalid field{}",
            self.subject,
            n,
            if n == 1 { "" } else { "s" }
        )?;
        for v in &self.violations {
            write!(f, "\n  - {}", v)?;
        }
        Ok(())
    }
}

/// Configuration that passed validation, with defaults applied
#[derive(Clone, PartialEq)]
pub struct ValidatedConfig {
    value: Value,
    secrets: Vec<Location>,
}

impl ValidatedConfig {
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    /// Paths of fields marked secret
    pub fn secret_paths(&self) -> Vec<String> {
        self.secrets.iter().map(|location| render(location)).collect()
    }

    /// Look up a dotted path such as `credentials.api_key` or `accounts[0]`
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current = &self.value;
        for step in parse_path(path)? {
            current = match step {
                Step::Key(key) => current.as_object()?.get(key)?,
                Step::Index(i) => current.as_array()?.get(i)?,
            };
        }
        Some(current)
    }

    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, path: &str) -> Option<bool> {
        self.get(path).and_then(Value::as_bool)
    }

    /// Lower bound for incremental reads declared by the endpoint (`start_date`)
    pub fn start_cursor(&self) -> Option<Cursor> {
        self.get("start_date").and_then(Cursor::from_value)
    }

    /// Copy of the configuration with secret values replaced
    pub fn redacted(&self) -> Value {
        let mut value = self.value.clone();
        for location in &self.secrets {
            if let Some(slot) = lookup_mut(&mut value, location) {
                *slot = Value::String(REDACTED.to_string());
            }
        }
        value
    }
}

impl std::fmt::Debug for ValidatedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedConfig")
            .field("value", &self.redacted())
            .finish()
    }
}

#[derive(Debug, PartialEq)]
enum Step<'a> {
    Key(&'a str),
    Index(usize),
}

fn parse_path(path: &str) -> Option<Vec<Step<'_>>> {
    let mut steps = Vec::new();
    if path.is_empty() {
        return Some(steps);
    }
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            steps.push(Step::Key(key));
        }
        while let Some(stripped) = rest.strip_prefix('[') {
            let end = stripped.find(']')?;
            steps.push(Step::Index(stripped[..end].parse().ok()?));
            rest = &stripped[end + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(steps)
}

/// Position of a value inside a configuration, kept as segments so keys
/// containing `.` or `[` stay addressable
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

type Location = Vec<Segment>;

fn render(location: &[Segment]) -> String {
    let mut path = String::new();
    for segment in location {
        match segment {
            Segment::Key(key) => path = join_key(&path, key),
            Segment::Index(i) => path = join_index(&path, *i),
        }
    }
    path
}

fn lookup_mut<'v>(value: &'v mut Value, location: &[Segment]) -> Option<&'v mut Value> {
    let mut current = value;
    for segment in location {
        current = match segment {
            Segment::Key(key) => current.as_object_mut()?.get_mut(key.as_str())?,
            Segment::Index(i) => current.as_array_mut()?.get_mut(*i)?,
        };
    }
    Some(current)
}

/// Validate `config` against `schema`, reporting every violation
pub fn validate(
    schema: &SchemaNode,
    config: &Value,
    subject: &str,
) -> Result<ValidatedConfig, ConfigValidationError> {
    let mut walker = Walker::default();
    let value = walker.walk(schema, config, "");

    if walker.violations.is_empty() {
        Ok(ValidatedConfig {
            value,
            secrets: walker.secrets,
        })
    } else {
        Err(ConfigValidationError::new(subject, walker.violations))
    }
}

#[derive(Default)]
struct Walker {
    violations: Vec<FieldViolation>,
    secrets: Vec<Location>,
    /// Segments leading to the value being walked
    location: Location,
}

impl Walker {
    fn report(&mut self, path: &str, kind: ViolationKind) {
        self.violations.push(FieldViolation::new(path, kind));
    }

    /// Returns `value` with defaults filled in below it
    fn walk(&mut self, node: &SchemaNode, value: &Value, path: &str) -> Value {
        if node.secret {
            self.secrets.push(self.location.clone());
        }

        if !node.types.is_empty() && !node.types.iter().any(|t| t.matches(value)) {
            self.report(
                path,
                ViolationKind::WrongType {
                    expected: node.types.clone(),
                    found: JsonType::of(value),
                },
            );
            return value.clone();
        }

        if let Some(allowed) = &node.enum_values {
            if !allowed.contains(value) {
                let shown = if node.secret { None } else { Some(value.clone()) };
                self.report(
                    path,
                    ViolationKind::NotInEnum {
                        value: shown,
                        allowed: allowed.clone(),
                    },
                );
            }
        }

        match value {
            Value::Object(map) => Value::Object(self.walk_object(node, map, path)),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| match &node.items {
                        Some(item_node) => {
                            self.location.push(Segment::Index(i));
                            let walked = self.walk(item_node, item, &join_index(path, i));
                            self.location.pop();
                            walked
                        },
                        None => item.clone(),
                    })
                    .collect(),
            ),
            Value::String(s) => {
                self.check_string(node, s, path);
                value.clone()
            },
            Value::Number(n) => {
                if let Some(x) = n.as_f64() {
                    if let Some(min) = node.minimum.filter(|min| x < *min) {
                        self.report(path, ViolationKind::BelowMinimum(min));
                    }
                    if let Some(max) = node.maximum.filter(|max| x > *max) {
                        self.report(path, ViolationKind::AboveMaximum(max));
                    }
                }
                value.clone()
            },
            Value::Null | Value::Bool(_) => value.clone(),
        }
    }

    fn walk_object(
        &mut self,
        node: &SchemaNode,
        map: &Map<String, Value>,
        path: &str,
    ) -> Map<String, Value> {
        let mut out = Map::new();

        for name in &node.required {
            let defaulted = node.properties.get(name).is_some_and(SchemaNode::has_default);
            if !map.contains_key(name) && !defaulted {
                self.report(&join_key(path, name), ViolationKind::Missing);
            }
        }

        for (name, prop) in &node.properties {
            let prop_path = join_key(path, name);
            match map.get(name) {
                Some(v) => {
                    self.location.push(Segment::Key(name.clone()));
                    let walked = self.walk(prop, v, &prop_path);
                    self.location.pop();
                    out.insert(name.clone(), walked);
                },
                None => {
                    if let Some(default) = &prop.default {
                        if prop.secret {
                            let mut location = self.location.clone();
                            location.push(Segment::Key(name.clone()));
                            self.secrets.push(location);
                        }
                        out.insert(name.clone(), default.clone());
                    }
                },
            }
        }

        for (name, v) in map {
            if node.properties.contains_key(name) {
                continue;
            }
            if node.additional_properties {
                out.insert(name.clone(), v.clone());
            } else {
                self.report(&join_key(path, name), ViolationKind::UnknownField);
            }
        }

        out
    }

    fn check_string(&mut self, node: &SchemaNode, s: &str, path: &str) {
        let len = s.chars().count();
        if let Some(min) = node.min_length {
            if len < min {
                self.report(path, ViolationKind::TooShort(min));
            }
        }
        if let Some(max) = node.max_length {
            if len > max {
                self.report(path, ViolationKind::TooLong(max));
            }
        }
        if let Some(pattern) = &node.pattern {
            if !pattern.is_match(s) {
                self.report(path, ViolationKind::PatternMismatch(pattern.as_str().to_string()));
            }
        }
        if let Some(format) = &node.format {
            let ok = match format {
                Format::DateTime => DateTime::parse_from_rfc3339(s).is_ok(),
                Format::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok(),
                Format::Uri => is_uri(s),
                Format::Other(_) => true,
            };
            if !ok {
                self.report(path, ViolationKind::InvalidFormat(format.as_str().to_string()));
            }
        }
    }
}

/// `scheme:rest` with an RFC 3986 scheme and no whitespace
fn is_uri(s: &str) -> bool {
    let Some((scheme, rest)) = s.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    let starts_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    starts_alpha
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        && !rest.is_empty()
        && !s.chars().any(char::is_whitespace)
}
