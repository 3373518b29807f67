//! Binding resolution
//!
//! Checks a capture's declared bindings against the connector's discovered
//! catalog and produces the plan the orchestrator reads from. Every problem is
//! collected before failing so a single `check` shows all of them.

use crate::protocol::{BindingRequest, DiscoverResponse, DiscoveredStream, SyncMode};
use crate::spec::{validate_collection_name, Binding, BindingDef, ResourceDef};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// A binding matched to its discovered stream
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedBinding {
    /// Position in the capture's binding list
    pub index: usize,
    pub stream: String,
    pub namespace: Option<String>,
    pub sync_mode: SyncMode,
    pub target: String,
    pub resource: Value,
    /// JSON schema of the stream's documents
    pub schema: Value,
    pub key: Vec<String>,
    pub backfill: u32,
}

impl ResolvedBinding {
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

/// Bindings ready to be read, in declaration order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingPlan {
    pub bindings: Vec<ResolvedBinding>,
    /// Streams of bindings skipped because they are disabled
    pub disabled: Vec<String>,
}

/// One reason a binding cannot be resolved
#[derive(Debug, Clone, PartialEq)]
pub enum BindingIssue {
    UnknownStream {
        stream: String,
        available: Vec<String>,
    },
    AmbiguousStream {
        stream: String,
        namespaces: Vec<String>,
    },
    DuplicateStream {
        stream: String,
    },
    UnsupportedSyncMode {
        stream: String,
        requested: SyncMode,
        supported: Vec<SyncMode>,
    },
    /// Two bindings write streams with different schemas to one collection
    IncompatibleTarget {
        target: String,
        stream: String,
        other_stream: String,
    },
    /// Two bindings write to one collection
    DuplicateTarget {
        target: String,
        stream: String,
        other_stream: String,
    },
    InvalidTarget {
        stream: String,
        target: String,
        reason: String,
    },
}

impl BindingIssue {
    /// The stream the issue is about
    pub fn stream(&self) -> &str {
        match self {
            BindingIssue::UnknownStream { stream, .. }
            | BindingIssue::AmbiguousStream { stream, .. }
            | BindingIssue::DuplicateStream { stream }
            | BindingIssue::UnsupportedSyncMode { stream, .. }
            | BindingIssue::IncompatibleTarget { stream, .. }
            | BindingIssue::DuplicateTarget { stream, .. }
            | BindingIssue::InvalidTarget { stream, .. } => stream,
        }
    }
}

impl std::fmt::Display for BindingIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingIssue::UnknownStream { stream, available } => write!(
                f,
                "stream '{}' is not offered by the connector (available: {})",
                stream,
                if available.is_empty() { "none".to_string() } else { available.join(", ") }
            ),
            BindingIssue::AmbiguousStream { stream, namespaces } => write!(
                f,
                "stream '{}' exists in several namespaces ({}); set resource.namespace",
                stream,
                namespaces.join(", ")
            ),
            BindingIssue::DuplicateStream { stream } => {
                write!(f, "stream '{}' is bound more than once", stream)
            },
            BindingIssue::UnsupportedSyncMode {
                stream,
                requested,
                supported,
            } => {
                let supported: Vec<&str> = supported.iter().map(SyncMode::as_str).collect();
                write!(
                    f,
                    "stream '{}' does not support syncMode {} (supported: {})",
                    stream,
                    requested,
                    supported.join(", ")
                )
            },
            BindingIssue::IncompatibleTarget {
                target,
                stream,
                other_stream,
            } => write!(
                f,
                "stream '{}' and stream '{}' both target '{}' with incompatible schemas",
                stream, other_stream, target
            ),
            BindingIssue::DuplicateTarget {
                target,
                stream,
                other_stream,
            } => write!(
                f,
                "stream '{}' targets '{}', which is already the target of stream '{}'",
                stream, target, other_stream
            ),
            BindingIssue::InvalidTarget {
                stream,
                target,
                reason,
            } => write!(f, "stream '{}' has invalid target '{}': {}", stream, target, reason),
        }
    }
}

/// Bindings that do not match the connector's catalog
#[derive(Error, Debug, Clone, PartialEq)]
pub struct BindingResolutionError {
    pub issues: Vec<BindingIssue>,
}

impl BindingResolutionError {
    /// Streams named by the issues
    pub fn streams(&self) -> Vec<&str> {
        self.issues.iter().map(BindingIssue::stream).collect()
    }
}

impl std::fmt::Display for BindingResolutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Binding resolution failed")?;
        for issue in &self.issues {
            write!(f, "\n  - {}", issue)?;
        }
        Ok(())
    }
}

/// Match `bindings` against `catalog`
pub fn resolve(
    bindings: &[Binding],
    catalog: &DiscoverResponse,
) -> Result<BindingPlan, BindingResolutionError> {
    let mut issues = Vec::new();
    let mut plan = BindingPlan::default();

    let mut by_name: HashMap<&str, Vec<&DiscoveredStream>> = HashMap::new();
    for stream in &catalog.streams {
        by_name.entry(stream.name.as_str()).or_default().push(stream);
    }

    let mut seen_streams = HashSet::new();
    // target -> (stream, schema) of the first binding writing it
    let mut targets: HashMap<&str, (String, &Value)> = HashMap::new();

    for (index, binding) in bindings.iter().enumerate() {
        let name = binding.qualified_stream();
        if binding.disable {
            plan.disabled.push(name);
            continue;
        }

        if let Err(reason) = validate_collection_name(&binding.target) {
            issues.push(BindingIssue::InvalidTarget {
                stream: name.clone(),
                target: binding.target.clone(),
                reason,
            });
        }

        let Some(discovered) = find_stream(binding, &by_name, &name, &mut issues, catalog) else {
            continue;
        };

        // A binding without a namespace resolves to the discovered one, so
        // uniqueness is checked on the stream it actually reads.
        if !seen_streams.insert((discovered.namespace.as_deref(), discovered.name.as_str())) {
            issues.push(BindingIssue::DuplicateStream {
                stream: qualified_name(discovered),
            });
            continue;
        }

        if !discovered.supports(binding.sync_mode) {
            issues.push(BindingIssue::UnsupportedSyncMode {
                stream: name.clone(),
                requested: binding.sync_mode,
                supported: discovered.supported_sync_modes.clone(),
            });
        }

        let existing = targets
            .get(binding.target.as_str())
            .map(|(other, schema)| (other.clone(), **schema == discovered.json_schema));
        match existing {
            Some((other_stream, false)) => {
                issues.push(BindingIssue::IncompatibleTarget {
                    target: binding.target.clone(),
                    stream: name.clone(),
                    other_stream,
                });
            },
            Some((other_stream, true)) => {
                issues.push(BindingIssue::DuplicateTarget {
                    target: binding.target.clone(),
                    stream: name.clone(),
                    other_stream,
                });
            },
            None => {
                targets.insert(binding.target.as_str(), (name.clone(), &discovered.json_schema));
            },
        }

        plan.bindings.push(ResolvedBinding {
            index,
            stream: binding.stream.clone(),
            namespace: binding.namespace.clone().or_else(|| discovered.namespace.clone()),
            sync_mode: binding.sync_mode,
            target: binding.target.clone(),
            resource: binding.resource.clone(),
            schema: discovered.json_schema.clone(),
            key: discovered.key.clone(),
            backfill: binding.backfill,
        });
    }

    if issues.is_empty() {
        Ok(plan)
    } else {
        Err(BindingResolutionError { issues })
    }
}

/// Discovered stream for a binding; a binding without a namespace matches a
/// stream name that is unique across namespaces
fn find_stream<'c>(
    binding: &Binding,
    by_name: &HashMap<&str, Vec<&'c DiscoveredStream>>,
    name: &str,
    issues: &mut Vec<BindingIssue>,
    catalog: &DiscoverResponse,
) -> Option<&'c DiscoveredStream> {
    let candidates = by_name.get(binding.stream.as_str()).map(Vec::as_slice).unwrap_or(&[]);

    let found: Vec<&DiscoveredStream> = match &binding.namespace {
        Some(ns) => candidates
            .iter()
            .copied()
            .filter(|s| s.namespace.as_deref() == Some(ns.as_str()))
            .collect(),
        None => candidates.to_vec(),
    };

    match found.as_slice() {
        [one] => Some(*one),
        [] => {
            let mut available: Vec<String> = catalog.streams.iter().map(qualified_name).collect();
            available.sort();
            issues.push(BindingIssue::UnknownStream {
                stream: name.to_string(),
                available,
            });
            None
        },
        many => {
            issues.push(BindingIssue::AmbiguousStream {
                stream: name.to_string(),
                namespaces: many
                    .iter()
                    .map(|s| s.namespace.clone().unwrap_or_default())
                    .collect(),
            });
            None
        },
    }
}

fn qualified_name(stream: &DiscoveredStream) -> String {
    match &stream.namespace {
        Some(ns) => format!("{}.{}", ns, stream.name),
        None => stream.name.clone(),
    }
}

/// Candidate bindings for every discovered stream
///
/// Targets are placed under the capture's prefix, so `acmeCo/source-x` suggests
/// `acmeCo/<stream>`. Incremental is recommended wherever it is supported.
pub fn suggest_bindings(capture: &str, catalog: &DiscoverResponse) -> Vec<BindingDef> {
    let prefix = capture.rsplit_once('/').map_or(capture, |(prefix, _)| prefix);

    catalog
        .streams
        .iter()
        .map(|stream| {
            let mut target = prefix.to_string();
            if let Some(ns) = &stream.namespace {
                target.push('/');
                target.push_str(&collection_token(ns));
            }
            target.push('/');
            target.push_str(&collection_token(&stream.name));

            BindingDef {
                resource: ResourceDef {
                    stream: stream.name.clone(),
                    sync_mode: stream.recommended_sync_mode(),
                    namespace: stream.namespace.clone(),
                    extra: Map::new(),
                },
                target,
                disable: false,
                backfill: 0,
            }
        })
        .collect()
}

fn collection_token(name: &str) -> String {
    let token: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match token.as_str() {
        "" | "." | ".." => format!("_{}", token),
        _ => token,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stream(name: &str, modes: &[SyncMode], schema: Value) -> DiscoveredStream {
        DiscoveredStream {
            name: name.to_string(),
            namespace: None,
            json_schema: schema,
            supported_sync_modes: modes.to_vec(),
            source_defined_cursor: false,
            default_cursor_field: Vec::new(),
            key: vec!["/id".to_string()],
        }
    }

    fn catalog() -> DiscoverResponse {
        DiscoverResponse {
            streams: vec![
                stream(
                    "clients",
                    &[SyncMode::FullRefresh, SyncMode::Incremental],
                    json!({"type": "object", "properties": {"id": {"type": "string"}}}),
                ),
                stream(
                    "invoices",
                    &[SyncMode::FullRefresh],
                    json!({"type": "object", "properties": {"amount": {"type": "number"}}}),
                ),
                stream(
                    "contacts",
                    &[SyncMode::FullRefresh],
                    json!({"type": "object", "properties": {"id": {"type": "string"}}}),
                ),
            ],
        }
    }

    #[test]
    fn test_resolves_valid_bindings() {
        let bindings = vec![
            Binding::new("clients", SyncMode::Incremental, "acmeCo/clients"),
            Binding::new("invoices", SyncMode::FullRefresh, "acmeCo/invoices"),
        ];
        let plan = resolve(&bindings, &catalog()).unwrap();
        assert_eq!(plan.bindings.len(), 2);
        assert_eq!(plan.bindings[1].index, 1);
        assert_eq!(plan.bindings[0].key, vec!["/id"]);
    }

    #[test]
    fn test_collects_every_issue() {
        let bindings = vec![
            Binding::new("clients", SyncMode::Incremental, "acmeCo/clients"),
            Binding::new("payments", SyncMode::FullRefresh, "acmeCo/payments"),
            Binding::new("invoices", SyncMode::Incremental, "acmeCo/invoices"),
            Binding::new("clients", SyncMode::FullRefresh, "acmeCo/clients-again"),
            Binding::new("contacts", SyncMode::FullRefresh, "acmeCo/bad target"),
        ];
        let err = resolve(&bindings, &catalog()).unwrap_err();
        assert_eq!(err.issues.len(), 4);
        assert_eq!(err.streams(), vec!["payments", "invoices", "clients", "contacts"]);

        let text = err.to_string();
        assert!(text.contains("stream 'payments' is not offered"));
        assert!(text.contains("does not support syncMode incremental"));
    }

    #[test]
    fn test_incompatible_schemas_on_one_target() {
        let bindings = vec![
            Binding::new("clients", SyncMode::FullRefresh, "acmeCo/shared"),
            Binding::new("invoices", SyncMode::FullRefresh, "acmeCo/shared"),
        ];
        let err = resolve(&bindings, &catalog()).unwrap_err();
        assert_eq!(
            err.issues,
            vec![BindingIssue::IncompatibleTarget {
                target: "acmeCo/shared".to_string(),
                stream: "invoices".to_string(),
                other_stream: "clients".to_string(),
            }]
        );
    }

    #[test]
    fn test_same_schema_on_one_target_is_still_a_duplicate() {
        let bindings = vec![
            Binding::new("clients", SyncMode::FullRefresh, "acmeCo/people"),
            Binding::new("contacts", SyncMode::FullRefresh, "acmeCo/people"),
        ];
        let err = resolve(&bindings, &catalog()).unwrap_err();
        assert!(matches!(err.issues[0], BindingIssue::DuplicateTarget { .. }));
    }

    #[test]
    fn test_disabled_bindings_are_skipped() {
        let mut disabled = Binding::new("payments", SyncMode::FullRefresh, "acmeCo/payments");
        disabled.disable = true;
        let bindings = vec![
            Binding::new("clients", SyncMode::Incremental, "acmeCo/clients"),
            disabled,
        ];
        let plan = resolve(&bindings, &catalog()).unwrap();
        assert_eq!(plan.bindings.len(), 1);
        assert_eq!(plan.disabled, vec!["payments"]);
    }

    #[test]
    fn test_namespaces() {
        let mut public = stream("users", &[SyncMode::Incremental], json!({}));
        public.namespace = Some("public".to_string());
        let mut audit = stream("users", &[SyncMode::Incremental], json!({}));
        audit.namespace = Some("audit".to_string());
        let catalog = DiscoverResponse {
            streams: vec![public, audit],
        };

        let ambiguous = vec![Binding::new("users", SyncMode::Incremental, "acmeCo/users")];
        let err = resolve(&ambiguous, &catalog).unwrap_err();
        assert!(matches!(err.issues[0], BindingIssue::AmbiguousStream { .. }));

        let mut scoped = Binding::new("users", SyncMode::Incremental, "acmeCo/users");
        scoped.namespace = Some("audit".to_string());
        let plan = resolve(&[scoped], &catalog).unwrap();
        assert_eq!(plan.bindings[0].qualified_stream(), "audit.users");
    }

    #[test]
    fn test_implicit_namespace_counts_as_duplicate() {
        let mut public = stream("users", &[SyncMode::Incremental], json!({}));
        public.namespace = Some("public".to_string());
        let catalog = DiscoverResponse {
            streams: vec![public],
        };

        let implicit = Binding::new("users", SyncMode::Incremental, "acmeCo/users-a");
        let mut explicit = Binding::new("users", SyncMode::Incremental, "acmeCo/users-b");
        explicit.namespace = Some("public".to_string());

        let err = resolve(&[implicit, explicit], &catalog).unwrap_err();
        assert_eq!(
            err.issues,
            vec![BindingIssue::DuplicateStream {
                stream: "public.users".to_string(),
            }]
        );
    }

    #[test]
    fn test_suggested_bindings_resolve() {
        let mut catalog = catalog();
        catalog.streams.push(stream("Sales Orders", &[SyncMode::FullRefresh], json!({})));

        let suggested = suggest_bindings("acmeCo/source-airtable", &catalog);
        assert_eq!(suggested[0].target, "acmeCo/clients");
        assert_eq!(suggested[0].resource.sync_mode, SyncMode::Incremental);
        assert_eq!(suggested[1].resource.sync_mode, SyncMode::FullRefresh);
        assert_eq!(suggested[3].target, "acmeCo/Sales_Orders");

        let bindings: Vec<Binding> = suggested
            .iter()
            .map(|def| {
                Binding::new(
                    def.resource.stream.clone(),
                    def.resource.sync_mode,
                    def.target.clone(),
                )
            })
            .collect();
        let plan = resolve(&bindings, &catalog).unwrap();
        assert_eq!(plan.bindings.len(), 4);
    }
}
