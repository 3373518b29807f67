//! Capture sessions and their reports

use crate::checkpoint::{Checkpoint, CheckpointKey};
use crate::error::{ErrorKind, RuntimeError};
use crate::protocol::SyncMode;
use crate::resolver::{BindingPlan, ResolvedBinding};
use crate::schema::ValidatedConfig;
use crate::state::BindingPhase;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One run of a capture: a validated configuration, its resolved bindings and
/// the checkpoints they reach
pub struct CaptureSession {
    id: Uuid,
    capture: String,
    config: ValidatedConfig,
    plan: BindingPlan,
    started_at: DateTime<Utc>,
    /// Latest durable checkpoint per binding index
    checkpoints: Mutex<BTreeMap<usize, Checkpoint>>,
    cancel: CancellationToken,
}

impl CaptureSession {
    /// Create a session cancelled together with `parent`
    pub fn new(
        capture: impl Into<String>,
        config: ValidatedConfig,
        plan: BindingPlan,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            capture: capture.into(),
            config,
            plan,
            started_at: Utc::now(),
            checkpoints: Mutex::new(BTreeMap::new()),
            cancel: parent.child_token(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn capture(&self) -> &str {
        &self.capture
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    pub fn bindings(&self) -> &[ResolvedBinding] {
        &self.plan.bindings
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop every binding of this session
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn key_for(&self, binding: &ResolvedBinding) -> CheckpointKey {
        CheckpointKey::new(self.capture.clone(), binding.stream.clone())
            .with_namespace(binding.namespace.clone())
            .with_backfill(binding.backfill)
    }

    /// Remember the latest durable checkpoint of a binding
    pub fn record_checkpoint(&self, binding: &ResolvedBinding, checkpoint: &Checkpoint) {
        if let Ok(mut checkpoints) = self.checkpoints.lock() {
            checkpoints.insert(binding.index, checkpoint.clone());
        }
    }

    pub fn checkpoint_of(&self, binding: &ResolvedBinding) -> Option<Checkpoint> {
        self.checkpoints
            .lock()
            .ok()
            .and_then(|c| c.get(&binding.index).cloned())
    }

    /// Close the session with the outcome of each binding
    pub fn finish(self, mut bindings: Vec<BindingReport>) -> SessionReport {
        bindings.sort_by_key(|b| b.index);

        let status = if bindings
            .iter()
            .any(|b| matches!(b.outcome, BindingOutcome::Failed { .. }))
        {
            SessionStatus::Failed
        } else if bindings
            .iter()
            .any(|b| matches!(b.outcome, BindingOutcome::Cancelled))
        {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Completed
        };

        SessionReport {
            session_id: self.id,
            capture: self.capture,
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
            bindings,
            disabled: self.plan.disabled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a binding's read ended
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BindingOutcome {
    Completed,
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

impl BindingOutcome {
    pub fn from_error(err: &RuntimeError) -> Self {
        match err {
            RuntimeError::Cancelled => BindingOutcome::Cancelled,
            other => BindingOutcome::Failed {
                kind: other.kind(),
                message: other.to_string(),
            },
        }
    }
}

/// Result of one binding within a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BindingReport {
    pub index: usize,
    pub stream: String,
    pub target: String,
    pub sync_mode: SyncMode,
    pub phase: BindingPhase,
    #[serde(flatten)]
    pub outcome: BindingOutcome,
    pub records_forwarded: u64,
    pub commits: u64,
    /// Checkpoints skipped because their cursor fell behind the bound
    pub regressions: u64,
    pub attempts: u32,
    /// Last durable checkpoint; a retried session resumes here
    pub resume_checkpoint: Option<Checkpoint>,
}

/// Summary of a finished session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub capture: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub bindings: Vec<BindingReport>,
    pub disabled: Vec<String>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Completed
    }

    pub fn total_records(&self) -> u64 {
        self.bindings.iter().map(|b| b.records_forwarded).sum()
    }

    pub fn binding(&self, stream: &str) -> Option<&BindingReport> {
        self.bindings.iter().find(|b| b.stream == stream)
    }

    /// Bindings that failed, with their errors
    pub fn failures(&self) -> impl Iterator<Item = (&BindingReport, ErrorKind, &str)> {
        self.bindings.iter().filter_map(|b| match &b.outcome {
            BindingOutcome::Failed { kind, message } => Some((b, *kind, message.as_str())),
            _ => None,
        })
    }
}
