//! Per-binding sync state machine
//!
//! ```text
//! NotStarted ──start──▶ Running ──commit──▶ Checkpointed ──record──▶ Running
//!     │                    │                     │
//!     │                    ├──────complete───────┤──▶ Completed
//!     └───────fail─────────┴────────fail─────────┴──▶ Failed
//! ```
//!
//! `NotStarted ──fail──▶ Failed` covers bindings whose prior checkpoint could
//! not be loaded or cleared.
//!
//! Incremental bindings resume from their last persisted checkpoint and only
//! move their cursor bound forward. A checkpoint whose cursor falls behind the
//! bound is treated as a flush boundary: its records are forwarded, but the
//! checkpoint itself is not persisted. Full-refresh bindings start from scratch
//! every time and never produce a checkpoint.

use crate::checkpoint::{Checkpoint, Cursor};
use crate::protocol::{CheckpointMessage, SyncMode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

/// Lifecycle phase of one binding within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingPhase {
    NotStarted,
    Running,
    Checkpointed,
    Completed,
    Failed,
}

impl BindingPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BindingPhase::NotStarted => "not_started",
            BindingPhase::Running => "running",
            BindingPhase::Checkpointed => "checkpointed",
            BindingPhase::Completed => "completed",
            BindingPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BindingPhase::Completed | BindingPhase::Failed)
    }
}

impl std::fmt::Display for BindingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Binding '{stream}' cannot go from {from} to {to}")]
    IllegalTransition {
        stream: String,
        from: BindingPhase,
        to: BindingPhase,
    },

    #[error("Binding '{stream}' emitted cursor {cursor} which cannot be compared with bound {bound}")]
    IncomparableCursor {
        stream: String,
        cursor: Cursor,
        bound: Cursor,
    },
}

/// Where the connector should resume reading
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumePoint {
    /// Connector state of the last persisted checkpoint
    pub state: Option<Value>,
    /// Lower bound for records
    pub start_cursor: Option<Cursor>,
}

/// Outcome of applying a checkpoint message, to be acted on once records are flushed
#[derive(Debug, Clone, PartialEq)]
pub struct CommitPlan {
    connector_state: Value,
    /// Checkpoint to persist; `None` for full refresh or a regressed cursor
    pub checkpoint: Option<Checkpoint>,
    /// The message's cursor fell behind the current bound
    pub regressed: bool,
}

/// Sync state of one binding
#[derive(Debug, Clone)]
pub struct BindingState {
    stream: String,
    sync_mode: SyncMode,
    phase: BindingPhase,
    /// Last persisted checkpoint (incremental only)
    durable: Option<Checkpoint>,
    /// Latest state reported by the connector, base for merge patches
    connector_state: Value,
    /// Highest accepted cursor
    bound: Option<Cursor>,
    /// Bound used when no checkpoint has been persisted
    initial_bound: Option<Cursor>,
    /// Records counted by the loaded checkpoint
    base_records: u64,
    /// Records read since the last commit
    pending: u64,
    /// Records flushed to the target during this session
    forwarded: u64,
    commits: u64,
    regressions: u64,
}

impl BindingState {
    pub fn new(stream: impl Into<String>, sync_mode: SyncMode) -> Self {
        Self {
            stream: stream.into(),
            sync_mode,
            phase: BindingPhase::NotStarted,
            durable: None,
            connector_state: empty_state(),
            bound: None,
            initial_bound: None,
            base_records: 0,
            pending: 0,
            forwarded: 0,
            commits: 0,
            regressions: 0,
        }
    }

    pub fn phase(&self) -> BindingPhase {
        self.phase
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Last persisted checkpoint, the resumable point of this binding
    pub fn durable_checkpoint(&self) -> Option<&Checkpoint> {
        self.durable.as_ref()
    }

    pub fn bound(&self) -> Option<&Cursor> {
        self.bound.as_ref()
    }

    pub fn records_forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn pending_records(&self) -> u64 {
        self.pending
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn regressions(&self) -> u64 {
        self.regressions
    }

    fn transition(&mut self, to: BindingPhase, allowed: &[BindingPhase]) -> Result<(), StateError> {
        if !allowed.contains(&self.phase) {
            return Err(StateError::IllegalTransition {
                stream: self.stream.clone(),
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Begin reading. `prior` is ignored for full-refresh bindings.
    pub fn start(
        &mut self,
        prior: Option<Checkpoint>,
        start_cursor: Option<Cursor>,
    ) -> Result<ResumePoint, StateError> {
        self.transition(BindingPhase::Running, &[BindingPhase::NotStarted])?;

        if self.sync_mode == SyncMode::FullRefresh {
            return Ok(ResumePoint::default());
        }

        self.initial_bound = start_cursor;
        self.base_records = prior.as_ref().map_or(0, |cp| cp.records);
        self.durable = prior;
        Ok(self.rewind())
    }

    /// Resume after a transient failure from the last persisted checkpoint
    ///
    /// Records read since the last commit are dropped.
    pub fn restart(&mut self) -> Result<ResumePoint, StateError> {
        self.transition(
            BindingPhase::Running,
            &[BindingPhase::Running, BindingPhase::Checkpointed],
        )?;
        self.pending = 0;

        if self.sync_mode == SyncMode::FullRefresh {
            self.connector_state = empty_state();
            return Ok(ResumePoint::default());
        }
        Ok(self.rewind())
    }

    fn rewind(&mut self) -> ResumePoint {
        match &self.durable {
            Some(cp) => {
                self.connector_state = cp.state.clone();
                self.bound = cp.cursor.clone().or_else(|| self.initial_bound.clone());
                ResumePoint {
                    state: Some(cp.state.clone()),
                    start_cursor: self.bound.clone(),
                }
            },
            None => {
                self.connector_state = empty_state();
                self.bound = self.initial_bound.clone();
                ResumePoint {
                    state: None,
                    start_cursor: self.bound.clone(),
                }
            },
        }
    }

    /// A record was read and buffered
    pub fn record(&mut self) -> Result<(), StateError> {
        self.transition(
            BindingPhase::Running,
            &[BindingPhase::Running, BindingPhase::Checkpointed],
        )?;
        self.pending += 1;
        Ok(())
    }

    /// Work out what a checkpoint message commits, without changing state
    pub fn plan_commit(&self, msg: &CheckpointMessage) -> Result<CommitPlan, StateError> {
        if !matches!(self.phase, BindingPhase::Running | BindingPhase::Checkpointed) {
            return Err(StateError::IllegalTransition {
                stream: self.stream.clone(),
                from: self.phase,
                to: BindingPhase::Checkpointed,
            });
        }

        let connector_state = if msg.merge {
            let mut merged = self.connector_state.clone();
            json_patch::merge(&mut merged, &msg.state);
            merged
        } else {
            msg.state.clone()
        };

        if self.sync_mode == SyncMode::FullRefresh {
            return Ok(CommitPlan {
                connector_state,
                checkpoint: None,
                regressed: false,
            });
        }

        let (cursor, regressed) = match (&msg.cursor, &self.bound) {
            (Some(cursor), Some(bound)) => match cursor.partial_cmp(bound) {
                None => {
                    return Err(StateError::IncomparableCursor {
                        stream: self.stream.clone(),
                        cursor: cursor.clone(),
                        bound: bound.clone(),
                    })
                },
                Some(Ordering::Less) => (Some(bound.clone()), true),
                Some(_) => (Some(cursor.clone()), false),
            },
            (Some(cursor), None) => (Some(cursor.clone()), false),
            (None, bound) => (bound.clone(), false),
        };

        if regressed {
            return Ok(CommitPlan {
                connector_state,
                checkpoint: None,
                regressed: true,
            });
        }

        let records = self.base_records + self.forwarded + self.pending;
        Ok(CommitPlan {
            checkpoint: Some(Checkpoint::new(connector_state.clone(), cursor, records)),
            connector_state,
            regressed: false,
        })
    }

    /// Records of the plan were flushed and its checkpoint (if any) persisted
    pub fn committed(&mut self, plan: CommitPlan) -> Result<(), StateError> {
        self.transition(
            BindingPhase::Checkpointed,
            &[BindingPhase::Running, BindingPhase::Checkpointed],
        )?;

        self.forwarded += self.pending;
        self.pending = 0;
        self.commits += 1;
        self.connector_state = plan.connector_state;
        if plan.regressed {
            self.regressions += 1;
        }
        if let Some(cp) = plan.checkpoint {
            self.bound = cp.cursor.clone();
            self.durable = Some(cp);
        }
        Ok(())
    }

    /// The connector finished; pending records must already be flushed
    pub fn complete(&mut self) -> Result<(), StateError> {
        self.transition(
            BindingPhase::Completed,
            &[BindingPhase::Running, BindingPhase::Checkpointed],
        )?;
        self.forwarded += self.pending;
        self.pending = 0;
        Ok(())
    }

    /// Abort the binding, dropping unflushed records
    pub fn fail(&mut self) -> Result<(), StateError> {
        self.transition(
            BindingPhase::Failed,
            &[
                BindingPhase::NotStarted,
                BindingPhase::Running,
                BindingPhase::Checkpointed,
            ],
        )?;
        self.pending = 0;
        Ok(())
    }
}

fn empty_state() -> Value {
    Value::Object(serde_json::Map::new())
}
