//! Storage abstraction for stacks, plan statuses and run state.
//!
//! Stack structure and run history are kept apart: a [`Stack`] records which
//! plans belong together, a [`StackStatus`] records what happened when they
//! ran. Backends implement [`Storage`] (in-memory, SQLite).

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::InMemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::core::stack::Stack;
use crate::core::time;
use crate::core::types::{PlanId, RunId, StackId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Status of a plan within a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanStatus {
    /// Not run yet, or reset.
    #[default]
    Pending,
    /// Currently being worked on.
    Running,
    /// Worker exited with code 0.
    Completed,
    /// Worker failed or could not be invoked.
    Failed,
    /// Not attempted because a dependency was not satisfied.
    Skipped,
}

impl PlanStatus {
    /// Lowercase name, as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanStatus::Pending => "pending",
            PlanStatus::Running => "running",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PlanStatus::Pending),
            "running" => Ok(PlanStatus::Running),
            "completed" => Ok(PlanStatus::Completed),
            "failed" => Ok(PlanStatus::Failed),
            "skipped" => Ok(PlanStatus::Skipped),
            other => Err(StorageError::SerializationError(format!(
                "unknown plan status: {}",
                other
            ))),
        }
    }
}

/// Persisted status of one plan.
///
/// Everything except `status` is only meaningful once the plan has run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatusRecord {
    /// Current status.
    pub status: PlanStatus,
    /// When the plan last started executing.
    #[serde(default, with = "time::opt_millis")]
    pub last_executed_at: Option<SystemTime>,
    /// Duration of the last execution.
    #[serde(default, rename = "durationMs", with = "time::opt_duration_millis")]
    pub duration: Option<Duration>,
    /// Failure or skip reason.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Worker exit code of the last execution.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl PlanStatusRecord {
    /// A fresh pending record.
    pub fn pending() -> Self {
        Self::default()
    }

    /// Mark the plan as running, starting now.
    pub fn mark_running(&mut self) {
        self.status = PlanStatus::Running;
        self.last_executed_at = Some(SystemTime::now());
        self.duration = None;
        self.error_message = None;
        self.exit_code = None;
    }

    /// Mark the plan as completed.
    pub fn mark_completed(&mut self, duration: Duration, exit_code: Option<i32>) {
        self.status = PlanStatus::Completed;
        self.duration = Some(duration);
        self.exit_code = exit_code;
        self.error_message = None;
    }

    /// Mark the plan as failed.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        duration: Option<Duration>,
        exit_code: Option<i32>,
    ) {
        self.status = PlanStatus::Failed;
        self.duration = duration;
        self.exit_code = exit_code;
        self.error_message = Some(error.into());
    }

    /// Mark the plan as skipped. `last_executed_at` keeps the previous value.
    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = PlanStatus::Skipped;
        self.duration = None;
        self.exit_code = None;
        self.error_message = Some(reason.into());
    }
}

/// Run-level state of a stack.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    /// Whether a run currently holds the lease.
    pub is_running: bool,
    /// When the last run ended.
    #[serde(default, with = "time::opt_millis")]
    pub last_run_at: Option<SystemTime>,
    /// Token of the run holding the lease.
    #[serde(default)]
    pub lease: Option<RunId>,
    /// When the lease was taken.
    #[serde(default, with = "time::opt_millis")]
    pub lease_acquired_at: Option<SystemTime>,
}

/// All recorded status for one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackStatus {
    /// The stack this status belongs to.
    pub stack_id: StackId,
    /// Per-plan records.
    pub plans: BTreeMap<PlanId, PlanStatusRecord>,
    /// Run-level state.
    #[serde(flatten)]
    pub run: RunState,
}

impl StackStatus {
    /// Empty status: nothing recorded, no run active.
    pub fn new(stack_id: StackId) -> Self {
        Self {
            stack_id,
            plans: BTreeMap::new(),
            run: RunState::default(),
        }
    }

    /// Record for `id`, synthesizing `pending` when absent.
    pub fn record(&self, id: &PlanId) -> PlanStatusRecord {
        self.plans.get(id).cloned().unwrap_or_default()
    }

    /// Status of `id`, `pending` when absent.
    pub fn status_of(&self, id: &PlanId) -> PlanStatus {
        self.plans.get(id).map(|r| r.status).unwrap_or_default()
    }

    /// Insert `pending` records for every id without one.
    pub fn backfill<'a>(&mut self, ids: impl IntoIterator<Item = &'a PlanId>) {
        for id in ids {
            self.plans.entry(id.clone()).or_default();
        }
    }

    /// Ids recorded as completed.
    pub fn completed_ids(&self) -> BTreeSet<PlanId> {
        self.plans
            .iter()
            .filter(|(_, r)| r.status == PlanStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Ids currently recorded with `status`.
    pub fn ids_with_status(&self, status: PlanStatus) -> Vec<PlanId> {
        self.plans
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Storage trait for persisting stacks and their run history.
#[async_trait]
pub trait Storage: Send + Sync {
    // Stack operations

    /// Save a new stack. Fails with `DuplicateKey` if the name is taken.
    async fn save_stack(&self, stack: Stack) -> Result<(), StorageError>;

    /// Replace an existing stack.
    async fn update_stack(&self, stack: Stack) -> Result<(), StorageError>;

    /// Get a stack by name.
    async fn get_stack(&self, id: &StackId) -> Result<Stack, StorageError>;

    /// List all stacks, oldest first.
    async fn list_stacks(&self) -> Result<Vec<Stack>, StorageError>;

    /// Delete a stack together with its status record.
    async fn delete_stack(&self, id: &StackId) -> Result<(), StorageError>;

    // Status operations

    /// Get the status record of a stack. Unknown stacks yield an empty status.
    async fn get_status(&self, id: &StackId) -> Result<StackStatus, StorageError>;

    /// Insert or overwrite one plan's status.
    async fn save_plan_status(
        &self,
        id: &StackId,
        plan_id: &PlanId,
        record: PlanStatusRecord,
    ) -> Result<(), StorageError>;

    /// Drop status records of the given plans.
    async fn remove_plan_statuses(
        &self,
        id: &StackId,
        plan_ids: &[PlanId],
    ) -> Result<(), StorageError>;

    /// Clear every plan status and the run state, unconditionally.
    async fn reset_status(&self, id: &StackId) -> Result<(), StorageError>;

    // Run guard

    /// Atomically take the run lease. Returns `false` if a run already holds it.
    async fn try_acquire_run(&self, id: &StackId, lease: RunId) -> Result<bool, StorageError>;

    /// Release the lease held by `lease` and record `last_run_at`.
    ///
    /// Returns `false` if `lease` no longer holds it.
    async fn release_run(&self, id: &StackId, lease: RunId) -> Result<bool, StorageError>;

    /// Release whatever lease is held, returning its token.
    async fn force_release_run(&self, id: &StackId) -> Result<Option<RunId>, StorageError>;
}
