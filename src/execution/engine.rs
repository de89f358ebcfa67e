//! Stack execution engine.
//!
//! The [`ExecutionEngine`] walks a stack's deterministic execution order one
//! plan at a time. Plans already recorded as completed are left alone; a plan
//! whose dependencies are not all completed is skipped, and since a skipped
//! plan never counts as completed the skip propagates to everything
//! downstream. One plan failing never aborts the run.
//!
//! Only one run per stack may be active. The run takes an atomic lease in
//! storage before touching any status and releases it on every exit path.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::core::graph::{DependencyGraph, GraphError};
use crate::core::plan::PlanLoader;
use crate::core::stack::Stack;
use crate::core::types::{PlanId, RunId, StackId};
use crate::events::{Event, EventBus};
use crate::storage::{PlanStatus, PlanStatusRecord, StackStatus, Storage, StorageError};

use super::worker::Worker;

/// Message recorded on plans skipped because a dependency is not completed.
pub const UNMET_DEPENDENCY_MESSAGE: &str = "dependency not satisfied";

/// Message recorded when the loader no longer has a plan.
pub const PLAN_NOT_LOADED_MESSAGE: &str = "plan could not be loaded";

/// Message recorded by [`ExecutionEngine::recover`] on plans stuck running.
pub const INTERRUPTED_MESSAGE: &str = "run was interrupted";

/// Errors that abort a whole engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The stack's dependencies contain a cycle; `path` is closed.
    #[error("dependency cycle detected: {}", format_path(.path))]
    Cycle { path: Vec<PlanId> },

    /// Another run holds the stack's lease.
    #[error("stack '{0}' is already running")]
    AlreadyRunning(StackId),

    /// The requested start plan is not part of the stack.
    #[error("plan '{plan}' is not part of stack '{stack}'")]
    StartPlanNotFound { stack: StackId, plan: PlanId },

    /// Storage failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

fn format_path(path: &[PlanId]) -> String {
    path.iter()
        .map(PlanId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<GraphError> for EngineError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::CycleDetected { path } => EngineError::Cycle { path },
        }
    }
}

/// Options for a single run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Start the order at this plan, dropping everything before it.
    pub from: Option<PlanId>,
    /// Compute the order only.
    pub dry_run: bool,
}

impl RunOptions {
    /// Default options: full order, real run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start at `id`.
    pub fn with_from(mut self, id: impl Into<PlanId>) -> Self {
        self.from = Some(id.into());
        self
    }

    /// Only compute the order.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

/// What happened to one plan during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    /// Plan identifier.
    pub id: PlanId,
    /// Status after the run.
    pub status: PlanStatus,
    /// Failure or skip reason.
    pub error: Option<String>,
    /// Worker exit code.
    pub exit_code: Option<i32>,
    /// Time spent on the plan in this run.
    pub duration: Option<Duration>,
    /// Whether the worker was invoked in this run.
    pub invoked: bool,
}

impl PlanOutcome {
    fn from_record(id: PlanId, record: &PlanStatusRecord, invoked: bool) -> Self {
        Self {
            id,
            status: record.status,
            error: record.error_message.clone(),
            exit_code: record.exit_code,
            duration: if invoked { record.duration } else { None },
            invoked,
        }
    }

    /// Completed in an earlier run and left untouched.
    pub fn is_already_completed(&self) -> bool {
        self.status == PlanStatus::Completed && !self.invoked
    }
}

/// Result of [`ExecutionEngine::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The stack that ran.
    pub stack_id: StackId,
    /// Lease token of the run; `None` for a dry run.
    pub run_id: Option<RunId>,
    /// Whether only the order was computed.
    pub dry_run: bool,
    /// The (possibly truncated) execution order.
    pub order: Vec<PlanId>,
    /// Per-plan outcomes in execution order; empty for a dry run.
    pub outcomes: Vec<PlanOutcome>,
    /// Total duration.
    pub duration: Duration,
}

impl RunReport {
    fn count(&self, status: PlanStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Plans completed by this run.
    pub fn completed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == PlanStatus::Completed && o.invoked)
            .count()
    }

    /// Plans that failed in this run.
    pub fn failed_count(&self) -> usize {
        self.count(PlanStatus::Failed)
    }

    /// Plans skipped in this run.
    pub fn skipped_count(&self) -> usize {
        self.count(PlanStatus::Skipped)
    }

    /// Plans completed by an earlier run.
    pub fn already_completed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.is_already_completed())
            .count()
    }

    /// Whether no plan failed or was skipped.
    pub fn success(&self) -> bool {
        self.failed_count() == 0 && self.skipped_count() == 0
    }

    /// Outcome of a specific plan.
    pub fn outcome(&self, id: &PlanId) -> Option<&PlanOutcome> {
        self.outcomes.iter().find(|o| &o.id == id)
    }
}

/// Runs stacks against a storage backend, a plan loader and a worker.
pub struct ExecutionEngine {
    storage: Arc<dyn Storage>,
    loader: Arc<dyn PlanLoader>,
    worker: Arc<dyn Worker>,
    event_bus: Option<Arc<EventBus>>,
}

impl ExecutionEngine {
    /// Create an engine.
    pub fn new(
        storage: Arc<dyn Storage>,
        loader: Arc<dyn PlanLoader>,
        worker: Arc<dyn Worker>,
    ) -> Self {
        Self {
            storage,
            loader,
            worker,
            event_bus: None,
        }
    }

    /// Emit lifecycle events to `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// The storage backend.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    async fn emit(&self, event: Event) {
        if let Some(ref bus) = self.event_bus {
            bus.emit(event).await;
        }
    }

    /// Execution order of a stack.
    pub async fn order(&self, stack_id: &StackId) -> Result<Vec<PlanId>, EngineError> {
        let stack = self.storage.get_stack(stack_id).await?;
        Ok(stack.graph().execution_order()?)
    }

    /// Status of every plan in the stack, missing entries read as pending.
    pub async fn status(&self, stack_id: &StackId) -> Result<StackStatus, EngineError> {
        let stack = self.storage.get_stack(stack_id).await?;
        let mut status = self.storage.get_status(stack_id).await?;
        status.backfill(stack.plan_ids());
        Ok(status)
    }

    /// Return every plan to pending and clear the run state.
    ///
    /// This clears a held lease too.
    pub async fn reset(&self, stack_id: &StackId) -> Result<(), EngineError> {
        self.storage.get_stack(stack_id).await?;
        self.storage.reset_status(stack_id).await?;
        info!(stack = %stack_id, "stack status reset");
        Ok(())
    }

    /// Clean up after a run that never released its lease.
    ///
    /// Force-releases the lease and fails every plan left in `running`.
    /// Returns the ids of the plans it failed.
    pub async fn recover(&self, stack_id: &StackId) -> Result<Vec<PlanId>, EngineError> {
        if let Some(lease) = self.storage.force_release_run(stack_id).await? {
            warn!(stack = %stack_id, run = %lease, "released stale run lease");
        }

        let status = self.storage.get_status(stack_id).await?;
        let stuck = status.ids_with_status(PlanStatus::Running);
        for id in &stuck {
            let mut record = status.record(id);
            record.mark_failed(INTERRUPTED_MESSAGE, None, None);
            self.storage.save_plan_status(stack_id, id, record).await?;
            warn!(stack = %stack_id, plan = %id, "marked interrupted plan as failed");
        }
        Ok(stuck)
    }

    /// Run a stack.
    pub async fn run(
        &self,
        stack_id: &StackId,
        options: RunOptions,
    ) -> Result<RunReport, EngineError> {
        let start = Instant::now();
        let stack = self.storage.get_stack(stack_id).await?;
        let graph = stack.graph();

        if options.dry_run {
            let order = truncate_order(graph.execution_order()?, options.from.as_ref(), stack_id)?;
            debug!(stack = %stack_id, plans = order.len(), "dry run");
            return Ok(RunReport {
                stack_id: stack_id.clone(),
                run_id: None,
                dry_run: true,
                order,
                outcomes: Vec::new(),
                duration: start.elapsed(),
            });
        }

        let run_id = RunId::new();
        if !self.storage.try_acquire_run(stack_id, run_id).await? {
            return Err(EngineError::AlreadyRunning(stack_id.clone()));
        }

        let span = info_span!(
            "stack_run",
            stack = %stack_id,
            run = %run_id,
            plan_count = stack.len(),
        );
        let result = self
            .run_with_lease(&stack, &graph, run_id, &options)
            .instrument(span)
            .await;

        match self.storage.release_run(stack_id, run_id).await {
            Ok(true) => {}
            Ok(false) => warn!(stack = %stack_id, run = %run_id, "run lease was already released"),
            Err(e) if result.is_ok() => return Err(e.into()),
            Err(e) => warn!(stack = %stack_id, error = %e, "failed to release run lease"),
        }

        let (order, outcomes) = result?;
        let report = RunReport {
            stack_id: stack_id.clone(),
            run_id: Some(run_id),
            dry_run: false,
            order,
            outcomes,
            duration: start.elapsed(),
        };

        info!(
            stack = %stack_id,
            completed = report.completed_count(),
            failed = report.failed_count(),
            skipped = report.skipped_count(),
            already_completed = report.already_completed_count(),
            "run finished"
        );
        self.emit(Event::run_completed(
            stack_id.clone(),
            run_id,
            report.success(),
            report.duration,
        ))
        .await;

        Ok(report)
    }

    async fn run_with_lease(
        &self,
        stack: &Stack,
        graph: &DependencyGraph,
        run_id: RunId,
        options: &RunOptions,
    ) -> Result<(Vec<PlanId>, Vec<PlanOutcome>), EngineError> {
        let stack_id = &stack.id;
        let order = truncate_order(graph.execution_order()?, options.from.as_ref(), stack_id)?;

        self.emit(Event::run_started(stack_id.clone(), run_id, order.len()))
            .await;

        let status = self.storage.get_status(stack_id).await?;
        let mut satisfied: BTreeSet<PlanId> = status.completed_ids();
        let mut outcomes = Vec::with_capacity(order.len());

        for id in &order {
            let previous = status.record(id);

            if satisfied.contains(id) {
                debug!(plan = %id, "already completed");
                outcomes.push(PlanOutcome::from_record(id.clone(), &previous, false));
                continue;
            }

            let unmet = graph
                .dependencies(id)
                .iter()
                .any(|dep| !satisfied.contains(dep));
            if unmet {
                let mut record = previous;
                record.mark_skipped(UNMET_DEPENDENCY_MESSAGE);
                self.storage
                    .save_plan_status(stack_id, id, record.clone())
                    .await?;
                debug!(plan = %id, "skipped: dependency not satisfied");
                self.emit(Event::plan_skipped(
                    id.clone(),
                    stack_id.clone(),
                    UNMET_DEPENDENCY_MESSAGE,
                ))
                .await;
                outcomes.push(PlanOutcome::from_record(id.clone(), &record, false));
                continue;
            }

            let (record, invoked) = self.execute_plan(stack_id, id, previous).await?;
            if record.status == PlanStatus::Completed {
                satisfied.insert(id.clone());
            }
            outcomes.push(PlanOutcome::from_record(id.clone(), &record, invoked));
        }

        Ok((order, outcomes))
    }

    async fn execute_plan(
        &self,
        stack_id: &StackId,
        id: &PlanId,
        mut record: PlanStatusRecord,
    ) -> Result<(PlanStatusRecord, bool), EngineError> {
        record.mark_running();
        self.storage
            .save_plan_status(stack_id, id, record.clone())
            .await?;
        self.emit(Event::plan_started(id.clone(), stack_id.clone()))
            .await;

        let start = Instant::now();
        let plan = match self.loader.load(id) {
            Ok(Some(plan)) => Some(plan),
            Ok(None) => None,
            Err(e) => {
                warn!(plan = %id, error = %e, "failed to load plan");
                None
            }
        };

        let Some(plan) = plan else {
            record.mark_failed(PLAN_NOT_LOADED_MESSAGE, Some(start.elapsed()), None);
            self.storage
                .save_plan_status(stack_id, id, record.clone())
                .await?;
            self.emit(Event::plan_failed(
                id.clone(),
                stack_id.clone(),
                PLAN_NOT_LOADED_MESSAGE.to_string(),
            ))
            .await;
            return Ok((record, false));
        };

        debug!(plan = %id, "invoking worker");
        let result = self.worker.invoke(&plan).await;
        let duration = start.elapsed();

        let (stdout, stderr) = match result {
            Ok(output) => {
                if output.success() {
                    record.mark_completed(duration, output.exit_code);
                } else if let Some(code) = output.exit_code {
                    record.mark_failed(
                        format!("plan exited with non-zero code {}", code),
                        Some(duration),
                        Some(code),
                    );
                } else {
                    record.mark_failed(
                        "plan terminated without an exit code",
                        Some(duration),
                        None,
                    );
                }
                (Some(output.stdout), Some(output.stderr))
            }
            Err(e) => {
                record.mark_failed(e.to_string(), Some(duration), None);
                (None, None)
            }
        };

        self.storage
            .save_plan_status(stack_id, id, record.clone())
            .await?;

        if record.status == PlanStatus::Completed {
            debug!(plan = %id, duration_ms = duration.as_millis() as u64, "plan completed");
            self.emit(Event::plan_completed_with_output(
                id.clone(),
                stack_id.clone(),
                duration,
                record.exit_code,
                stdout,
                stderr,
            ))
            .await;
        } else {
            let error = record.error_message.clone().unwrap_or_default();
            warn!(plan = %id, error = %error, "plan failed");
            self.emit(Event::plan_failed_with_output(
                id.clone(),
                stack_id.clone(),
                error,
                record.exit_code,
                stdout,
                stderr,
            ))
            .await;
        }

        Ok((record, true))
    }
}

fn truncate_order(
    mut order: Vec<PlanId>,
    from: Option<&PlanId>,
    stack_id: &StackId,
) -> Result<Vec<PlanId>, EngineError> {
    let Some(from) = from else {
        return Ok(order);
    };
    match order.iter().position(|id| id == from) {
        Some(index) => Ok(order.split_off(index)),
        None => Err(EngineError::StartPlanNotFound {
            stack: stack_id.clone(),
            plan: from.clone(),
        }),
    }
}
