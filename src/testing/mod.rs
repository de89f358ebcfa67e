//! Testing utilities for users of the planstack library.
//!
//! - [`ScriptedWorker`]: a worker whose per-plan outcome is scripted and
//!   which records every invocation
//! - [`TestHarness`]: an engine and stack manager wired to in-memory storage

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::plan::{Plan, StaticPlanLoader};
use crate::core::types::{PlanId, StackId};
use crate::execution::{
    ExecutionEngine, RunOptions, RunReport, Worker, WorkerError, WorkerOutput,
};
use crate::manager::{CreateOptions, StackManager};
use crate::storage::{InMemoryStorage, StackStatus};

/// Scripted result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Exit with this code.
    Exit(i32),
    /// Terminate without an exit code.
    Terminated,
    /// Fail to start with this message.
    Error(String),
}

impl Default for ScriptedOutcome {
    fn default() -> Self {
        ScriptedOutcome::Exit(0)
    }
}

/// A worker with scripted outcomes.
///
/// Plans without a scripted outcome exit with code 0.
///
/// ```
/// use planstack::testing::{ScriptedOutcome, ScriptedWorker};
///
/// let worker = ScriptedWorker::new().with_outcome("flaky", ScriptedOutcome::Exit(1));
/// worker.set_outcome("flaky", ScriptedOutcome::Exit(0));
/// assert!(worker.invocations().is_empty());
/// ```
#[derive(Default)]
pub struct ScriptedWorker {
    outcomes: Mutex<HashMap<PlanId, ScriptedOutcome>>,
    invocations: Mutex<Vec<PlanId>>,
    delay: Option<Duration>,
}

impl ScriptedWorker {
    /// A worker where every plan succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome of `id`.
    pub fn with_outcome(self, id: impl Into<PlanId>, outcome: ScriptedOutcome) -> Self {
        self.set_outcome(id, outcome);
        self
    }

    /// Sleep this long inside every invocation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Change the outcome of `id` for later invocations.
    pub fn set_outcome(&self, id: impl Into<PlanId>, outcome: ScriptedOutcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.insert(id.into(), outcome);
        }
    }

    /// Plans invoked so far, in invocation order.
    pub fn invocations(&self) -> Vec<PlanId> {
        self.invocations
            .lock()
            .map(|i| i.clone())
            .unwrap_or_default()
    }

    /// How many times `id` was invoked.
    pub fn invocation_count(&self, id: &PlanId) -> usize {
        self.invocations().iter().filter(|i| *i == id).count()
    }

    /// Forget recorded invocations.
    pub fn clear_invocations(&self) {
        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.clear();
        }
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn invoke(&self, plan: &Plan) -> Result<WorkerOutput, WorkerError> {
        if let Ok(mut invocations) = self.invocations.lock() {
            invocations.push(plan.id.clone());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let outcome = self
            .outcomes
            .lock()
            .ok()
            .and_then(|o| o.get(&plan.id).cloned())
            .unwrap_or_default();

        match outcome {
            ScriptedOutcome::Exit(code) => Ok(WorkerOutput {
                exit_code: Some(code),
                duration: self.delay.unwrap_or_default(),
                stdout: plan.content.clone(),
                stderr: String::new(),
            }),
            ScriptedOutcome::Terminated => Ok(WorkerOutput {
                exit_code: None,
                ..WorkerOutput::default()
            }),
            ScriptedOutcome::Error(message) => Err(WorkerError::SpawnFailed(message)),
        }
    }
}

/// A stack manager and engine over in-memory storage and a static loader.
///
/// # Example
///
/// ```
/// use planstack::Plan;
/// use planstack::testing::{ScriptedOutcome, TestHarness};
///
/// # tokio_test_block(async {
/// let harness = TestHarness::new()
///     .with_plan(Plan::new("build"))
///     .with_plan(Plan::new("deploy").with_references(["build"]))
///     .with_outcome("build", ScriptedOutcome::Exit(1));
///
/// let report = harness.create_and_run("release", &["build", "deploy"]).await;
/// assert_eq!(report.failed_count(), 1);
/// assert_eq!(report.skipped_count(), 1);
/// # });
/// # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct TestHarness {
    loader: StaticPlanLoader,
    worker: Arc<ScriptedWorker>,
    storage: Arc<InMemoryStorage>,
}

impl TestHarness {
    /// Create a harness with no plans.
    pub fn new() -> Self {
        Self {
            loader: StaticPlanLoader::new(),
            worker: Arc::new(ScriptedWorker::new()),
            storage: Arc::new(InMemoryStorage::new()),
        }
    }

    /// Make `plan` available to the loader.
    pub fn with_plan(mut self, plan: Plan) -> Self {
        self.loader.insert(plan);
        self
    }

    /// Script the worker outcome of `id`.
    pub fn with_outcome(self, id: impl Into<PlanId>, outcome: ScriptedOutcome) -> Self {
        self.worker.set_outcome(id, outcome);
        self
    }

    /// The scripted worker.
    pub fn worker(&self) -> &Arc<ScriptedWorker> {
        &self.worker
    }

    /// The storage backend.
    pub fn storage(&self) -> &Arc<InMemoryStorage> {
        &self.storage
    }

    /// A stack manager over the harness plans and storage.
    pub fn manager(&self) -> StackManager {
        StackManager::new(self.storage.clone(), Arc::new(self.loader.clone()))
    }

    /// An engine over the harness plans, storage and worker.
    pub fn engine(&self) -> ExecutionEngine {
        ExecutionEngine::new(
            self.storage.clone(),
            Arc::new(self.loader.clone()),
            self.worker.clone(),
        )
    }

    /// Create a stack from `selection` and run it once.
    ///
    /// Panics if the stack cannot be created or the run aborts.
    pub async fn create_and_run(&self, name: &str, selection: &[&str]) -> RunReport {
        let ids: Vec<PlanId> = selection.iter().map(|id| PlanId::new(*id)).collect();
        self.manager()
            .create_stack(name, &ids, CreateOptions::default())
            .await
            .unwrap_or_else(|e| panic!("failed to create stack {}: {}", name, e));
        self.run(name).await
    }

    /// Run an existing stack. Panics if the run aborts.
    pub async fn run(&self, name: &str) -> RunReport {
        self.engine()
            .run(&StackId::new(name), RunOptions::new())
            .await
            .unwrap_or_else(|e| panic!("run of {} aborted: {}", name, e))
    }

    /// Run and assert that no plan failed or was skipped.
    pub async fn run_and_assert_success(&self, name: &str) -> RunReport {
        let report = self.run(name).await;
        assert!(
            report.success(),
            "Expected stack to succeed, but {} failed and {} were skipped",
            report.failed_count(),
            report.skipped_count()
        );
        report
    }

    /// Backfilled status of a stack. Panics if the stack does not exist.
    pub async fn status(&self, name: &str) -> StackStatus {
        self.engine()
            .status(&StackId::new(name))
            .await
            .unwrap_or_else(|e| panic!("failed to read status of {}: {}", name, e))
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
