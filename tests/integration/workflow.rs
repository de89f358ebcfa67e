//! Complete workflow integration tests.
//!
//! Tests that verify the full pipeline from plan files to execution.

use crate::common::{PlanDir, ids, status_of};
use async_trait::async_trait;
use planstack::{
    CommandWorker, CreateOptions, DirectoryPlanLoader, EngineError, Event, EventBus,
    EventHandler, ExecutionEngine, InMemoryStorage, PlanId, PlanStatus, RunOptions, StackError,
    StackId, StackManager, UNMET_DEPENDENCY_MESSAGE,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Recording event handler for verifying events.
struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    async fn started_plans(&self) -> Vec<PlanId> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                Event::PlanStarted { plan_id, .. } => Some(plan_id.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}

struct Fixture {
    plans: PlanDir,
    storage: Arc<InMemoryStorage>,
    loader: Arc<DirectoryPlanLoader>,
}

impl Fixture {
    fn new() -> Self {
        let plans = PlanDir::new();
        let loader = Arc::new(DirectoryPlanLoader::new(plans.path()));
        Self {
            plans,
            storage: Arc::new(InMemoryStorage::new()),
            loader,
        }
    }

    /// A plan whose script appends its id to the shared log.
    fn logging_plan(&self, id: &str, references: &[&str]) {
        let script = format!("echo {} >> '{}'", id, self.plans.log_path().display());
        self.plans.write_plan(id, references, &script);
    }

    fn manager(&self) -> StackManager {
        StackManager::new(self.storage.clone(), self.loader.clone())
    }

    fn engine(&self) -> ExecutionEngine {
        ExecutionEngine::new(
            self.storage.clone(),
            self.loader.clone(),
            Arc::new(CommandWorker::builder("sh").build()),
        )
    }
}

/// Test: A diamond of plan files runs in dependency order through `sh`.
#[cfg(unix)]
#[tokio::test]
async fn test_plan_files_run_in_dependency_order() {
    let fx = Fixture::new();
    fx.logging_plan("setup", &[]);
    fx.logging_plan("api", &["setup"]);
    fx.logging_plan("web", &["setup"]);
    fx.logging_plan("release", &["api", "web"]);

    let stack = fx
        .manager()
        .create_stack("ship", &ids(&["release"]), CreateOptions::with_references())
        .await
        .unwrap();
    assert_eq!(stack.len(), 4);
    assert_eq!(stack.root_ids, ids(&["setup"]));

    let handler = RecordingHandler::new();
    let bus = Arc::new(EventBus::new());
    bus.register(handler.clone());
    let engine = fx.engine().with_event_bus(bus);

    let report = engine.run(&stack.id, RunOptions::new()).await.unwrap();
    assert!(report.success());
    assert_eq!(report.order, ids(&["setup", "api", "web", "release"]));
    assert_eq!(fx.plans.log_lines(), vec!["setup", "api", "web", "release"]);
    assert_eq!(handler.started_plans().await, report.order);

    let events = handler.events().await;
    assert!(matches!(events.first(), Some(Event::RunStarted { plan_count: 4, .. })));
    assert!(matches!(events.last(), Some(Event::RunCompleted { success: true, .. })));

    let status = engine.status(&stack.id).await.unwrap();
    for id in ["setup", "api", "web", "release"] {
        let record = status.record(&PlanId::new(id));
        assert_eq!(record.status, PlanStatus::Completed);
        assert_eq!(record.exit_code, Some(0));
        assert!(record.last_executed_at.is_some());
        assert!(record.duration.is_some());
    }
    assert!(!status.run.is_running);
    assert!(status.run.last_run_at.is_some());
}

/// Test: A failing plan skips its dependents; fixing it and re-running resumes.
#[cfg(unix)]
#[tokio::test]
async fn test_failure_skips_dependents_and_rerun_resumes() {
    let fx = Fixture::new();
    fx.logging_plan("build", &[]);
    fx.plans.write_plan("test", &["build"], "exit 3");
    fx.logging_plan("deploy", &["test"]);
    fx.logging_plan("docs", &[]);

    let stack = fx
        .manager()
        .create_stack(
            "pipeline",
            &ids(&["build", "test", "deploy", "docs"]),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    let engine = fx.engine();

    let first = engine.run(&stack.id, RunOptions::new()).await.unwrap();
    assert!(!first.success());

    let status = engine.status(&stack.id).await.unwrap();
    assert_eq!(status_of(&status, "build"), PlanStatus::Completed);
    assert_eq!(status_of(&status, "docs"), PlanStatus::Completed);

    let test = status.record(&PlanId::new("test"));
    assert_eq!(test.status, PlanStatus::Failed);
    assert_eq!(test.exit_code, Some(3));
    assert_eq!(
        test.error_message.as_deref(),
        Some("plan exited with non-zero code 3")
    );

    let deploy = status.record(&PlanId::new("deploy"));
    assert_eq!(deploy.status, PlanStatus::Skipped);
    assert_eq!(deploy.error_message.as_deref(), Some(UNMET_DEPENDENCY_MESSAGE));

    // Fix the failing plan; completed plans are not run again.
    fx.logging_plan("test", &["build"]);
    let second = engine.run(&stack.id, RunOptions::new()).await.unwrap();
    assert!(second.success());
    assert_eq!(second.already_completed_count(), 2);

    let lines = fx.plans.log_lines();
    assert_eq!(lines.iter().filter(|l| *l == "build").count(), 1);
    assert_eq!(lines.iter().filter(|l| *l == "docs").count(), 1);
    assert!(lines.ends_with(&["test".to_string(), "deploy".to_string()]));
}

/// Test: The worker sees the plan id in its environment and arguments.
#[cfg(unix)]
#[tokio::test]
async fn test_worker_receives_plan_id() {
    let fx = Fixture::new();
    fx.plans.write_plan("one", &[], "ignored");

    let log = fx.plans.log_path();
    let script = format!("echo \"$1:$PLANSTACK_PLAN_ID\" >> '{}'", log.display());
    let worker = CommandWorker::builder("sh")
        .arg("-c")
        .arg(script)
        .arg("sh")
        .arg("{id}")
        .build();

    fx.manager()
        .create_stack("env", &ids(&["one"]), CreateOptions::default())
        .await
        .unwrap();
    let engine = ExecutionEngine::new(fx.storage.clone(), fx.loader.clone(), Arc::new(worker));
    let report = engine
        .run(&StackId::new("env"), RunOptions::new())
        .await
        .unwrap();

    assert!(report.success());
    assert_eq!(fx.plans.log_lines(), vec!["one:one"]);
}

/// Test: Running from a plan truncates the order; dry runs touch nothing.
#[cfg(unix)]
#[tokio::test]
async fn test_from_and_dry_run() {
    let fx = Fixture::new();
    fx.logging_plan("a", &[]);
    fx.logging_plan("b", &["a"]);
    fx.logging_plan("c", &["b"]);

    let stack = fx
        .manager()
        .create_stack("chain", &ids(&["c"]), CreateOptions::with_references())
        .await
        .unwrap();
    let engine = fx.engine();

    let dry = engine
        .run(&stack.id, RunOptions::new().with_from("b").with_dry_run(true))
        .await
        .unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.order, ids(&["b", "c"]));
    assert!(fx.plans.log_lines().is_empty());

    // `a` never completed, so starting at `b` skips the rest.
    let report = engine
        .run(&stack.id, RunOptions::new().with_from("b"))
        .await
        .unwrap();
    assert_eq!(report.skipped_count(), 2);
    assert!(fx.plans.log_lines().is_empty());

    let missing = engine
        .run(&stack.id, RunOptions::new().with_from("zzz"))
        .await;
    assert!(matches!(missing, Err(EngineError::StartPlanNotFound { .. })));
}

/// Test: Editing plan references changes the stack graph on add.
#[tokio::test]
async fn test_add_and_remove_plans_recompute_graph() {
    let fx = Fixture::new();
    fx.plans.write_plan("a", &[], "true");
    fx.plans.write_plan("b", &["a"], "true");
    fx.plans.write_plan("c", &[], "true");

    let manager = fx.manager();
    let stack = manager
        .create_stack("edit", &ids(&["a", "b"]), CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(stack.root_ids, ids(&["a"]));

    // `c` now depends on `b`.
    fx.plans.write_plan("c", &["b"], "true");
    let stack = manager.add_plans(&stack.id, &ids(&["c"])).await.unwrap();
    assert_eq!(stack.len(), 3);
    assert_eq!(stack.graph().execution_order().unwrap(), ids(&["a", "b", "c"]));

    let stack = manager.remove_plans(&stack.id, &ids(&["a"])).await.unwrap();
    assert_eq!(stack.root_ids, ids(&["b"]));

    let result = manager.remove_plans(&stack.id, &ids(&["b", "c"])).await;
    assert!(matches!(result, Err(StackError::NoValidPlans(_))));
}

/// Test: A selection with no loadable plans is rejected.
#[tokio::test]
async fn test_create_with_unknown_plans_fails() {
    let fx = Fixture::new();
    let result = fx
        .manager()
        .create_stack("empty", &ids(&["ghost"]), CreateOptions::default())
        .await;
    assert!(matches!(result, Err(StackError::NoValidPlans(_))));
}

/// Test: Cyclic references abort the run before any plan starts.
#[tokio::test]
async fn test_cycle_aborts_run() {
    let fx = Fixture::new();
    fx.plans.write_plan("x", &["y"], "true");
    fx.plans.write_plan("y", &["x"], "true");

    let stack = fx
        .manager()
        .create_stack("loop", &ids(&["x", "y"]), CreateOptions::default())
        .await
        .unwrap();
    let engine = fx.engine();

    match engine.run(&stack.id, RunOptions::new()).await {
        Err(EngineError::Cycle { path }) => {
            assert_eq!(path.first(), path.last());
            assert!(path.len() >= 3);
        }
        other => panic!("expected cycle error, got {:?}", other.map(|r| r.order)),
    }

    let status = engine.status(&stack.id).await.unwrap();
    assert!(!status.run.is_running);
    assert_eq!(status_of(&status, "x"), PlanStatus::Pending);
}
