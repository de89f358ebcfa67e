//! Recovery scenario integration tests.
//!
//! Tests that verify runs are exclusive per stack and that a stack can be
//! recovered after an interrupted run.

use crate::common::{ids, status_of, wait_for_plan_status};
use planstack::execution::INTERRUPTED_MESSAGE;
use planstack::testing::{ScriptedOutcome, ScriptedWorker, TestHarness};
use planstack::{
    CreateOptions, EngineError, ExecutionEngine, InMemoryStorage, Plan, PlanId, PlanStatus,
    PlanStatusRecord, RunId, RunOptions, StackId, StackManager, StaticPlanLoader, Storage,
};
use std::sync::Arc;
use std::time::Duration;

fn chain_loader() -> Arc<StaticPlanLoader> {
    Arc::new(StaticPlanLoader::from_plans([
        Plan::new("a"),
        Plan::new("b").with_references(["a"]),
        Plan::new("c").with_references(["b"]),
    ]))
}

async fn slow_engine(storage: Arc<InMemoryStorage>) -> (ExecutionEngine, StackId) {
    let loader = chain_loader();
    let stack = StackManager::new(storage.clone(), loader.clone())
        .create_stack("slow", &ids(&["a", "b", "c"]), CreateOptions::default())
        .await
        .unwrap();
    let worker = Arc::new(ScriptedWorker::new().with_delay(Duration::from_millis(200)));
    (ExecutionEngine::new(storage, loader, worker), stack.id)
}

/// Test: A second run of the same stack is rejected while the first holds the lease.
#[tokio::test]
async fn test_concurrent_run_is_rejected() {
    let storage = Arc::new(InMemoryStorage::new());
    let (engine, stack) = slow_engine(storage.clone()).await;
    let engine = Arc::new(engine);

    let first = {
        let engine = engine.clone();
        let stack = stack.clone();
        tokio::spawn(async move { engine.run(&stack, RunOptions::new()).await })
    };

    wait_for_plan_status(
        storage.as_ref(),
        &stack,
        "a",
        PlanStatus::Running,
        Duration::from_secs(5),
    )
    .await;

    let second = engine.run(&stack, RunOptions::new()).await;
    assert!(matches!(second, Err(EngineError::AlreadyRunning(ref id)) if *id == stack));

    // Dry runs never take the lease.
    let dry = engine
        .run(&stack, RunOptions::new().with_dry_run(true))
        .await
        .unwrap();
    assert_eq!(dry.order, ids(&["a", "b", "c"]));

    let report = first.await.unwrap().unwrap();
    assert!(report.success());
    assert!(!storage.get_status(&stack).await.unwrap().run.is_running);
}

/// Test: Recover after a run task dies mid-plan.
#[tokio::test]
async fn test_recover_after_aborted_run() {
    let storage = Arc::new(InMemoryStorage::new());
    let (engine, stack) = slow_engine(storage.clone()).await;
    let engine = Arc::new(engine);

    let task = {
        let engine = engine.clone();
        let stack = stack.clone();
        tokio::spawn(async move { engine.run(&stack, RunOptions::new()).await })
    };
    wait_for_plan_status(
        storage.as_ref(),
        &stack,
        "a",
        PlanStatus::Running,
        Duration::from_secs(5),
    )
    .await;
    task.abort();
    let _ = task.await;

    // The lease outlives the dead run.
    assert!(storage.get_status(&stack).await.unwrap().run.is_running);
    assert!(matches!(
        engine.run(&stack, RunOptions::new()).await,
        Err(EngineError::AlreadyRunning(_))
    ));

    let failed = engine.recover(&stack).await.unwrap();
    assert_eq!(failed, ids(&["a"]));

    let status = engine.status(&stack).await.unwrap();
    assert!(!status.run.is_running);
    let a = status.record(&PlanId::new("a"));
    assert_eq!(a.status, PlanStatus::Failed);
    assert_eq!(a.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));

    let report = engine.run(&stack, RunOptions::new()).await.unwrap();
    assert!(report.success());
    assert_eq!(report.completed_count(), 3);
}

/// Test: Recover with no stale lease leaves state untouched.
#[tokio::test]
async fn test_recover_is_noop_on_idle_stack() {
    let harness = TestHarness::new()
        .with_plan(Plan::new("only"))
        .with_outcome("only", ScriptedOutcome::Exit(0));
    harness.create_and_run("idle", &["only"]).await;

    let engine = harness.engine();
    let failed = engine.recover(&StackId::new("idle")).await.unwrap();
    assert!(failed.is_empty());

    let status = harness.status("idle").await;
    assert_eq!(status_of(&status, "only"), PlanStatus::Completed);
    assert!(!status.run.is_running);
}

/// Test: A lease left by another process is released by recover.
#[tokio::test]
async fn test_recover_releases_foreign_lease() {
    let harness = TestHarness::new()
        .with_plan(Plan::new("a"))
        .with_plan(Plan::new("b").with_references(["a"]));
    harness
        .manager()
        .create_stack("shared", &ids(&["a", "b"]), CreateOptions::default())
        .await
        .unwrap();

    let stack = StackId::new("shared");
    let storage = harness.storage();
    assert!(storage.try_acquire_run(&stack, RunId::new()).await.unwrap());
    let mut running = PlanStatusRecord::pending();
    running.mark_running();
    storage
        .save_plan_status(&stack, &PlanId::new("a"), running)
        .await
        .unwrap();

    let engine = harness.engine();
    assert_eq!(engine.recover(&stack).await.unwrap(), ids(&["a"]));

    let report = harness.run_and_assert_success("shared").await;
    assert_eq!(report.completed_count(), 2);
    assert_eq!(harness.worker().invocation_count(&PlanId::new("a")), 1);
}

/// Test: The lease is released when plans fail or the worker cannot start.
#[tokio::test]
async fn test_lease_released_after_failures() {
    let harness = TestHarness::new()
        .with_plan(Plan::new("boom"))
        .with_plan(Plan::new("after").with_references(["boom"]))
        .with_outcome("boom", ScriptedOutcome::Error("no such program".into()));

    let report = harness.create_and_run("fragile", &["boom", "after"]).await;
    assert_eq!(report.failed_count(), 1);
    assert_eq!(report.skipped_count(), 1);

    let status = harness.status("fragile").await;
    assert!(!status.run.is_running);
    assert!(status.run.last_run_at.is_some());

    // The next run retries the failed plan and its skipped dependent.
    harness.worker().set_outcome("boom", ScriptedOutcome::Exit(0));
    harness.run_and_assert_success("fragile").await;
    assert_eq!(harness.worker().invocation_count(&PlanId::new("boom")), 2);
    assert_eq!(harness.worker().invocation_count(&PlanId::new("after")), 1);
}

/// Test: Reset returns every plan to pending so the next run repeats them.
#[tokio::test]
async fn test_reset_reruns_everything() {
    let harness = TestHarness::new()
        .with_plan(Plan::new("x"))
        .with_plan(Plan::new("y").with_references(["x"]));
    harness.create_and_run("again", &["x", "y"]).await;

    harness.engine().reset(&StackId::new("again")).await.unwrap();
    let status = harness.status("again").await;
    assert_eq!(status_of(&status, "x"), PlanStatus::Pending);
    assert_eq!(status_of(&status, "y"), PlanStatus::Pending);

    harness.run_and_assert_success("again").await;
    assert_eq!(harness.worker().invocations().len(), 4);
}
