//! Persistence integration tests.
//!
//! Tests that stacks, plan status and run leases survive reopening the
//! SQLite database.

#![cfg(feature = "sqlite")]

use crate::common::{ids, status_of};
use planstack::execution::INTERRUPTED_MESSAGE;
use planstack::testing::{ScriptedOutcome, ScriptedWorker};
use planstack::{
    CreateOptions, EngineError, ExecutionEngine, Plan, PlanId, PlanStatus, PlanStatusRecord,
    RunId, RunOptions, SqliteStorage, StackId, StackManager, StaticPlanLoader, Storage,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn loader() -> Arc<StaticPlanLoader> {
    Arc::new(StaticPlanLoader::from_plans([
        Plan::new("fetch"),
        Plan::new("build").with_references(["fetch"]),
        Plan::new("publish").with_references(["build"]),
    ]))
}

async fn open(path: &Path) -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(path).await.unwrap())
}

/// Test: A failed run resumes from persisted status after reopening the database.
#[tokio::test]
async fn test_resume_after_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("planstack.db");
    let stack = StackId::new("release");

    {
        let storage = open(&db).await;
        StackManager::new(storage.clone(), loader())
            .create_stack(stack.clone(), &ids(&["publish"]), CreateOptions::with_references())
            .await
            .unwrap();

        let worker = Arc::new(ScriptedWorker::new().with_outcome("build", ScriptedOutcome::Exit(2)));
        let engine = ExecutionEngine::new(storage.clone(), loader(), worker);
        let report = engine.run(&stack, RunOptions::new()).await.unwrap();
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.skipped_count(), 1);
        storage.close().await;
    }

    let storage = open(&db).await;
    let stored = storage.get_stack(&stack).await.unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(stored.root_ids, ids(&["fetch"]));

    let status = storage.get_status(&stack).await.unwrap();
    assert_eq!(status_of(&status, "fetch"), PlanStatus::Completed);
    let build = status.record(&PlanId::new("build"));
    assert_eq!(build.status, PlanStatus::Failed);
    assert_eq!(build.exit_code, Some(2));
    assert!(build.duration.is_some());
    assert_eq!(status_of(&status, "publish"), PlanStatus::Skipped);
    assert!(status.run.last_run_at.is_some());

    let worker = Arc::new(ScriptedWorker::new());
    let engine = ExecutionEngine::new(storage.clone(), loader(), worker.clone());
    let report = engine.run(&stack, RunOptions::new()).await.unwrap();
    assert!(report.success());
    assert_eq!(report.already_completed_count(), 1);
    assert_eq!(worker.invocations(), ids(&["build", "publish"]));
}

/// Test: A lease held when the process died is still held after reopening.
#[tokio::test]
async fn test_stale_lease_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("planstack.db");
    let stack = StackId::new("stale");

    {
        let storage = open(&db).await;
        StackManager::new(storage.clone(), loader())
            .create_stack(stack.clone(), &ids(&["fetch"]), CreateOptions::default())
            .await
            .unwrap();
        assert!(storage.try_acquire_run(&stack, RunId::new()).await.unwrap());

        let mut record = PlanStatusRecord::pending();
        record.mark_running();
        storage
            .save_plan_status(&stack, &PlanId::new("fetch"), record)
            .await
            .unwrap();
        storage.close().await;
    }

    let storage = open(&db).await;
    let engine = ExecutionEngine::new(storage.clone(), loader(), Arc::new(ScriptedWorker::new()));
    assert!(matches!(
        engine.run(&stack, RunOptions::new()).await,
        Err(EngineError::AlreadyRunning(_))
    ));

    assert_eq!(engine.recover(&stack).await.unwrap(), ids(&["fetch"]));
    let status = engine.status(&stack).await.unwrap();
    assert!(!status.run.is_running);
    assert_eq!(
        status.record(&PlanId::new("fetch")).error_message.as_deref(),
        Some(INTERRUPTED_MESSAGE)
    );

    assert!(engine.run(&stack, RunOptions::new()).await.unwrap().success());
}

/// Test: Deleting a stack removes its status and lease rows.
#[tokio::test]
async fn test_delete_stack_clears_everything() {
    let dir = TempDir::new().unwrap();
    let storage = open(&dir.path().join("planstack.db")).await;
    let manager = StackManager::new(storage.clone(), loader());
    let stack = StackId::new("gone");

    manager
        .create_stack(stack.clone(), &ids(&["fetch", "build"]), CreateOptions::default())
        .await
        .unwrap();
    let engine = ExecutionEngine::new(storage.clone(), loader(), Arc::new(ScriptedWorker::new()));
    engine.run(&stack, RunOptions::new()).await.unwrap();

    manager.delete_stack(&stack).await.unwrap();
    assert!(manager.list_stacks().await.unwrap().is_empty());

    let status = storage.get_status(&stack).await.unwrap();
    assert!(status.plans.is_empty());
    assert!(!status.run.is_running);
}
