//! Lifecycle events and event handling.
//!
//! The execution engine emits an [`Event`] for every run and plan
//! transition; handlers registered on an [`EventBus`] observe them.

use async_trait::async_trait;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::core::types::{PlanId, RunId, StackId};

/// Lifecycle events emitted during a stack run.
#[derive(Debug, Clone)]
pub enum Event {
    /// A run acquired the lease and is about to walk the order.
    RunStarted {
        stack_id: StackId,
        run_id: RunId,
        plan_count: usize,
        timestamp: Instant,
    },

    /// A plan was marked running and handed to the worker.
    PlanStarted {
        plan_id: PlanId,
        stack_id: StackId,
        timestamp: Instant,
    },

    /// A plan's worker exited with code 0.
    PlanCompleted {
        plan_id: PlanId,
        stack_id: StackId,
        duration: Duration,
        exit_code: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
        timestamp: Instant,
    },

    /// A plan failed.
    PlanFailed {
        plan_id: PlanId,
        stack_id: StackId,
        error: String,
        exit_code: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
        timestamp: Instant,
    },

    /// A plan was skipped because a dependency was not satisfied.
    PlanSkipped {
        plan_id: PlanId,
        stack_id: StackId,
        reason: String,
        timestamp: Instant,
    },

    /// A run finished and released the lease.
    RunCompleted {
        stack_id: StackId,
        run_id: RunId,
        success: bool,
        duration: Duration,
        timestamp: Instant,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> Instant {
        match self {
            Event::RunStarted { timestamp, .. } => *timestamp,
            Event::PlanStarted { timestamp, .. } => *timestamp,
            Event::PlanCompleted { timestamp, .. } => *timestamp,
            Event::PlanFailed { timestamp, .. } => *timestamp,
            Event::PlanSkipped { timestamp, .. } => *timestamp,
            Event::RunCompleted { timestamp, .. } => *timestamp,
        }
    }

    /// The plan this event concerns, if any.
    pub fn plan_id(&self) -> Option<&PlanId> {
        match self {
            Event::PlanStarted { plan_id, .. }
            | Event::PlanCompleted { plan_id, .. }
            | Event::PlanFailed { plan_id, .. }
            | Event::PlanSkipped { plan_id, .. } => Some(plan_id),
            Event::RunStarted { .. } | Event::RunCompleted { .. } => None,
        }
    }

    /// Create a RunStarted event.
    pub fn run_started(stack_id: StackId, run_id: RunId, plan_count: usize) -> Self {
        Event::RunStarted {
            stack_id,
            run_id,
            plan_count,
            timestamp: Instant::now(),
        }
    }

    /// Create a PlanStarted event.
    pub fn plan_started(plan_id: PlanId, stack_id: StackId) -> Self {
        Event::PlanStarted {
            plan_id,
            stack_id,
            timestamp: Instant::now(),
        }
    }

    /// Create a PlanCompleted event with worker output.
    pub fn plan_completed_with_output(
        plan_id: PlanId,
        stack_id: StackId,
        duration: Duration,
        exit_code: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Self {
        Event::PlanCompleted {
            plan_id,
            stack_id,
            duration,
            exit_code,
            stdout,
            stderr,
            timestamp: Instant::now(),
        }
    }

    /// Create a PlanFailed event.
    pub fn plan_failed(plan_id: PlanId, stack_id: StackId, error: String) -> Self {
        Event::PlanFailed {
            plan_id,
            stack_id,
            error,
            exit_code: None,
            stdout: None,
            stderr: None,
            timestamp: Instant::now(),
        }
    }

    /// Create a PlanFailed event with worker output.
    pub fn plan_failed_with_output(
        plan_id: PlanId,
        stack_id: StackId,
        error: String,
        exit_code: Option<i32>,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Self {
        Event::PlanFailed {
            plan_id,
            stack_id,
            error,
            exit_code,
            stdout,
            stderr,
            timestamp: Instant::now(),
        }
    }

    /// Create a PlanSkipped event.
    pub fn plan_skipped(plan_id: PlanId, stack_id: StackId, reason: impl Into<String>) -> Self {
        Event::PlanSkipped {
            plan_id,
            stack_id,
            reason: reason.into(),
            timestamp: Instant::now(),
        }
    }

    /// Create a RunCompleted event.
    pub fn run_completed(
        stack_id: StackId,
        run_id: RunId,
        success: bool,
        duration: Duration,
    ) -> Self {
        Event::RunCompleted {
            stack_id,
            run_id,
            success,
            duration,
            timestamp: Instant::now(),
        }
    }
}

/// Observer of lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event);
}

/// Fans events out to registered handlers, in registration order.
///
/// `emit` works on a snapshot of the handler list, so no lock is held while
/// a handler awaits and handlers may register further handlers.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler; it sees every event emitted from now on.
    pub fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Deliver `event` to every handler.
    pub async fn emit(&self, event: Event) {
        let handlers = self.snapshot();
        for handler in &handlers {
            handler.handle(&event).await;
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
