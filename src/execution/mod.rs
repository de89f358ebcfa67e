//! Plan execution.
//!
//! The [`Worker`] seam performs a single plan; [`CommandWorker`] runs an
//! external program for it. The [`ExecutionEngine`] walks a stack in order
//! and records every transition in storage.

mod command;
mod engine;
mod worker;

pub use command::{CommandWorker, CommandWorkerBuilder, PLAN_ID_ENV, PLAN_ID_PLACEHOLDER};
pub use engine::{
    EngineError, ExecutionEngine, INTERRUPTED_MESSAGE, PLAN_NOT_LOADED_MESSAGE, PlanOutcome,
    RunOptions, RunReport, UNMET_DEPENDENCY_MESSAGE,
};
pub use worker::{Worker, WorkerError, WorkerOutput};
