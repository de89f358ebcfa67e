//! planstack - run interdependent plans in dependency order.
//!
//! A stack is a named set of plans whose declared references form a
//! dependency graph. The [`ExecutionEngine`] runs a stack in a deterministic
//! topological order, records every plan's status, skips plans whose
//! dependencies did not complete, and resumes from recorded state on the
//! next run.

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod manager;
pub mod storage;
pub mod testing;

pub use config::{
    ConfigError, DirectoryPlanLoader, GlobalConfig, StorageConfig, WorkerConfig, YamlLoader,
};
pub use core::cycle::{Cycle, find_cycle};
pub use core::graph::{DependencyGraph, GraphError, GraphNode};
pub use core::plan::{LoadError, Plan, PlanLoader, StaticPlanLoader};
pub use core::stack::{Stack, StackPlan};
pub use core::topo::{SortResult, topological_sort};
pub use core::types::{PlanId, RunId, StackId};
pub use events::{Event, EventBus, EventHandler};
pub use execution::{
    CommandWorker, CommandWorkerBuilder, EngineError, ExecutionEngine, PlanOutcome, RunOptions,
    RunReport, UNMET_DEPENDENCY_MESSAGE, Worker, WorkerError, WorkerOutput,
};
pub use manager::{CreateOptions, StackError, StackManager};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use storage::{
    InMemoryStorage, PlanStatus, PlanStatusRecord, RunState, StackStatus, Storage, StorageError,
};
