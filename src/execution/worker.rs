//! The worker seam: whatever performs one plan's work.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::core::plan::Plan;

/// Errors that prevent a worker from producing an exit status.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The worker process could not be started.
    #[error("failed to start worker: {0}")]
    SpawnFailed(String),

    /// I/O with the running worker failed.
    #[error("worker i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The worker did not finish in time.
    #[error("worker timed out after {0:?}")]
    Timeout(Duration),
}

/// What a finished worker reported.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerOutput {
    /// Exit code; `None` when the worker was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Wall-clock time spent in the worker.
    pub duration: Duration,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl WorkerOutput {
    /// Output with the given exit code and nothing captured.
    pub fn with_exit_code(exit_code: i32) -> Self {
        Self {
            exit_code: Some(exit_code),
            ..Self::default()
        }
    }

    /// Whether the worker exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Performs the work of a single plan.
///
/// The engine awaits each invocation to completion before moving on; it
/// never cancels or times out a worker itself.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Run `plan` and report how it exited.
    async fn invoke(&self, plan: &Plan) -> Result<WorkerOutput, WorkerError>;
}
