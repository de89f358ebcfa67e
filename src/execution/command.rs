//! External command worker.
//!
//! [`CommandWorker`] runs one external program per plan. The plan's content
//! is piped to the child's stdin, `{id}` in any argument is replaced with the
//! plan id, and `PLANSTACK_PLAN_ID` is always set in the child's environment.
//!
//! ```rust
//! use planstack::CommandWorker;
//! use std::time::Duration;
//!
//! let worker = CommandWorker::builder("agent")
//!     .args(["--print", "--plan", "{id}"])
//!     .env("LOG_LEVEL", "info")
//!     .timeout(Duration::from_secs(600))
//!     .build();
//! assert_eq!(worker.program(), "agent");
//! ```
//!
//! When a timeout elapses the invocation returns [`WorkerError::Timeout`] and
//! the child is killed as the command future is dropped.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::worker::{Worker, WorkerError, WorkerOutput};
use crate::core::plan::Plan;

/// Environment variable carrying the plan id into the child.
pub const PLAN_ID_ENV: &str = "PLANSTACK_PLAN_ID";

/// Placeholder substituted with the plan id in arguments.
pub const PLAN_ID_PLACEHOLDER: &str = "{id}";

/// A worker that executes an external command for each plan.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    /// Program to execute
    program: String,
    /// Argument templates
    args: Vec<String>,
    /// Environment variables
    environment: BTreeMap<String, String>,
    /// Working directory
    working_dir: Option<PathBuf>,
    /// Per-plan timeout
    timeout: Option<Duration>,
}

impl CommandWorker {
    /// Create a new builder for a command worker.
    pub fn builder(program: impl Into<String>) -> CommandWorkerBuilder {
        CommandWorkerBuilder::new(program)
    }

    /// Program run for each plan.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Get the argument templates.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Directory the child starts in.
    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Per-plan time limit.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Arguments for `plan`, with placeholders substituted.
    pub fn args_for(&self, plan: &Plan) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(PLAN_ID_PLACEHOLDER, plan.id.as_str()))
            .collect()
    }

    fn command_for(&self, plan: &Plan) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(plan));

        for (key, value) in &self.environment {
            cmd.env(key, value);
        }
        cmd.env(PLAN_ID_ENV, plan.id.as_str());

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, plan: &Plan) -> Result<std::process::Output, WorkerError> {
        let mut child = self
            .command_for(plan)
            .spawn()
            .map_err(|e| WorkerError::SpawnFailed(format!("{}: {}", self.program, e)))?;

        // Output is drained while stdin is written; either pipe may fill first.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            // A child that exits without reading stdin closes the pipe early.
            match stdin.write_all(plan.content.as_bytes()).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            }
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        fed?;
        Ok(output)
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn invoke(&self, plan: &Plan) -> Result<WorkerOutput, WorkerError> {
        debug!(plan = %plan.id, program = %self.program, "invoking command worker");
        let start = Instant::now();

        let output = match self.timeout {
            Some(duration) => timeout(duration, self.run(plan))
                .await
                .map_err(|_| WorkerError::Timeout(duration))??,
            None => self.run(plan).await?,
        };

        Ok(WorkerOutput {
            exit_code: output.status.code(),
            duration: start.elapsed(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Builder for creating `CommandWorker` instances.
#[derive(Debug, Clone)]
pub struct CommandWorkerBuilder {
    program: String,
    args: Vec<String>,
    environment: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandWorkerBuilder {
    /// Start building a worker for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            environment: BTreeMap::new(),
            working_dir: None,
            timeout: None,
        }
    }

    /// Append one argument. `{id}` is substituted per plan.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add environment variables.
    pub fn environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set one environment variable for the child.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Run the child in `dir`.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the per-plan timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Build the `CommandWorker`.
    pub fn build(self) -> CommandWorker {
        CommandWorker {
            program: self.program,
            args: self.args,
            environment: self.environment,
            working_dir: self.working_dir,
            timeout: self.timeout,
        }
    }
}
