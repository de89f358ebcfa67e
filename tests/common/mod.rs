//! Common test utilities shared across integration tests.

use planstack::{PlanId, PlanStatus, StackId, StackStatus, Storage};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

/// A plan directory in a temporary location.
pub struct PlanDir {
    dir: TempDir,
}

impl PlanDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `<id>.yaml` with the given references and script content.
    pub fn write_plan(&self, id: &str, references: &[&str], content: &str) {
        let mut yaml = format!("title: {}\nreferences: [{}]\n", id, references.join(", "));
        yaml.push_str("content: |\n");
        for line in content.lines() {
            yaml.push_str("  ");
            yaml.push_str(line);
            yaml.push('\n');
        }
        std::fs::write(self.dir.path().join(format!("{}.yaml", id)), yaml).unwrap();
    }

    /// Path of a log file plans can append to.
    pub fn log_path(&self) -> std::path::PathBuf {
        self.dir.path().join("run.log")
    }

    /// Lines appended to the log so far.
    pub fn log_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Shorthand for a list of plan ids.
pub fn ids(raw: &[&str]) -> Vec<PlanId> {
    raw.iter().map(|id| PlanId::new(*id)).collect()
}

/// Status of a single plan in a stack.
pub fn status_of(status: &StackStatus, id: &str) -> PlanStatus {
    status.status_of(&PlanId::new(id))
}

/// Wait for a plan to reach an expected status, polling storage.
///
/// Polls storage every 10ms and panics once `timeout` has elapsed.
pub async fn wait_for_plan_status(
    storage: &dyn Storage,
    stack: &StackId,
    plan: &str,
    expected: PlanStatus,
    timeout: Duration,
) {
    let start = tokio::time::Instant::now();
    loop {
        let status = storage.get_status(stack).await.unwrap();
        let current = status_of(&status, plan);
        if current == expected {
            return;
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for plan {} to reach {}, current status: {}",
                plan, expected, current
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
