//! YAML configuration parsing.
//!
//! Parses the global `planstack.yaml` and individual plan files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;
use crate::core::plan::Plan;
use crate::execution::CommandWorker;

/// Global configuration (planstack.yaml).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Directory holding plan files.
    pub plans_dir: Option<PathBuf>,
    /// Storage configuration.
    pub storage: Option<StorageConfig>,
    /// Worker configuration.
    pub worker: Option<WorkerConfig>,
}

/// Storage configuration.
///
/// When `planstack.yaml` has no `storage` section the CLI uses SQLite at
/// `./planstack.db`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage; nothing persists past the process.
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Command worker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program to run for each plan.
    pub command: String,
    /// Arguments; `{id}` is replaced with the plan id.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory of the child.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Per-plan timeout in seconds.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Extra environment variables.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

impl WorkerConfig {
    /// Per-plan timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Build the configured worker.
    pub fn build(&self) -> CommandWorker {
        let mut builder = CommandWorker::builder(&self.command)
            .args(self.args.iter().cloned())
            .environment(self.environment.clone());
        if let Some(ref dir) = self.working_dir {
            builder = builder.working_dir(dir);
        }
        if let Some(timeout) = self.timeout() {
            builder = builder.timeout(timeout);
        }
        builder.build()
    }
}

/// On-disk shape of a plan file.
#[derive(Debug, Clone, Deserialize)]
struct PlanFile {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default, alias = "depends_on")]
    references: Vec<String>,
    #[serde(default)]
    content: String,
}

impl PlanFile {
    fn into_plan(self, default_id: &str) -> Result<Plan, ConfigError> {
        let id = self.id.unwrap_or_else(|| default_id.to_string());
        if id.trim().is_empty() {
            return Err(ConfigError::Invalid("plan id cannot be empty".into()));
        }
        let mut plan = Plan::new(id)
            .with_references(self.references)
            .with_content(self.content);
        plan.title = self.title;
        Ok(plan)
    }
}

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load global configuration from a file.
    pub fn load_global_config(path: impl AsRef<Path>) -> Result<GlobalConfig, ConfigError> {
        let config: GlobalConfig = read_yaml(path.as_ref())?;
        Self::validate_global_config(&config)?;
        Ok(config)
    }

    /// Parse global configuration from a YAML string.
    pub fn parse_global_config(yaml: &str) -> Result<GlobalConfig, ConfigError> {
        let config: GlobalConfig = serde_yaml::from_str(yaml)?;
        Self::validate_global_config(&config)?;
        Ok(config)
    }

    fn validate_global_config(config: &GlobalConfig) -> Result<(), ConfigError> {
        if let Some(StorageConfig::Sqlite { ref path }) = config.storage
            && path.trim().is_empty()
        {
            return Err(ConfigError::Invalid(
                "sqlite storage path cannot be empty".into(),
            ));
        }

        if let Some(ref worker) = config.worker {
            if worker.command.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "worker command cannot be empty".into(),
                ));
            }
            if worker.timeout_secs == Some(0) {
                return Err(ConfigError::Invalid(
                    "worker timeout_secs cannot be zero".into(),
                ));
            }
        }
        Ok(())
    }

    /// Load a plan file. The id defaults to the file stem.
    pub fn load_plan(path: impl AsRef<Path>) -> Result<Plan, ConfigError> {
        let path = path.as_ref();
        let file: PlanFile = read_yaml(path)?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        file.into_plan(stem)
    }

    /// Parse a plan from a YAML string, using `default_id` when it has no `id`.
    pub fn parse_plan(yaml: &str, default_id: &str) -> Result<Plan, ConfigError> {
        let file: PlanFile = serde_yaml::from_str(yaml)?;
        file.into_plan(default_id)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::YamlFile {
        path: path.to_path_buf(),
        source,
    })
}
