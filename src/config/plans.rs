//! Plan files on disk.
//!
//! Each plan lives in `<dir>/<id>.yaml` (or `.yml`).

use std::path::{Path, PathBuf};
use tracing::debug;

use super::error::ConfigError;
use super::yaml::YamlLoader;
use crate::core::plan::{LoadError, Plan, PlanLoader};
use crate::core::types::PlanId;

const EXTENSIONS: [&str; 2] = ["yaml", "yml"];

/// Loads plans from a directory of YAML files.
#[derive(Debug, Clone)]
pub struct DirectoryPlanLoader {
    dir: PathBuf,
}

impl DirectoryPlanLoader {
    /// Create a loader over `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The plan directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &PlanId) -> Option<PathBuf> {
        EXTENSIONS
            .iter()
            .map(|ext| self.dir.join(format!("{}.{}", id.as_str(), ext)))
            .find(|path| path.is_file())
    }

    /// Every plan in the directory, sorted by id.
    pub fn list(&self) -> Result<Vec<Plan>, ConfigError> {
        if !self.dir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "'{}' is not a directory",
                self.dir.display()
            )));
        }

        let entries = std::fs::read_dir(&self.dir).map_err(|source| ConfigError::ReadDir {
            path: self.dir.clone(),
            source,
        })?;

        let mut plans = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| ConfigError::ReadDir {
                    path: self.dir.clone(),
                    source,
                })?
                .path();

            if let Some(ext) = path.extension()
                && EXTENSIONS.iter().any(|e| ext == *e)
                && path.is_file()
            {
                plans.push(YamlLoader::load_plan(&path)?);
            }
        }

        plans.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plans)
    }
}

impl PlanLoader for DirectoryPlanLoader {
    fn load(&self, id: &PlanId) -> Result<Option<Plan>, LoadError> {
        let raw = id.as_str();
        if raw.is_empty() || raw.contains(['/', '\\']) || raw == "." || raw == ".." {
            return Err(LoadError::Invalid(format!("invalid plan id '{}'", raw)));
        }

        let Some(path) = self.path_for(id) else {
            debug!(plan = %id, dir = %self.dir.display(), "no plan file");
            return Ok(None);
        };

        let plan = YamlLoader::load_plan(&path).map_err(|e| match e {
            ConfigError::Read { path, source } => LoadError::Io { path, source },
            other => LoadError::Parse {
                path: path.clone(),
                message: other.to_string(),
            },
        })?;

        if &plan.id != id {
            return Err(LoadError::Invalid(format!(
                "'{}' declares id '{}'",
                path.display(),
                plan.id
            )));
        }
        Ok(Some(plan))
    }
}
