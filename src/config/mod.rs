//! Configuration loading and parsing.
//!
//! YAML-based global settings (`planstack.yaml`) and plan files.

mod error;
mod plans;
mod yaml;

pub use error::ConfigError;
pub use plans::DirectoryPlanLoader;
pub use yaml::{GlobalConfig, StorageConfig, WorkerConfig, YamlLoader};
