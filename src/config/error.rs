//! Errors from reading `planstack.yaml` and plan files.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config or plan file could not be read.
    #[error("cannot read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The plan directory could not be listed.
    #[error("cannot list plan directory '{path}': {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML given as a string did not parse.
    #[error("malformed YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A file did not parse.
    #[error("malformed YAML in '{path}': {source}")]
    YamlFile {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Parsed, but a value is not acceptable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
