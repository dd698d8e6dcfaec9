//! Pipeline configuration and the per-run context.
//!
//! Configuration is layered: built-in defaults, then an optional YAML file,
//! then `ARVO_CORPUS_*` environment variables, then CLI flags. The resolved
//! values are frozen into a [`RunContext`] that every component receives
//! explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file could not be parsed.
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration for the corpus pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    // Metadata stores
    /// Path to the case-metadata SQLite database.
    pub metadata_db: PathBuf,
    /// Path to the checked-out metadata/patch repository.
    pub metadata_repo: PathBuf,
    /// Case table to read; auto-detected when unset.
    pub case_table: Option<String>,

    // Corpus output
    /// Root directory of the assembled corpus.
    pub output_root: PathBuf,
    /// Overwrite complete entries.
    pub force: bool,

    // Execution settings
    /// Maximum number of cases in flight at once.
    pub concurrency: usize,
    /// Deadline for one environment lifecycle (create, copy, remove).
    pub environment_timeout_secs: u64,
    /// Deadline for removing an environment.
    pub cleanup_timeout_secs: u64,

    // Environment settings
    /// Image namespace, e.g. `n132/arvo`.
    pub image_namespace: String,
    /// Pull images that are not present locally.
    pub pull_missing_images: bool,
    /// In-container source locations, highest priority first.
    pub source_candidates: Vec<String>,
    /// In-container location of the proof-of-concept input.
    pub poc_path: String,
    /// In-container location of the reproduction runner script.
    pub runner_path: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            metadata_db: PathBuf::from("data/arvo/arvo.db"),
            metadata_repo: PathBuf::from("data/arvo/ARVO-Meta"),
            case_table: None,

            output_root: PathBuf::from("data/cases"),
            force: false,

            concurrency: 4,
            environment_timeout_secs: 900,
            cleanup_timeout_secs: 60,

            image_namespace: "n132/arvo".to_string(),
            pull_missing_images: true,
            source_candidates: vec![
                "/src".to_string(),
                "/work/src".to_string(),
                "/root/src".to_string(),
            ],
            poc_path: "/tmp/poc".to_string(),
            runner_path: "/bin/arvo".to_string(),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Applies overrides from the process environment.
    ///
    /// # Environment Variables
    ///
    /// - `ARVO_CORPUS_METADATA_DB`: metadata database path
    /// - `ARVO_CORPUS_METADATA_REPO`: metadata repository path
    /// - `ARVO_CORPUS_CASE_TABLE`: case table name
    /// - `ARVO_CORPUS_OUTPUT`: corpus output root
    /// - `ARVO_CORPUS_FORCE`: overwrite complete entries
    /// - `ARVO_CORPUS_CONCURRENCY`: cases in flight (default: 4)
    /// - `ARVO_CORPUS_ENV_TIMEOUT_SECS`: environment deadline (default: 900)
    /// - `ARVO_CORPUS_CLEANUP_TIMEOUT_SECS`: removal deadline (default: 60)
    /// - `ARVO_CORPUS_IMAGE_NAMESPACE`: image namespace (default: n132/arvo)
    /// - `ARVO_CORPUS_PULL`: pull missing images (default: true)
    /// - `ARVO_CORPUS_SOURCE_CANDIDATES`: comma-separated candidate paths
    pub fn apply_env(self) -> Result<Self, ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    fn apply_env_with<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("ARVO_CORPUS_METADATA_DB") {
            self.metadata_db = PathBuf::from(val);
        }

        if let Some(val) = lookup("ARVO_CORPUS_METADATA_REPO") {
            self.metadata_repo = PathBuf::from(val);
        }

        if let Some(val) = lookup("ARVO_CORPUS_CASE_TABLE") {
            self.case_table = Some(val);
        }

        if let Some(val) = lookup("ARVO_CORPUS_OUTPUT") {
            self.output_root = PathBuf::from(val);
        }

        if let Some(val) = lookup("ARVO_CORPUS_FORCE") {
            self.force = parse_env_bool(&val, "ARVO_CORPUS_FORCE")?;
        }

        if let Some(val) = lookup("ARVO_CORPUS_CONCURRENCY") {
            self.concurrency = parse_env_value(&val, "ARVO_CORPUS_CONCURRENCY")?;
        }

        if let Some(val) = lookup("ARVO_CORPUS_ENV_TIMEOUT_SECS") {
            self.environment_timeout_secs = parse_env_value(&val, "ARVO_CORPUS_ENV_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("ARVO_CORPUS_CLEANUP_TIMEOUT_SECS") {
            self.cleanup_timeout_secs = parse_env_value(&val, "ARVO_CORPUS_CLEANUP_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("ARVO_CORPUS_IMAGE_NAMESPACE") {
            self.image_namespace = val;
        }

        if let Some(val) = lookup("ARVO_CORPUS_PULL") {
            self.pull_missing_images = parse_env_bool(&val, "ARVO_CORPUS_PULL")?;
        }

        if let Some(val) = lookup("ARVO_CORPUS_SOURCE_CANDIDATES") {
            self.source_candidates = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.environment_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "environment_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.cleanup_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "cleanup_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.image_namespace.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "image_namespace cannot be empty".to_string(),
            ));
        }

        if self.source_candidates.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "source_candidates cannot be empty".to_string(),
            ));
        }

        let in_container = self
            .source_candidates
            .iter()
            .chain([&self.poc_path, &self.runner_path]);
        for path in in_container {
            if !path.starts_with('/') {
                return Err(ConfigError::ValidationFailed(format!(
                    "in-container path '{}' must be absolute",
                    path
                )));
            }
        }

        Ok(())
    }

    /// Freezes the configuration into a run context.
    pub fn run_context(&self) -> RunContext {
        RunContext {
            output_root: self.output_root.clone(),
            concurrency: self.concurrency,
            force: self.force,
            environment_timeout: Duration::from_secs(self.environment_timeout_secs),
            cleanup_timeout: Duration::from_secs(self.cleanup_timeout_secs),
        }
    }

    /// Builder method to set the output root.
    pub fn with_output_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_root = path.into();
        self
    }

    /// Builder method to set concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Builder method to set the force flag.
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Builder method to set the image namespace.
    pub fn with_image_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.image_namespace = namespace.into();
        self
    }

    /// Builder method to set the source candidates.
    pub fn with_source_candidates(mut self, candidates: Vec<String>) -> Self {
        self.source_candidates = candidates;
        self
    }
}

/// Explicit per-run state threaded through every component.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Root directory of the corpus.
    pub output_root: PathBuf,
    /// Maximum cases in flight.
    pub concurrency: usize,
    /// Overwrite complete entries.
    pub force: bool,
    /// Deadline for create + copy of one environment.
    pub environment_timeout: Duration,
    /// Deadline for removing one environment.
    pub cleanup_timeout: Duration,
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
