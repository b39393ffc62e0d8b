//! Configuration schema (dagsmith.toml)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default number of concurrent node executions
pub const DEFAULT_THREADS: usize = 4;

/// Target connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Target name (dev, prod, etc.)
    #[serde(default = "default_target_name")]
    pub name: String,

    /// Backend type (postgres, mock, etc.)
    #[serde(rename = "type", default = "default_target_type")]
    pub target_type: String,

    /// Default database for relations
    #[serde(default)]
    pub database: Option<String>,

    /// Default schema for relations
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Thread count configured for this target
    #[serde(default)]
    pub threads: Option<usize>,
}

fn default_target_name() -> String {
    "dev".to_string()
}

fn default_target_type() -> String {
    "mock".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: default_target_name(),
            target_type: default_target_type(),
            database: None,
            schema: default_schema(),
            threads: None,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Root project name
    #[serde(default = "default_project_name")]
    pub name: String,

    /// Worker count when neither the CLI nor the target sets one
    #[serde(default)]
    pub threads: Option<usize>,

    #[serde(default)]
    pub target: TargetConfig,

    /// Project variables, available to templates through `var()`
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,

    /// Quote identifiers by default
    #[serde(default)]
    pub quoting: bool,

    /// Promote test warnings to failures
    #[serde(default)]
    pub warn_error: bool,

    /// Prefix used for ephemeral CTE names (`__<prefix>__CTE__<name>`)
    #[serde(default = "default_cte_prefix")]
    pub cte_prefix: String,

    /// Output directory for compiled SQL and run results
    #[serde(default = "default_target_path")]
    pub target_path: PathBuf,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

fn default_project_name() -> String {
    "dagsmith_project".to_string()
}

fn default_cte_prefix() -> String {
    "dbt".to_string()
}

fn default_target_path() -> PathBuf {
    PathBuf::from("target")
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: default_project_name(),
            threads: None,
            target: TargetConfig::default(),
            vars: BTreeMap::new(),
            quoting: false,
            warn_error: false,
            cte_prefix: default_cte_prefix(),
            target_path: default_target_path(),
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl ProjectConfig {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let config: ProjectConfig = toml::from_str(toml)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if config.threads == Some(0) || config.target.threads == Some(0) {
            return Err(ConfigError::Invalid("threads must be at least 1".to_string()));
        }

        Ok(config)
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Thread count from the target profile, then the project, then the default
    pub fn default_threads(&self) -> usize {
        self.target
            .threads
            .or(self.threads)
            .unwrap_or(DEFAULT_THREADS)
    }

    /// Absolute output directory
    pub fn target_dir(&self) -> PathBuf {
        if self.target_path.is_absolute() {
            self.target_path.clone()
        } else {
            self.project_root.join(&self.target_path)
        }
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
