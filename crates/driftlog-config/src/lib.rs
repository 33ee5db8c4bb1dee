//! Configuration management for Driftlog
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (DRIFTLOG_* prefix, highest precedence)
//! 2. driftlog.local.toml (gitignored, local overrides)
//! 3. driftlog.toml (git-tracked, project config)
//! 4. ~/.config/driftlog/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Driftlog configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftlogConfig {
    pub listener: ListenerConfig,
    pub cold: ColdConfig,
    pub hot: HotConfig,
    pub flow: FlowConfig,
}

/// How the listener reacts to hot or cold source failures.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Propagate to every subscriber of the channel and tear it down.
    #[default]
    FailFast,
    /// Log and keep going; for transports whose errors are transient.
    Ignore,
}

/// Where to start a partition that has no saved checkpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StartPosition {
    /// Replay the partition from offset zero.
    #[default]
    Earliest,
    /// Adopt the first live record seen on the partition.
    Latest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub error_policy: ErrorPolicy,
    pub start_from: StartPosition,
    /// How long the first subscriber waits for its partitions to be assigned.
    pub assignment_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            error_policy: ErrorPolicy::FailFast,
            start_from: StartPosition::Earliest,
            assignment_timeout_ms: 30_000,
        }
    }
}

impl ListenerConfig {
    pub fn assignment_timeout(&self) -> Duration {
        Duration::from_millis(self.assignment_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdConfig {
    /// A cold batch completes after this long without a new record.
    pub idle_timeout_ms: u64,
    /// Maximum records read from one partition per pass.
    pub batch_size: usize,
    /// Completions tolerated while still behind before the reader is dropped.
    pub max_resume_attempts: u32,
}

impl Default for ColdConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 500,
            batch_size: 256,
            max_resume_attempts: 3,
        }
    }
}

impl ColdConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotConfig {
    /// Records buffered for slow live readers before they lag.
    pub channel_capacity: usize,
}

impl Default for HotConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Demand granted to a subscriber before its first `request`.
    pub initial_demand: u64,
}

impl DriftlogConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Parse a single TOML file without consulting any other source
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration suited to tests: short idle timeouts, unbounded demand
    pub fn testing() -> Self {
        Self {
            listener: ListenerConfig {
                assignment_timeout_ms: 1_000,
                ..Default::default()
            },
            cold: ColdConfig {
                idle_timeout_ms: 50,
                batch_size: 64,
                max_resume_attempts: 3,
            },
            hot: HotConfig::default(),
            flow: FlowConfig {
                initial_demand: u64::MAX,
            },
        }
    }

    /// Reject values the listener cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cold.idle_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "cold.idle_timeout_ms must be positive".to_string(),
            ));
        }
        if self.cold.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "cold.batch_size must be positive".to_string(),
            ));
        }
        if self.hot.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "hot.channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = DriftlogConfig::default();
        assert_eq!(config.listener.error_policy, ErrorPolicy::FailFast);
        assert_eq!(config.listener.start_from, StartPosition::Earliest);
        assert_eq!(config.cold.idle_timeout(), Duration::from_millis(500));
        assert_eq!(config.flow.initial_demand, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_testing_config() {
        let config = DriftlogConfig::testing();
        assert_eq!(config.flow.initial_demand, u64::MAX);
        assert!(config.cold.idle_timeout() < Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_idle_timeout() {
        let mut config = DriftlogConfig::default();
        config.cold.idle_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_from_toml_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("driftlog.toml");
        std::fs::write(
            &path,
            r#"
[listener]
error_policy = "ignore"
start_from = "latest"

[cold]
batch_size = 16
"#,
        )
        .expect("Failed to write config");

        let config = DriftlogConfig::from_toml_file(&path).expect("Failed to parse config");
        assert_eq!(config.listener.error_policy, ErrorPolicy::Ignore);
        assert_eq!(config.listener.start_from, StartPosition::Latest);
        assert_eq!(config.cold.batch_size, 16);
        assert_eq!(config.cold.idle_timeout_ms, 500);
    }

    #[test]
    fn test_from_toml_file_reports_parse_errors() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("driftlog.toml");
        std::fs::write(&path, "[cold\nbatch_size = ").expect("Failed to write config");

        assert!(matches!(
            DriftlogConfig::from_toml_file(&path),
            Err(ConfigError::ParseError { .. })
        ));
    }
}
