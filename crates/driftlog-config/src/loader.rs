//! Configuration loader with multi-source merging

use crate::{DriftlogConfig, Paths};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_user_config: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "DRIFTLOG".to_string(),
            include_user_config: true,
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "DRIFTLOG")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip ~/.config/driftlog/config.toml
    pub fn without_user_config(mut self) -> Self {
        self.include_user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<DriftlogConfig> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = DriftlogConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config (~/.config/driftlog/config.toml)
        if self.include_user_config {
            if let Ok(user_config_file) = Paths::new().user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(
                        config::File::from(user_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // 3. Project config (driftlog.toml)
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Local config (driftlog.local.toml, gitignored)
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (DRIFTLOG_LISTENER__ERROR_POLICY, ...)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let driftlog_config: DriftlogConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        driftlog_config
            .validate()
            .context("Configuration failed validation")?;

        Ok(driftlog_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> DriftlogConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorPolicy;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = ConfigLoader::new()
            .with_project_dir(temp_dir.path())
            .without_user_config()
            .load()
            .expect("Failed to load config");

        assert_eq!(config, DriftlogConfig::default());
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[listener]
error_policy = "ignore"
assignment_timeout_ms = 250

[cold]
idle_timeout_ms = 75
max_resume_attempts = 9
"#;
        fs::write(project_dir.join("driftlog.toml"), config_content)
            .expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .load()
            .expect("Failed to load config");

        assert_eq!(config.listener.error_policy, ErrorPolicy::Ignore);
        assert_eq!(config.listener.assignment_timeout_ms, 250);
        assert_eq!(config.cold.idle_timeout_ms, 75);
        assert_eq!(config.cold.max_resume_attempts, 9);
        assert_eq!(config.cold.batch_size, 256);
    }

    #[test]
    fn test_local_overrides() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("driftlog.toml"),
            r#"
[cold]
batch_size = 32
"#,
        )
        .expect("Failed to write project config");

        fs::write(
            project_dir.join("driftlog.local.toml"),
            r#"
[cold]
batch_size = 8
"#,
        )
        .expect("Failed to write local config");

        let config = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .load()
            .expect("Failed to load config");

        // Local config should override project config
        assert_eq!(config.cold.batch_size, 8);
    }

    #[test]
    fn test_invalid_values_fail_to_load() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("driftlog.toml"),
            r#"
[hot]
channel_capacity = 0
"#,
        )
        .expect("Failed to write project config");

        let result = ConfigLoader::new()
            .with_project_dir(project_dir)
            .without_user_config()
            .load();
        assert!(result.is_err());
    }

    // Note: Environment variable testing is tricky in unit tests because the
    // process environment is shared across test threads. In actual usage:
    //
    // DRIFTLOG_LISTENER__ERROR_POLICY=ignore
    // DRIFTLOG_COLD__IDLE_TIMEOUT_MS=200
    //
    // override the corresponding config file values.
}
