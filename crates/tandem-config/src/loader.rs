//! Configuration loader with multi-source merging

use crate::{Paths, TandemConfig};
use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    include_system: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "TANDEM".to_string(),
            include_system: true,
        }
    }

    /// Set the directory searched for tandem.toml and tandem.local.toml
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "TANDEM")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Skip /etc/tandem and the user config directory.
    pub fn without_system_config(mut self) -> Self {
        self.include_system = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<TandemConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = TandemConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. System and user config
        if self.include_system {
            let system_file = Paths::system_config_file();
            if system_file.exists() {
                builder = builder.add_source(
                    config::File::from(system_file)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }

            let paths = Paths::new();
            if let Ok(user_config_file) = paths.user_config_file() {
                if user_config_file.exists() {
                    builder = builder.add_source(
                        config::File::from(user_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // 3. tandem.toml
        let project_config_file = Paths::project_config_file(&self.project_dir);
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. tandem.local.toml
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment variables (TANDEM_PEER__ADDRESS=...)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut tandem_config: TandemConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        tandem_config.resolve_paths();
        tandem_config
            .validate()
            .context("Invalid configuration")?;

        Ok(tandem_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> TandemConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
