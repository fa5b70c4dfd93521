//! Path utilities and XDG directory discovery

use crate::ConfigError;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Config file locations for Tandem
pub struct Paths {
    project_dirs: Option<ProjectDirs>,
}

impl Paths {
    /// Create a new Paths instance with XDG discovery
    pub fn new() -> Self {
        Self {
            project_dirs: ProjectDirs::from("org", "Tandem", "tandem"),
        }
    }

    /// Appliance-wide config file
    pub fn system_config_file() -> PathBuf {
        PathBuf::from("/etc/tandem/tandem.toml")
    }

    /// Get user config directory (~/.config/tandem/)
    pub fn user_config_dir(&self) -> Result<PathBuf, ConfigError> {
        self.project_dirs
            .as_ref()
            .map(|p| p.config_dir().to_path_buf())
            .ok_or_else(|| {
                ConfigError::XdgError("Failed to determine user config directory".to_string())
            })
    }

    /// Get user config file path (~/.config/tandem/config.toml)
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.user_config_dir()?.join("config.toml"))
    }

    pub fn project_config_file(dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join("tandem.toml")
    }

    pub fn local_config_file(dir: impl AsRef<Path>) -> PathBuf {
        dir.as_ref().join("tandem.local.toml")
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
