//! Configuration management for Tandem
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. CLI arguments (highest precedence, applied by the binary)
//! 2. Environment variables (`TANDEM_*` prefix, `__` between section and key)
//! 3. tandem.local.toml (site-local overrides)
//! 4. tandem.toml (working directory)
//! 5. /etc/tandem/tandem.toml, then ~/.config/tandem/config.toml
//! 6. Built-in defaults (lowest precedence)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_types::NodeSlot;

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::Paths;

/// Main Tandem configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TandemConfig {
    pub node: NodeConfig,
    pub peer: PeerConfig,
    pub failover: FailoverConfig,
    pub journal: JournalConfig,
    pub upgrade: UpgradeConfig,
    pub targets: TargetsConfig,
    pub logging: LoggingConfig,
}

/// Local node state locations and identity overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// Configuration database, relative to `data_dir` unless absolute.
    pub database_path: PathBuf,
    pub journal_path: PathBuf,
    pub license_path: PathBuf,
    pub pwenc_secret_path: PathBuf,
    pub authorized_keys_paths: Vec<PathBuf>,
    /// Directory holding the failover phase marker files.
    pub marker_dir: PathBuf,
    /// `"auto"` probes hardware; `"A"`, `"B"` or `"MANUAL"` pin the slot.
    pub slot: String,
    pub licensed: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/data"),
            database_path: PathBuf::from("tandem-v1.db"),
            journal_path: PathBuf::from("ha-journal"),
            license_path: PathBuf::from("license"),
            pwenc_secret_path: PathBuf::from("pwenc_secret"),
            authorized_keys_paths: vec![
                PathBuf::from("/root/.ssh/authorized_keys"),
                PathBuf::from("/home/admin/.ssh/authorized_keys"),
            ],
            marker_dir: PathBuf::from("/tmp"),
            slot: "auto".to_string(),
            licensed: true,
        }
    }
}

impl NodeConfig {
    /// Returns the pinned slot, or `None` when the slot should be probed.
    pub fn slot_override(&self) -> Result<Option<NodeSlot>, ConfigError> {
        if self.slot.eq_ignore_ascii_case("auto") {
            return Ok(None);
        }
        self.slot
            .parse::<NodeSlot>()
            .map(Some)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

/// Interlink peer and inbound RPC settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub address: String,
    pub port: u16,
    pub bind_address: String,
    /// Source addresses treated as the peer node when connecting from a low port.
    pub interlink_addresses: Vec<String>,
    pub rpc_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Shared token required from every other client. Empty disables token auth.
    pub token: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            address: "169.254.10.2".to_string(),
            port: 6000,
            bind_address: "0.0.0.0".to_string(),
            interlink_addresses: vec![
                "169.254.10.1".to_string(),
                "169.254.10.2".to_string(),
                "169.254.10.20".to_string(),
                "169.254.10.80".to_string(),
            ],
            rpc_timeout_secs: 5,
            connect_timeout_secs: 2,
            token: String::new(),
        }
    }
}

impl PeerConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn listen_endpoint(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub status_ttl_secs: u64,
    pub throttle_secs: u64,
    pub probe_timeout_secs: u64,
    /// Interval of the peer reachability check.
    pub peer_watch_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            status_ttl_secs: 300,
            throttle_secs: 2,
            probe_timeout_secs: 5,
            peer_watch_secs: 10,
        }
    }
}

impl FailoverConfig {
    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl_secs)
    }

    pub fn throttle(&self) -> Duration {
        Duration::from_secs(self.throttle_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn peer_watch(&self) -> Duration {
        Duration::from_secs(self.peer_watch_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub queue_capacity: usize,
    /// Poll interval for queued writes while the peer is failing.
    pub retry_poll_secs: u64,
    /// Pause before rebuilding the worker after an unexpected error.
    pub recovery_sleep_secs: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            retry_poll_secs: 5,
            recovery_sleep_secs: 5,
        }
    }
}

impl JournalConfig {
    pub fn retry_poll(&self) -> Duration {
        Duration::from_secs(self.retry_poll_secs)
    }

    pub fn recovery_sleep(&self) -> Duration {
        Duration::from_secs(self.recovery_sleep_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpgradeConfig {
    pub shutdown_wait_secs: u64,
    pub boot_wait_secs: u64,
    pub poll_interval_secs: u64,
    pub reboot_delay_secs: u64,
    pub finish_reboot_delay_secs: u64,
    pub upload_dir: PathBuf,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            shutdown_wait_secs: 90,
            boot_wait_secs: 900,
            poll_interval_secs: 5,
            reboot_delay_secs: 5,
            finish_reboot_delay_secs: 10,
            upload_dir: PathBuf::from("/var/tmp/firmware"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetsConfig {
    /// Upper bound for a role transition of all endpoints.
    pub failover_budget_secs: u64,
    pub settle_retries: u32,
    pub settle_interval_ms: u64,
    /// Bound for the peer to see an attached or detached LUN.
    pub lun_wait_secs: u64,
}

impl Default for TargetsConfig {
    fn default() -> Self {
        Self {
            failover_budget_secs: 60,
            settle_retries: 10,
            settle_interval_ms: 1000,
            lun_wait_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Extra `EnvFilter` directives, e.g. `"tandem_journal=debug"`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl TandemConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from a specific directory
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(dir).load()
    }

    /// Resolve node state paths relative to `node.data_dir`
    pub fn resolve_paths(&mut self) {
        let base = self.node.data_dir.clone();
        for path in [
            &mut self.node.database_path,
            &mut self.node.journal_path,
            &mut self.node.license_path,
            &mut self.node.pwenc_secret_path,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.node.slot_override()?;
        if self.journal.queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "journal.queue_capacity must be positive".to_string(),
            ));
        }
        if self.peer.rpc_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "peer.rpc_timeout_secs must be positive".to_string(),
            ));
        }
        if self.upgrade.poll_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "upgrade.poll_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TandemConfig::default();
        assert_eq!(config.peer.port, 6000);
        assert_eq!(config.failover.status_ttl_secs, 300);
        assert_eq!(config.upgrade.boot_wait_secs, 900);
        assert_eq!(config.targets.settle_retries, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_path_resolution() {
        let mut config = TandemConfig::default();
        config.node.data_dir = PathBuf::from("/srv/tandem");
        config.node.license_path = PathBuf::from("/etc/license");
        config.resolve_paths();

        assert_eq!(config.node.journal_path, PathBuf::from("/srv/tandem/ha-journal"));
        assert_eq!(config.node.database_path, PathBuf::from("/srv/tandem/tandem-v1.db"));
        assert_eq!(config.node.license_path, PathBuf::from("/etc/license"));
    }

    #[test]
    fn test_slot_override() {
        let mut node = NodeConfig::default();
        assert_eq!(node.slot_override().unwrap(), None);
        node.slot = "b".to_string();
        assert_eq!(node.slot_override().unwrap(), Some(NodeSlot::B));
        node.slot = "C".to_string();
        assert!(node.slot_override().is_err());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let mut config = TandemConfig::default();
        config.journal.queue_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
