//! The failover service: one per node, shared by the RPC dispatcher, the
//! event handler and the daemon.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tandem_config::TandemConfig;
use tandem_journal::{JournalQueue, WatermarkStore};
use tandem_peer::PeerClient;
use tandem_target::TargetFailoverEngine;
use tandem_types::{
    EncryptionKeys, HaConfig, HaStatus, JournalGeneration, NodeIdentity, NodeSlot,
};
use tracing::debug;

use crate::alerts::AlertRegistry;
use crate::bus::EventBus;
use crate::events::EventSlot;
use crate::locks::JobLocks;
use crate::platform::Platform;
use crate::status::RoleCache;
use crate::upgrade::UpgradeProgress;
use crate::{HaError, HaResult};

/// Tunables of the failover service.
#[derive(Debug, Clone)]
pub struct FailoverSettings {
    /// Lifetime of a cached, decided local status.
    pub status_ttl: Duration,
    /// Minimum spacing of status recomputations per caller session.
    pub throttle: Duration,
    /// Timeout of the peer probes behind status and disabled reasons.
    pub probe_timeout: Duration,
    /// Delay between fencing attempts while the peer still holds reservations.
    pub fence_retry_interval: Duration,
    pub fence_attempts: u32,
    /// Reboot delay requested from the peer after `sync_to_peer`.
    pub sync_reboot_delay: Duration,
    pub shutdown_wait: Duration,
    pub boot_wait: Duration,
    pub upgrade_poll: Duration,
    pub upgrade_reboot_delay: Duration,
    pub finish_reboot_delay: Duration,
    /// Files copied verbatim to the peer by `sync_to_peer`.
    pub license_path: PathBuf,
    pub pwenc_secret_path: PathBuf,
    pub authorized_keys_paths: Vec<PathBuf>,
    /// Replay watermark of the replicated configuration writes.
    pub watermark_path: PathBuf,
}

impl FailoverSettings {
    /// Derives the settings from a loaded (path-resolved) configuration.
    pub fn from_config(config: &TandemConfig) -> Self {
        Self {
            status_ttl: config.failover.status_ttl(),
            throttle: config.failover.throttle(),
            probe_timeout: config.failover.probe_timeout(),
            fence_retry_interval: Duration::from_secs(5),
            fence_attempts: 4,
            sync_reboot_delay: Duration::from_secs(2),
            shutdown_wait: Duration::from_secs(config.upgrade.shutdown_wait_secs),
            boot_wait: Duration::from_secs(config.upgrade.boot_wait_secs),
            upgrade_poll: Duration::from_secs(config.upgrade.poll_interval_secs),
            upgrade_reboot_delay: Duration::from_secs(config.upgrade.reboot_delay_secs),
            finish_reboot_delay: Duration::from_secs(config.upgrade.finish_reboot_delay_secs),
            license_path: config.node.license_path.clone(),
            pwenc_secret_path: config.node.pwenc_secret_path.clone(),
            authorized_keys_paths: config.node.authorized_keys_paths.clone(),
            watermark_path: config.node.data_dir.join("ha-replay.toml"),
        }
    }
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self::from_config(&TandemConfig::default())
    }
}

/// HA coordination for the local controller.
pub struct FailoverService {
    pub(crate) identity: NodeIdentity,
    pub(crate) settings: FailoverSettings,
    pub(crate) platform: Platform,
    pub(crate) peer: PeerClient,
    pub(crate) targets: Arc<TargetFailoverEngine>,
    pub(crate) bus: EventBus,
    pub(crate) alerts: Arc<AlertRegistry>,
    pub(crate) locks: JobLocks,
    pub(crate) roles: Mutex<RoleCache>,
    pub(crate) keys: Mutex<EncryptionKeys>,
    pub(crate) journal: OnceLock<JournalQueue>,
    pub(crate) watermark: Mutex<WatermarkStore>,
    pub(crate) events: EventSlot,
    pub(crate) upgrade_progress: Mutex<Option<UpgradeProgress>>,
    /// Set by a forced takeover while the peer did not answer.
    pub(crate) forced_alone: AtomicBool,
    /// Peer reachability at the last [`FailoverService::watch_peer`].
    pub(crate) peer_seen: AtomicBool,
}

impl FailoverService {
    pub fn new(
        identity: NodeIdentity,
        settings: FailoverSettings,
        platform: Platform,
        peer: PeerClient,
        targets: Arc<TargetFailoverEngine>,
        alerts: Arc<AlertRegistry>,
    ) -> Arc<Self> {
        let watermark = WatermarkStore::open(&settings.watermark_path);
        Arc::new(Self {
            identity,
            settings,
            platform,
            peer,
            targets,
            bus: EventBus::default(),
            alerts,
            locks: JobLocks::new(),
            roles: Mutex::new(RoleCache::default()),
            keys: Mutex::new(EncryptionKeys::default()),
            journal: OnceLock::new(),
            watermark: Mutex::new(watermark),
            events: EventSlot::default(),
            upgrade_progress: Mutex::new(None),
            forced_alone: AtomicBool::new(false),
            peer_seen: AtomicBool::new(false),
        })
    }

    /// Connects the replicator producer used by full database pushes.
    ///
    /// Only the first call has an effect.
    pub fn attach_journal(&self, queue: JournalQueue) {
        if self.journal.set(queue).is_err() {
            debug!("journal queue already attached");
        }
    }

    pub fn identity(&self) -> NodeIdentity {
        self.identity
    }

    pub fn slot(&self) -> NodeSlot {
        self.identity.slot
    }

    pub fn settings(&self) -> &FailoverSettings {
        &self.settings
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn peer(&self) -> &PeerClient {
        &self.peer
    }

    pub fn targets(&self) -> &Arc<TargetFailoverEngine> {
        &self.targets
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn alerts(&self) -> &Arc<AlertRegistry> {
        &self.alerts
    }

    pub fn locks(&self) -> &JobLocks {
        &self.locks
    }

    /// Licensed for HA right now. The license may be installed after boot.
    pub fn licensed(&self) -> bool {
        self.platform.system.licensed()
    }

    pub(crate) fn ha_config(&self) -> HaResult<HaConfig> {
        self.platform.settings.ha_config()
    }

    /// Fails unless the local role is MASTER.
    pub(crate) fn require_master(&self) -> HaResult<()> {
        match self.current_status() {
            HaStatus::Master => Ok(()),
            actual => Err(HaError::WrongRole {
                required: "MASTER",
                actual,
            }),
        }
    }

    pub(crate) fn lock_keys(&self) -> std::sync::MutexGuard<'_, EncryptionKeys> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Role of a node, for the journal replicator.
pub struct RoleAdapter(pub Arc<FailoverService>);

impl tandem_journal::RoleSource for RoleAdapter {
    fn current_status(&self) -> HaStatus {
        self.0.current_status()
    }

    fn applied_generation(&self) -> Option<JournalGeneration> {
        let watermark = self.0.watermark.lock().unwrap_or_else(PoisonError::into_inner);
        watermark.current().last().map(|(generation, _)| generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_default_config() {
        let settings = FailoverSettings::default();
        assert_eq!(settings.status_ttl, Duration::from_secs(300));
        assert_eq!(settings.throttle, Duration::from_secs(2));
        assert_eq!(settings.probe_timeout, Duration::from_secs(5));
        assert_eq!(settings.shutdown_wait, Duration::from_secs(90));
        assert_eq!(settings.boot_wait, Duration::from_secs(900));
        assert_eq!(settings.watermark_path, PathBuf::from("/data/ha-replay.toml"));
    }
}
