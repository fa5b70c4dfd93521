//! Contracts with the rest of the appliance.
//!
//! The failover engine never touches ZFS, VRRP, fencing or service managers
//! directly. Each concern sits behind a narrow trait:
//! - **Production**: `tandem-node` shells out to the system tools
//! - **Testing**: `tandem-test-harness` provides in-memory nodes

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tandem_types::{
    BootEnvironment, HaConfig, InterfaceInfo, JobId, JobState, KeyEntry, KmipKey, PoolInfo,
    ServiceVerb, SqlParam,
};

use crate::HaResult;

// ============================================================================
// Storage
// ============================================================================

pub trait Pools: Send + Sync {
    /// Every configured data pool, with whether it is imported here.
    fn configured(&self) -> Vec<PoolInfo>;

    fn import(&self, name: &str) -> HaResult<()>;

    /// Forced export.
    fn export(&self, name: &str) -> HaResult<()>;

    /// Loads cached passphrases for `pool` and its datasets after an import.
    fn unlock(&self, pool: &str, keys: &[KeyEntry]) -> HaResult<()>;
}

pub trait Disks: Send + Sync {
    /// Serials of the data disks, boot disks excluded.
    fn data_disk_serials(&self) -> HaResult<Vec<String>>;
}

/// Exit codes of the disk reservation daemon.
pub mod fenced {
    pub const OK: i32 = 0;
    pub const REGISTER_FAILED: i32 = 1;
    pub const REMOTE_RUNNING: i32 = 2;
    pub const RESERVE_FAILED: i32 = 3;
    pub const FATAL: i32 = 5;
    pub const ALREADY_RUNNING: i32 = 6;

    pub fn describe(code: i32) -> &'static str {
        match code {
            OK => "ok",
            REGISTER_FAILED => "failed to register keys on disks",
            REMOTE_RUNNING => "fenced is running on the remote node",
            RESERVE_FAILED => "10% or more of the disks failed to be reserved",
            FATAL => "fenced encountered an unexpected fatal error",
            ALREADY_RUNNING => "fenced is already running",
            _ => "unexpected exit code",
        }
    }
}

/// SCSI-reservation fencing of the shared disks.
pub trait Fencing: Send + Sync {
    fn stop(&self);

    /// Starts the reservation daemon; `force` ignores the peer's reservations.
    /// Returns the daemon's exit code (see [`fenced`]).
    fn start(&self, force: bool) -> i32;
}

// ============================================================================
// Network
// ============================================================================

pub trait Network: Send + Sync {
    fn interfaces(&self) -> Vec<InterfaceInfo>;

    /// Takes the virtual addresses (true) or releases them (false).
    fn set_vips(&self, owned: bool) -> HaResult<()>;

    /// Accepts (true) or drops (false) data traffic on failover interfaces.
    fn set_traffic(&self, allow: bool) -> HaResult<()>;

    /// Reapplies the network configuration from the database.
    fn sync(&self) -> HaResult<()>;
}

/// Marker left by an in-flight failover event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailoverPhase {
    Electing,
    Importing,
    Failed,
}

pub trait PhaseMarker: Send + Sync {
    fn phase(&self) -> Option<FailoverPhase>;

    fn set_phase(&self, phase: Option<FailoverPhase>);
}

// ============================================================================
// Node services
// ============================================================================

pub trait Services: Send + Sync {
    fn control(&self, verb: ServiceVerb, service: &str) -> HaResult<()>;

    /// Configured to start at boot.
    fn enabled(&self, service: &str) -> bool;

    fn started(&self, service: &str) -> bool;

    /// Promotes a service that keeps standby state (iSCSI, nvmet).
    fn become_active(&self, service: &str) -> HaResult<()>;
}

pub trait System: Send + Sync {
    fn version(&self) -> String;

    /// Changes on every boot.
    fn boot_id(&self) -> String;

    fn ready(&self) -> bool;

    fn reboot(&self, delay: Duration) -> HaResult<()>;

    /// Licensed for HA.
    fn licensed(&self) -> bool;
}

/// An update image staged in the upload area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedImage {
    pub path: PathBuf,
    /// Version from the image manifest, used as the boot environment name.
    pub version: String,
}

pub trait Updates: Send + Sync {
    /// Empties the upload area and returns its path.
    fn recreate_upload_area(&self) -> HaResult<PathBuf>;

    /// Downloads (or locates an uploaded) image for `train`.
    fn stage(&self, train: Option<&str>) -> HaResult<StagedImage>;

    fn boot_environments(&self) -> HaResult<Vec<BootEnvironment>>;

    /// Selects the boot environment for the next boot.
    fn activate(&self, id: &str) -> HaResult<()>;

    /// Starts installing `image` into boot environment `name`.
    fn start_update(&self, image: &Path, name: &str) -> HaResult<JobId>;

    fn job_status(&self, job: JobId) -> HaResult<JobState>;
}

// ============================================================================
// Persistent settings
// ============================================================================

/// Key set while an HA upgrade waits for `upgrade_finish`.
pub const HA_UPGRADE_FLAG: &str = "HA_UPGRADE";

pub trait SettingsStore: Send + Sync {
    fn ha_config(&self) -> HaResult<HaConfig>;

    /// Persists the row; the write is journaled like any other.
    fn save_ha_config(&self, config: &HaConfig) -> HaResult<()>;

    fn flag(&self, key: &str) -> bool;

    fn set_flag(&self, key: &str, value: bool) -> HaResult<()>;
}

/// The configuration database.
pub trait Datastore: Send + Sync {
    fn path(&self) -> PathBuf;

    /// Applies a write replicated from the MASTER without journaling it again.
    fn execute(&self, sql: &str, params: &[SqlParam]) -> HaResult<()>;

    /// Replaces the live database with `replacement` and reopens it.
    fn install(&self, replacement: &Path) -> HaResult<()>;
}

pub trait Kmip: Send + Sync {
    /// KMIP is enabled and manages dataset keys.
    fn manages_zfs_keys(&self) -> bool;

    fn memory_keys(&self) -> Vec<KmipKey>;

    fn update_memory_keys(&self, keys: Vec<KmipKey>);
}

// ============================================================================
// Bundle
// ============================================================================

/// Every collaborator of the failover engine.
#[derive(Clone)]
pub struct Platform {
    pub pools: Arc<dyn Pools>,
    pub disks: Arc<dyn Disks>,
    pub fencing: Arc<dyn Fencing>,
    pub network: Arc<dyn Network>,
    pub phase: Arc<dyn PhaseMarker>,
    pub services: Arc<dyn Services>,
    pub system: Arc<dyn System>,
    pub updates: Arc<dyn Updates>,
    pub settings: Arc<dyn SettingsStore>,
    pub datastore: Arc<dyn Datastore>,
    pub kmip: Arc<dyn Kmip>,
}
