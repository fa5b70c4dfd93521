//! The failover platform backed by the controller's own tools.
//!
//! Pools and boot environments come from `zpool`/`zfs`, fencing from
//! `fenced`, services from `systemctl`. Interface layout is read from the
//! configuration database; VRRP state is whatever the last keepalived
//! notification recorded under the marker directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tandem_config::TandemConfig;
use tandem_failover::platform::{
    Disks, FailoverPhase, Fencing, Kmip, Network, PhaseMarker, Pools, Services, StagedImage,
    System, Updates, fenced,
};
use tandem_failover::{HaError, HaResult, Platform};
use tandem_types::{
    BootEnvironment, InterfaceInfo, JobId, JobState, KeyEntry, KmipKey, PoolInfo, ServiceVerb,
    VrrpState,
};
use tracing::{debug, info, warn};

use crate::command::{self, ExecutionError};
use crate::store::SqliteStore;

const BOOT_POOL: &str = "boot-pool";
const INSTALLER: &str = "tandem-install";
const READY_MARKER: &str = ".system_ready";
const UPDATE_SUFFIX: &str = "update";

#[derive(Debug, Clone)]
pub struct SystemPaths {
    pub marker_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub license_path: PathBuf,
    pub version_file: PathBuf,
    pub boot_id_file: PathBuf,
}

impl SystemPaths {
    pub fn from_config(config: &TandemConfig) -> Self {
        Self {
            marker_dir: config.node.marker_dir.clone(),
            upload_dir: config.upgrade.upload_dir.clone(),
            license_path: config.node.license_path.clone(),
            version_file: PathBuf::from("/etc/version"),
            boot_id_file: PathBuf::from("/proc/sys/kernel/random/boot_id"),
        }
    }
}

fn phase_file(phase: FailoverPhase) -> &'static str {
    match phase {
        FailoverPhase::Electing => ".failover_electing",
        FailoverPhase::Importing => ".failover_importing",
        FailoverPhase::Failed => ".failover_failed",
    }
}

fn vrrp_file(marker_dir: &Path, interface: &str) -> PathBuf {
    marker_dir.join(format!(".vrrp_{interface}"))
}

/// Records the VRRP state keepalived reported for `interface`.
pub fn record_vrrp_state(marker_dir: &Path, interface: &str, state: VrrpState) -> io::Result<()> {
    let text = match state {
        VrrpState::Master => "MASTER",
        VrrpState::Backup => "BACKUP",
        VrrpState::Init => "INIT",
    };
    fs::write(vrrp_file(marker_dir, interface), text)
}

fn read_vrrp_state(marker_dir: &Path, interface: &str) -> VrrpState {
    match fs::read_to_string(vrrp_file(marker_dir, interface)) {
        Ok(text) => match text.trim() {
            "MASTER" => VrrpState::Master,
            "BACKUP" => VrrpState::Backup,
            _ => VrrpState::Init,
        },
        Err(_) => VrrpState::Init,
    }
}

fn io_error(path: &Path, err: &io::Error) -> HaError {
    HaError::platform(format_args!("{}: {err}", path.display()))
}

// ============================================================================
// Output parsing
// ============================================================================

/// Serials of data disks from `lsblk -dn -o NAME,SERIAL,TYPE`.
pub fn parse_data_serials(lsblk: &str, boot_devices: &BTreeSet<String>) -> Vec<String> {
    let mut serials: Vec<String> = lsblk
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [name, serial, "disk"] if !boot_devices.contains(*name) => {
                    Some((*serial).to_string())
                }
                _ => None,
            }
        })
        .collect();
    serials.sort();
    serials.dedup();
    serials
}

/// Whole-disk names behind the vdevs of `zpool list -H -v -P`.
pub fn parse_pool_devices(zpool: &str) -> BTreeSet<String> {
    zpool
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|vdev| vdev.strip_prefix("/dev/"))
        .map(|dev| {
            // sda3 -> sda, nvme0n1p2 -> nvme0n1
            let dev = dev.trim_end_matches(|c: char| c.is_ascii_digit());
            match dev.strip_suffix('p') {
                Some(base) if base.starts_with("nvme") => base.to_string(),
                _ if dev.starts_with("nvme") => format!("{dev}1"),
                _ => dev.to_string(),
            }
        })
        .collect()
}

/// Boot environments under `<pool>/ROOT` from `zfs list -H -o name`.
pub fn parse_boot_environments(
    datasets: &str,
    root_source: &str,
    bootfs: &str,
) -> Vec<BootEnvironment> {
    let prefix = format!("{BOOT_POOL}/ROOT/");
    datasets
        .lines()
        .filter_map(|line| line.trim().strip_prefix(&prefix))
        .filter(|id| !id.is_empty() && !id.contains('/'))
        .map(|id| BootEnvironment {
            id: id.to_string(),
            active: root_source.trim() == format!("{prefix}{id}"),
            activated: bootfs.trim() == format!("{prefix}{id}"),
        })
        .collect()
}

// ============================================================================
// Platform
// ============================================================================

pub struct SystemPlatform {
    paths: SystemPaths,
    store: Arc<SqliteStore>,
    licensed: bool,
    jobs: Arc<Mutex<BTreeMap<JobId, JobState>>>,
    next_job: AtomicU64,
    kmip_keys: Mutex<Vec<KmipKey>>,
}

impl SystemPlatform {
    pub fn new(paths: SystemPaths, store: Arc<SqliteStore>, licensed: bool) -> Arc<Self> {
        Arc::new(Self {
            paths,
            store,
            licensed,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            next_job: AtomicU64::new(1),
            kmip_keys: Mutex::new(Vec::new()),
        })
    }

    /// Bundles this platform and the datastore for the failover service.
    pub fn platform(self: &Arc<Self>) -> Platform {
        Platform {
            pools: self.clone(),
            disks: self.clone(),
            fencing: self.clone(),
            network: self.clone(),
            phase: self.clone(),
            services: self.clone(),
            system: self.clone(),
            updates: self.clone(),
            settings: self.store.clone(),
            datastore: self.store.clone(),
            kmip: self.clone(),
        }
    }

    /// Marks the node ready for peer-driven operations.
    pub fn mark_ready(&self) -> HaResult<()> {
        let path = self.paths.marker_dir.join(READY_MARKER);
        fs::write(&path, b"").map_err(|e| io_error(&path, &e))
    }

    /// Forgets readiness left over from a previous daemon run.
    pub fn clear_ready(&self) {
        let path = self.paths.marker_dir.join(READY_MARKER);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to clear ready marker");
        }
    }

    fn imported_pools(&self) -> BTreeSet<String> {
        match command::stdout(Command::new("zpool").args(["list", "-H", "-o", "name"])) {
            Ok(out) => out.lines().map(|l| l.trim().to_string()).collect(),
            Err(e) => {
                warn!(error = %e, "failed to list imported pools");
                BTreeSet::new()
            }
        }
    }
}

impl Pools for SystemPlatform {
    fn configured(&self) -> Vec<PoolInfo> {
        let rows = match self.store.pools() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to read configured pools");
                return Vec::new();
            }
        };
        let imported = self.imported_pools();
        rows.into_iter()
            .map(|(name, guid)| PoolInfo {
                imported: imported.contains(&name),
                name,
                guid,
            })
            .collect()
    }

    fn import(&self, name: &str) -> HaResult<()> {
        let guid = self
            .store
            .pools()?
            .into_iter()
            .find(|(pool, _)| pool == name)
            .map(|(_, guid)| guid)
            .ok_or_else(|| HaError::Validation(format!("pool {name} is not configured")))?;
        command::execute(Command::new("zpool").args([
            "import",
            "-f",
            "-o",
            "cachefile=none",
            &guid,
            name,
        ]))?;
        info!(pool = name, "pool imported");
        Ok(())
    }

    fn export(&self, name: &str) -> HaResult<()> {
        command::execute(Command::new("zpool").args(["export", "-f", name]))?;
        info!(pool = name, "pool exported");
        Ok(())
    }

    fn unlock(&self, pool: &str, keys: &[KeyEntry]) -> HaResult<()> {
        let mut failed = Vec::new();
        for key in keys {
            let result = command::execute_with_input(
                Command::new("zfs").args(["load-key", "-L", "prompt", &key.name]),
                key.passphrase.as_bytes(),
            );
            if let Err(e) = result {
                warn!(pool, dataset = %key.name, error = %e, "failed to load key");
                failed.push(key.name.clone());
            }
        }
        if let Err(e) = command::execute(Command::new("zfs").args(["mount", "-a"])) {
            warn!(pool, error = %e, "mounting unlocked datasets failed");
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(HaError::platform(format_args!(
                "failed to unlock {}",
                failed.join(", ")
            )))
        }
    }
}

impl Disks for SystemPlatform {
    fn data_disk_serials(&self) -> HaResult<Vec<String>> {
        let boot = command::stdout(Command::new("zpool").args(["list", "-H", "-v", "-P", BOOT_POOL]))
            .map(|out| parse_pool_devices(&out))?;
        let lsblk = command::stdout(Command::new("lsblk").args(["-dn", "-o", "NAME,SERIAL,TYPE"]))?;
        Ok(parse_data_serials(&lsblk, &boot))
    }
}

impl Fencing for SystemPlatform {
    fn stop(&self) {
        // pkill exits 1 when nothing matched.
        if let Err(e) = command::exit_code(Command::new("pkill").args(["-9", "-x", "fenced"])) {
            warn!(error = %e, "failed to stop fenced");
        }
    }

    fn start(&self, force: bool) -> i32 {
        let mut cmd = Command::new("fenced");
        if force {
            cmd.arg("--force");
        }
        match command::exit_code(&mut cmd) {
            Ok(code) => code,
            Err(e) => {
                warn!(error = %e, "failed to run fenced");
                fenced::FATAL
            }
        }
    }
}

impl Network for SystemPlatform {
    fn interfaces(&self) -> Vec<InterfaceInfo> {
        let rows = match self.store.interfaces() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to read interfaces");
                return Vec::new();
            }
        };
        rows.into_iter()
            .map(|row| {
                let vrrp = (!row.vips.is_empty())
                    .then(|| read_vrrp_state(&self.paths.marker_dir, &row.name));
                InterfaceInfo {
                    name: row.name,
                    critical: row.critical,
                    virtual_aliases: row.vips,
                    vrrp,
                    internal: row.internal,
                }
            })
            .collect()
    }

    fn set_vips(&self, owned: bool) -> HaResult<()> {
        let verb = if owned { "add" } else { "del" };
        let mut first_error = None;
        for row in self.store.interfaces()? {
            for vip in &row.vips {
                let result =
                    command::execute(Command::new("ip").args(["addr", verb, vip, "dev", &row.name]));
                match result {
                    Ok(_) => debug!(interface = %row.name, vip, verb, "virtual address updated"),
                    // Already in the requested state.
                    Err(ExecutionError::CommandFailure(f))
                        if f.stderr.contains("File exists")
                            || f.stderr.contains("Cannot assign requested address") => {}
                    Err(e) => {
                        warn!(interface = %row.name, vip, error = %e, "failed to update virtual address");
                        first_error.get_or_insert(e);
                    }
                }
            }
        }
        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    fn set_traffic(&self, allow: bool) -> HaResult<()> {
        for row in self.store.interfaces()? {
            if row.internal || row.vips.is_empty() {
                continue;
            }
            let rule = ["INPUT", "-i", row.name.as_str(), "-j", "DROP"];
            let present = command::exit_code(Command::new("iptables").arg("-C").args(rule))? == 0;
            match (allow, present) {
                (true, true) => {
                    command::execute(Command::new("iptables").arg("-D").args(rule))?;
                }
                (false, false) => {
                    command::execute(Command::new("iptables").arg("-I").args(rule))?;
                }
                _ => {}
            }
        }
        info!(allow, "failover interface traffic updated");
        Ok(())
    }

    fn sync(&self) -> HaResult<()> {
        command::execute(Command::new("systemctl").args(["reload-or-restart", "keepalived"]))?;
        Ok(())
    }
}

impl PhaseMarker for SystemPlatform {
    fn phase(&self) -> Option<FailoverPhase> {
        [
            FailoverPhase::Failed,
            FailoverPhase::Importing,
            FailoverPhase::Electing,
        ]
        .into_iter()
        .find(|phase| self.paths.marker_dir.join(phase_file(*phase)).exists())
    }

    fn set_phase(&self, phase: Option<FailoverPhase>) {
        for other in [
            FailoverPhase::Electing,
            FailoverPhase::Importing,
            FailoverPhase::Failed,
        ] {
            let path = self.paths.marker_dir.join(phase_file(other));
            let result = if Some(other) == phase {
                fs::write(&path, b"")
            } else {
                match fs::remove_file(&path) {
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "failed to update phase marker");
            }
        }
    }
}

impl Services for SystemPlatform {
    fn control(&self, verb: ServiceVerb, service: &str) -> HaResult<()> {
        command::execute(Command::new("systemctl").args([verb.as_str(), service]))?;
        Ok(())
    }

    fn enabled(&self, service: &str) -> bool {
        self.store.service_enabled(service)
    }

    fn started(&self, service: &str) -> bool {
        command::exit_code(Command::new("systemctl").args(["is-active", "--quiet", service]))
            .is_ok_and(|code| code == 0)
    }

    fn become_active(&self, service: &str) -> HaResult<()> {
        // Target daemons read their role from the path state on reload.
        command::execute(Command::new("systemctl").args(["reload-or-restart", service]))?;
        Ok(())
    }
}

impl System for SystemPlatform {
    fn version(&self) -> String {
        fs::read_to_string(&self.paths.version_file)
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string())
    }

    fn boot_id(&self) -> String {
        fs::read_to_string(&self.paths.boot_id_file)
            .map(|v| v.trim().to_string())
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to read boot id");
                String::new()
            })
    }

    fn ready(&self) -> bool {
        self.paths.marker_dir.join(READY_MARKER).exists()
    }

    fn reboot(&self, delay: Duration) -> HaResult<()> {
        info!(?delay, "reboot scheduled");
        thread::Builder::new()
            .name("reboot".to_string())
            .spawn(move || {
                thread::sleep(delay);
                if let Err(e) = command::execute(Command::new("systemctl").arg("reboot")) {
                    warn!(error = %e, "reboot failed");
                }
            })
            .map_err(|e| HaError::platform(format_args!("failed to schedule reboot: {e}")))?;
        Ok(())
    }

    fn licensed(&self) -> bool {
        self.licensed && self.paths.license_path.exists()
    }
}

impl Updates for SystemPlatform {
    fn recreate_upload_area(&self) -> HaResult<PathBuf> {
        let dir = &self.paths.upload_dir;
        match fs::remove_dir_all(dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(io_error(dir, &e)),
            _ => {}
        }
        fs::create_dir_all(dir).map_err(|e| io_error(dir, &e))?;
        Ok(dir.clone())
    }

    fn stage(&self, train: Option<&str>) -> HaResult<StagedImage> {
        let dir = &self.paths.upload_dir;
        let entries = fs::read_dir(dir).map_err(|e| io_error(dir, &e))?;
        let mut images: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == UPDATE_SUFFIX))
            .filter(|path| {
                train.is_none_or(|train| {
                    path.file_name()
                        .is_some_and(|name| name.to_string_lossy().contains(train))
                })
            })
            .collect();
        images.sort();
        let path = images.pop().ok_or_else(|| {
            HaError::Validation(format!("no update image staged in {}", dir.display()))
        })?;
        // The manifest sits next to the image; the file stem is the fallback.
        let version = fs::read_to_string(path.with_extension("version"))
            .map(|v| v.trim().to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .ok_or_else(|| HaError::Validation(format!("{} has no version", path.display())))?;
        Ok(StagedImage { path, version })
    }

    fn boot_environments(&self) -> HaResult<Vec<BootEnvironment>> {
        let root = format!("{BOOT_POOL}/ROOT");
        let datasets =
            command::stdout(Command::new("zfs").args(["list", "-H", "-o", "name", "-d", "1", &root]))?;
        let source = command::stdout(Command::new("findmnt").args(["-n", "-o", "SOURCE", "/"]))?;
        let bootfs = command::stdout(
            Command::new("zpool").args(["get", "-H", "-o", "value", "bootfs", BOOT_POOL]),
        )?;
        Ok(parse_boot_environments(&datasets, &source, &bootfs))
    }

    fn activate(&self, id: &str) -> HaResult<()> {
        let bootfs = format!("bootfs={BOOT_POOL}/ROOT/{id}");
        command::execute(Command::new("zpool").args(["set", &bootfs, BOOT_POOL]))?;
        info!(boot_environment = id, "boot environment activated");
        Ok(())
    }

    fn start_update(&self, image: &Path, name: &str) -> HaResult<JobId> {
        let job = JobId::new(self.next_job.fetch_add(1, Ordering::Relaxed));
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                job,
                JobState::Running {
                    percent: 0,
                    description: format!("Installing {name}"),
                },
            );

        let jobs = Arc::clone(&self.jobs);
        let mut cmd = Command::new(INSTALLER);
        cmd.arg("--image").arg(image).args(["--boot-environment", name]);
        thread::Builder::new()
            .name(format!("update-{}", job.as_u64()))
            .spawn(move || {
                let state = match command::execute(&mut cmd) {
                    Ok(_) => JobState::Success,
                    Err(e) => JobState::Failed(e.to_string()),
                };
                info!(%job, ?state, "update job finished");
                jobs.lock().unwrap_or_else(PoisonError::into_inner).insert(job, state);
            })
            .map_err(|e| HaError::platform(format_args!("failed to start update: {e}")))?;
        Ok(job)
    }

    fn job_status(&self, job: JobId) -> HaResult<JobState> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job)
            .cloned()
            .ok_or_else(|| HaError::Validation(format!("unknown {job}")))
    }
}

impl Kmip for SystemPlatform {
    fn manages_zfs_keys(&self) -> bool {
        self.store.kmip_manages_zfs_keys()
    }

    fn memory_keys(&self) -> Vec<KmipKey> {
        self.kmip_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_memory_keys(&self, keys: Vec<KmipKey>) {
        *self.kmip_keys.lock().unwrap_or_else(PoisonError::into_inner) = keys;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_failover::platform::Datastore;
    use tempfile::TempDir;

    fn platform() -> (TempDir, Arc<SystemPlatform>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("tandem.db")).unwrap());
        let paths = SystemPaths {
            marker_dir: dir.path().to_path_buf(),
            upload_dir: dir.path().join("upload"),
            license_path: dir.path().join("license"),
            version_file: dir.path().join("version"),
            boot_id_file: dir.path().join("boot_id"),
        };
        (dir, SystemPlatform::new(paths, store, true))
    }

    #[test]
    fn test_parse_data_serials_skips_boot_and_partitions() {
        let lsblk = "sda BOOT0001 disk\nsdb ZA1 disk\nsdc ZA2 disk\nsr0 CD01 rom\nnvme0n1 NV1 disk\n";
        let boot = BTreeSet::from(["sda".to_string()]);
        assert_eq!(parse_data_serials(lsblk, &boot), vec!["NV1", "ZA1", "ZA2"]);
    }

    #[test]
    fn test_parse_pool_devices() {
        let zpool = "boot-pool\t14G\t3G\n\tmirror-0\t-\n\t/dev/sda3\t-\n\t/dev/nvme0n1p2\t-\n";
        assert_eq!(
            parse_pool_devices(zpool),
            BTreeSet::from(["nvme0n1".to_string(), "sda".to_string()])
        );
    }

    #[test]
    fn test_parse_boot_environments() {
        let datasets = "boot-pool/ROOT\nboot-pool/ROOT/25.04.0\nboot-pool/ROOT/25.10.0\nboot-pool/ROOT/25.10.0/audit\n";
        let bes = parse_boot_environments(datasets, "boot-pool/ROOT/25.04.0\n", "boot-pool/ROOT/25.10.0\n");
        assert_eq!(
            bes,
            vec![
                BootEnvironment {
                    id: "25.04.0".into(),
                    active: true,
                    activated: false
                },
                BootEnvironment {
                    id: "25.10.0".into(),
                    active: false,
                    activated: true
                },
            ]
        );
    }

    #[test]
    fn test_phase_markers_are_exclusive() {
        let (_dir, platform) = platform();
        assert_eq!(platform.phase(), None);
        platform.set_phase(Some(FailoverPhase::Electing));
        assert_eq!(platform.phase(), Some(FailoverPhase::Electing));
        platform.set_phase(Some(FailoverPhase::Importing));
        assert_eq!(platform.phase(), Some(FailoverPhase::Importing));
        platform.set_phase(None);
        assert_eq!(platform.phase(), None);
    }

    #[test]
    fn test_interfaces_report_recorded_vrrp_state() {
        let (dir, platform) = platform();
        platform
            .store
            .execute(
                "INSERT INTO network_interfaces (int_interface, int_critical, int_vip) \
                 VALUES ('eth0', 1, '10.0.0.10'), ('eth1', 0, '')",
                &[],
            )
            .unwrap();
        record_vrrp_state(dir.path(), "eth0", VrrpState::Master).unwrap();

        let interfaces = platform.interfaces();
        assert_eq!(interfaces[0].vrrp, Some(VrrpState::Master));
        assert_eq!(interfaces[1].vrrp, None);
    }

    #[test]
    fn test_licensed_needs_license_file() {
        let (dir, platform) = platform();
        assert!(!platform.licensed());
        fs::write(dir.path().join("license"), b"HA").unwrap();
        assert!(platform.licensed());
    }

    #[test]
    fn test_stage_prefers_manifest_version() {
        let (_dir, platform) = platform();
        let upload = platform.recreate_upload_area().unwrap();
        fs::write(upload.join("tandem-25.04.update"), b"old").unwrap();
        fs::write(upload.join("tandem-25.10.update"), b"new").unwrap();
        fs::write(upload.join("tandem-25.10.version"), b"25.10.0\n").unwrap();

        let staged = platform.stage(None).unwrap();
        assert_eq!(staged.path, upload.join("tandem-25.10.update"));
        assert_eq!(staged.version, "25.10.0");

        let staged = platform.stage(Some("25.04")).unwrap();
        assert_eq!(staged.version, "tandem-25.04");
    }

    #[test]
    fn test_unknown_job_rejected() {
        let (_dir, platform) = platform();
        assert!(matches!(
            platform.job_status(JobId::new(42)),
            Err(HaError::Validation(_))
        ));
    }

    #[test]
    fn test_kmip_memory_keys() {
        let (_dir, platform) = platform();
        let key = KmipKey {
            id: "k1".into(),
            secret: "s".into(),
        };
        platform.update_memory_keys(vec![key.clone()]);
        assert_eq!(platform.memory_keys(), vec![key]);
        assert!(!platform.manages_zfs_keys());
    }
}
