//! One controller's view of the shelf, implementing the platform traits.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tandem_failover::platform::{
    Disks, FailoverPhase, Fencing, Kmip, Network, PhaseMarker, Platform, Pools, Services, System,
    StagedImage, Updates, fenced,
};
use tandem_failover::{HaError, HaResult};
use tandem_node::store::SqliteStore;
use tandem_types::{
    BootEnvironment, Errno, InterfaceInfo, JobId, JobState, KeyEntry, KmipKey, NodeSlot, PoolInfo,
    ServiceVerb,
};
use tracing::debug;

use crate::shelf::{FAILOVER_IFACE, POOL, POOL_GUID, Shelf};

/// State that dies with the middleware.
#[derive(Debug, Default)]
pub struct ControllerState {
    pub phase: Option<FailoverPhase>,
    pub traffic: bool,
    pub enabled: BTreeSet<String>,
    pub started: BTreeSet<String>,
    /// Every service action executed here, in order.
    pub invocations: Vec<(ServiceVerb, String)>,
    /// Datasets unlocked after an import.
    pub unlocked: Vec<String>,
    pub kmip_keys: Vec<KmipKey>,
    pub boot_environments: Vec<BootEnvironment>,
    pub jobs: Vec<JobState>,
    pub reboots: u32,
}

pub struct Controller {
    slot: NodeSlot,
    shelf: Shelf,
    root: PathBuf,
    boot_id: String,
    state: Mutex<ControllerState>,
}

impl Controller {
    pub fn new(slot: NodeSlot, shelf: Shelf, root: &Path, boot: u32) -> Arc<Self> {
        Arc::new(Self {
            slot,
            shelf,
            root: root.to_path_buf(),
            boot_id: format!("{slot}-boot-{boot}"),
            state: Mutex::new(ControllerState::default()),
        })
    }

    pub fn slot(&self) -> NodeSlot {
        self.slot
    }

    pub fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Service actions executed on this controller.
    pub fn invocations(&self) -> Vec<(ServiceVerb, String)> {
        self.state().invocations.clone()
    }

    pub fn platform(self: &Arc<Self>, store: Arc<SqliteStore>) -> Platform {
        Platform {
            pools: self.clone(),
            disks: self.clone(),
            fencing: self.clone(),
            network: self.clone(),
            phase: self.clone(),
            services: self.clone(),
            system: self.clone(),
            updates: self.clone(),
            settings: store.clone(),
            datastore: store,
            kmip: self.clone(),
        }
    }

    fn upload_dir(&self) -> PathBuf {
        self.root.join("upload")
    }
}

impl Pools for Controller {
    fn configured(&self) -> Vec<PoolInfo> {
        vec![PoolInfo {
            name: POOL.to_string(),
            guid: POOL_GUID.to_string(),
            imported: self.shelf.lock().pool_owner == Some(self.slot),
        }]
    }

    fn import(&self, name: &str) -> HaResult<()> {
        if name != POOL {
            return Err(HaError::platform(format_args!("cannot import '{name}': no such pool")));
        }
        let mut shelf = self.shelf.lock();
        if let Some(holder) = shelf.live_other(shelf.reservation, self.slot) {
            return Err(HaError::platform(format_args!(
                "cannot import '{name}': disks reserved by controller {holder}"
            )));
        }
        if let Some(owner) = shelf.live_other(shelf.pool_owner, self.slot) {
            return Err(HaError::platform(format_args!(
                "cannot import '{name}': pool is in use on controller {owner}"
            )));
        }
        shelf.pool_owner = Some(self.slot);
        debug!(slot = %self.slot, pool = name, "pool imported");
        Ok(())
    }

    fn export(&self, name: &str) -> HaResult<()> {
        let mut shelf = self.shelf.lock();
        if name == POOL && shelf.pool_owner == Some(self.slot) {
            shelf.pool_owner = None;
        }
        Ok(())
    }

    fn unlock(&self, _pool: &str, keys: &[KeyEntry]) -> HaResult<()> {
        self.state()
            .unlocked
            .extend(keys.iter().map(|k| k.name.clone()));
        Ok(())
    }
}

impl Disks for Controller {
    fn data_disk_serials(&self) -> HaResult<Vec<String>> {
        Ok(self.shelf.chassis(self.slot).disk_serials)
    }
}

impl Fencing for Controller {
    fn stop(&self) {
        let mut shelf = self.shelf.lock();
        if shelf.reservation == Some(self.slot) {
            shelf.reservation = None;
        }
    }

    fn start(&self, force: bool) -> i32 {
        let mut shelf = self.shelf.lock();
        if shelf.reservation == Some(self.slot) {
            return fenced::ALREADY_RUNNING;
        }
        if !force && shelf.live_other(shelf.reservation, self.slot).is_some() {
            return fenced::REMOTE_RUNNING;
        }
        shelf.reservation = Some(self.slot);
        fenced::OK
    }
}

impl Network for Controller {
    fn interfaces(&self) -> Vec<InterfaceInfo> {
        let chassis = self.shelf.chassis(self.slot);
        vec![InterfaceInfo {
            name: FAILOVER_IFACE.to_string(),
            critical: chassis.critical,
            virtual_aliases: chassis.virtual_aliases,
            vrrp: Some(chassis.vrrp),
            internal: false,
        }]
    }

    fn set_vips(&self, owned: bool) -> HaResult<()> {
        let mut shelf = self.shelf.lock();
        if owned {
            shelf.vip_owner = Some(self.slot);
        } else if shelf.vip_owner == Some(self.slot) {
            shelf.vip_owner = None;
        }
        Ok(())
    }

    fn set_traffic(&self, allow: bool) -> HaResult<()> {
        self.state().traffic = allow;
        Ok(())
    }

    fn sync(&self) -> HaResult<()> {
        Ok(())
    }
}

impl PhaseMarker for Controller {
    fn phase(&self) -> Option<FailoverPhase> {
        self.state().phase
    }

    fn set_phase(&self, phase: Option<FailoverPhase>) {
        self.state().phase = phase;
    }
}

impl Services for Controller {
    fn control(&self, verb: ServiceVerb, service: &str) -> HaResult<()> {
        let mut state = self.state();
        state.invocations.push((verb, service.to_string()));
        match verb {
            ServiceVerb::Stop => {
                state.started.remove(service);
            }
            ServiceVerb::Start | ServiceVerb::Restart | ServiceVerb::Reload => {
                state.started.insert(service.to_string());
            }
        }
        Ok(())
    }

    fn enabled(&self, service: &str) -> bool {
        self.state().enabled.contains(service)
    }

    fn started(&self, service: &str) -> bool {
        self.state().started.contains(service)
    }

    fn become_active(&self, service: &str) -> HaResult<()> {
        self.state().started.insert(service.to_string());
        Ok(())
    }
}

impl System for Controller {
    fn version(&self) -> String {
        self.shelf.chassis(self.slot).version
    }

    fn boot_id(&self) -> String {
        self.boot_id.clone()
    }

    fn ready(&self) -> bool {
        self.shelf.running(self.slot)
    }

    fn reboot(&self, _delay: Duration) -> HaResult<()> {
        self.state().reboots += 1;
        Ok(())
    }

    fn licensed(&self) -> bool {
        self.shelf.chassis(self.slot).licensed
    }
}

impl Updates for Controller {
    fn recreate_upload_area(&self) -> HaResult<PathBuf> {
        let dir = self.upload_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(HaError::platform)?;
        }
        fs::create_dir_all(&dir).map_err(HaError::platform)?;
        Ok(dir)
    }

    fn stage(&self, _train: Option<&str>) -> HaResult<StagedImage> {
        let path = self.recreate_upload_area()?.join("tandem.update");
        fs::write(&path, b"image").map_err(HaError::platform)?;
        Ok(StagedImage {
            path,
            version: self.shelf.chassis(self.slot).version,
        })
    }

    fn boot_environments(&self) -> HaResult<Vec<BootEnvironment>> {
        Ok(self.state().boot_environments.clone())
    }

    fn activate(&self, id: &str) -> HaResult<()> {
        for be in &mut self.state().boot_environments {
            be.activated = be.id == id;
        }
        Ok(())
    }

    fn start_update(&self, _image: &Path, name: &str) -> HaResult<JobId> {
        let mut state = self.state();
        for be in &mut state.boot_environments {
            be.activated = false;
        }
        state.boot_environments.push(BootEnvironment {
            id: name.to_string(),
            active: false,
            activated: true,
        });
        state.jobs.push(JobState::Success);
        Ok(JobId::new(state.jobs.len() as u64))
    }

    fn job_status(&self, job: JobId) -> HaResult<JobState> {
        let index = job.as_u64().checked_sub(1).map(|i| i as usize);
        index
            .and_then(|i| self.state().jobs.get(i).cloned())
            .ok_or_else(|| HaError::with_errno(Errno::Enoent, format!("no {job}")))
    }
}

impl Kmip for Controller {
    fn manages_zfs_keys(&self) -> bool {
        false
    }

    fn memory_keys(&self) -> Vec<KmipKey> {
        self.state().kmip_keys.clone()
    }

    fn update_memory_keys(&self, keys: Vec<KmipKey>) {
        self.state().kmip_keys = keys;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (tempfile::TempDir, Shelf, Arc<Controller>, Arc<Controller>) {
        let dir = tempfile::tempdir().unwrap();
        let shelf = Shelf::default();
        {
            let mut state = shelf.lock();
            state.running.insert(NodeSlot::A);
            state.running.insert(NodeSlot::B);
        }
        let a = Controller::new(NodeSlot::A, shelf.clone(), &dir.path().join("a"), 1);
        let b = Controller::new(NodeSlot::B, shelf.clone(), &dir.path().join("b"), 1);
        (dir, shelf, a, b)
    }

    #[test]
    fn test_fencing_blocks_while_peer_runs() {
        let (_dir, shelf, a, b) = pair();
        assert_eq!(a.start(false), fenced::OK);
        assert_eq!(a.start(false), fenced::ALREADY_RUNNING);
        assert_eq!(b.start(false), fenced::REMOTE_RUNNING);
        assert_eq!(b.start(true), fenced::OK);
        assert_eq!(shelf.lock().reservation, Some(NodeSlot::B));
    }

    #[test]
    fn test_crashed_holder_loses_reservation_claim() {
        let (_dir, shelf, a, b) = pair();
        a.start(false);
        a.import(POOL).unwrap();
        assert!(b.import(POOL).is_err());

        shelf.lock().running.remove(&NodeSlot::A);
        assert_eq!(b.start(false), fenced::OK);
        b.import(POOL).unwrap();
        assert!(b.configured()[0].imported);
        assert!(!a.configured()[0].imported);
    }

    #[test]
    fn test_export_only_releases_own_pool() {
        let (_dir, shelf, a, b) = pair();
        a.import(POOL).unwrap();
        b.export(POOL).unwrap();
        assert_eq!(shelf.lock().pool_owner, Some(NodeSlot::A));
        a.export(POOL).unwrap();
        assert_eq!(shelf.lock().pool_owner, None);
    }
}
