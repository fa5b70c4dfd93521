//! In-memory collaborators for the unit tests of this crate.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tandem_peer::{PeerClient, PeerError, PeerResult, PeerTransport, Reply, Request};
use tandem_target::{
    NoPeer, PathState, TargetBackend, TargetEndpoint, TargetFailoverEngine, TargetResult,
    TargetSettings,
};
use tandem_types::{
    BootEnvironment, Errno, HaConfig, InterfaceInfo, JobId, JobState, KmipKey, NodeIdentity,
    NodeSlot, PoolInfo, ServiceVerb, SqlParam, VrrpState,
};
use tempfile::TempDir;

use crate::alerts::AlertRegistry;
use crate::platform::{
    Datastore, Disks, FailoverPhase, Fencing, Kmip, Network, PhaseMarker, Platform, Pools,
    Services, SettingsStore, StagedImage, System, Updates, fenced,
};
use crate::service::{FailoverService, FailoverSettings};
use crate::{HaError, HaResult};

// ============================================================================
// Fake node
// ============================================================================

pub(crate) struct NodeState {
    pub pools: Vec<PoolInfo>,
    pub interfaces: Vec<InterfaceInfo>,
    pub serials: Vec<String>,
    pub fence_codes: VecDeque<i32>,
    pub log: Vec<String>,
    pub vips: bool,
    pub traffic: bool,
    pub phase: Option<FailoverPhase>,
    pub enabled: BTreeSet<String>,
    pub started: BTreeSet<String>,
    pub version: String,
    pub boot_id: String,
    pub ready: bool,
    pub licensed: bool,
    pub config: HaConfig,
    pub flags: BTreeMap<String, bool>,
    pub executed: Vec<String>,
    pub installed: Vec<PathBuf>,
    pub kmip_enabled: bool,
    pub kmip_keys: Vec<KmipKey>,
    pub boot_environments: Vec<BootEnvironment>,
    pub jobs: Vec<JobState>,
    pub fail_import: BTreeSet<String>,
    pub db_path: PathBuf,
    pub upload_dir: PathBuf,
}

pub(crate) struct FakeNode {
    state: Mutex<NodeState>,
}

impl FakeNode {
    /// A licensed, paired node with one pool and one critical VRRP interface.
    pub fn paired(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NodeState {
                pools: vec![pool("tank", false)],
                interfaces: vec![interface("eth0", Some(VrrpState::Backup))],
                serials: vec!["S1".into(), "S2".into()],
                fence_codes: VecDeque::new(),
                log: Vec::new(),
                vips: false,
                traffic: false,
                phase: None,
                enabled: BTreeSet::new(),
                started: BTreeSet::new(),
                version: "25.04.0".into(),
                boot_id: "boot-1".into(),
                ready: true,
                licensed: true,
                config: HaConfig::default(),
                flags: BTreeMap::new(),
                executed: Vec::new(),
                installed: Vec::new(),
                kmip_enabled: false,
                kmip_keys: Vec::new(),
                boot_environments: Vec::new(),
                jobs: Vec::new(),
                fail_import: BTreeSet::new(),
                db_path: dir.join("tandem.db"),
                upload_dir: dir.join("upload"),
            }),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    fn record(&self, entry: String) {
        self.state().log.push(entry);
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

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
            settings: self.clone(),
            datastore: self.clone(),
            kmip: self.clone(),
        }
    }
}

pub(crate) fn pool(name: &str, imported: bool) -> PoolInfo {
    PoolInfo {
        name: name.into(),
        guid: format!("{name}-guid"),
        imported,
    }
}

pub(crate) fn interface(name: &str, vrrp: Option<VrrpState>) -> InterfaceInfo {
    InterfaceInfo {
        name: name.into(),
        critical: true,
        virtual_aliases: vec!["10.0.0.100".into()],
        vrrp,
        internal: false,
    }
}

impl Pools for FakeNode {
    fn configured(&self) -> Vec<PoolInfo> {
        self.state().pools.clone()
    }

    fn import(&self, name: &str) -> HaResult<()> {
        self.record(format!("import {name}"));
        let mut state = self.state();
        if state.fail_import.contains(name) {
            return Err(HaError::platform(format!("cannot import {name}")));
        }
        for pool in state.pools.iter_mut().filter(|p| p.name == name) {
            pool.imported = true;
        }
        Ok(())
    }

    fn export(&self, name: &str) -> HaResult<()> {
        self.record(format!("export {name}"));
        for pool in self.state().pools.iter_mut().filter(|p| p.name == name) {
            pool.imported = false;
        }
        Ok(())
    }

    fn unlock(&self, pool: &str, keys: &[tandem_types::KeyEntry]) -> HaResult<()> {
        self.record(format!("unlock {pool} {}", keys.len()));
        Ok(())
    }
}

impl Disks for FakeNode {
    fn data_disk_serials(&self) -> HaResult<Vec<String>> {
        Ok(self.state().serials.clone())
    }
}

impl Fencing for FakeNode {
    fn stop(&self) {
        self.record("fenced stop".into());
    }

    fn start(&self, force: bool) -> i32 {
        self.record(format!("fenced start force={force}"));
        self.state().fence_codes.pop_front().unwrap_or(fenced::OK)
    }
}

impl Network for FakeNode {
    fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.state().interfaces.clone()
    }

    fn set_vips(&self, owned: bool) -> HaResult<()> {
        self.record(format!("vips {owned}"));
        self.state().vips = owned;
        Ok(())
    }

    fn set_traffic(&self, allow: bool) -> HaResult<()> {
        self.record(format!("traffic {allow}"));
        self.state().traffic = allow;
        Ok(())
    }

    fn sync(&self) -> HaResult<()> {
        self.record("interface sync".into());
        Ok(())
    }
}

impl PhaseMarker for FakeNode {
    fn phase(&self) -> Option<FailoverPhase> {
        self.state().phase
    }

    fn set_phase(&self, phase: Option<FailoverPhase>) {
        self.state().phase = phase;
    }
}

impl Services for FakeNode {
    fn control(&self, verb: ServiceVerb, service: &str) -> HaResult<()> {
        self.record(format!("{verb} {service}"));
        let mut state = self.state();
        match verb {
            ServiceVerb::Stop => {
                state.started.remove(service);
            }
            _ => {
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
        self.record(format!("become_active {service}"));
        Ok(())
    }
}

impl System for FakeNode {
    fn version(&self) -> String {
        self.state().version.clone()
    }

    fn boot_id(&self) -> String {
        self.state().boot_id.clone()
    }

    fn ready(&self) -> bool {
        self.state().ready
    }

    fn reboot(&self, delay: Duration) -> HaResult<()> {
        self.record(format!("reboot {}", delay.as_secs()));
        Ok(())
    }

    fn licensed(&self) -> bool {
        self.state().licensed
    }
}

impl Updates for FakeNode {
    fn recreate_upload_area(&self) -> HaResult<PathBuf> {
        let dir = self.state().upload_dir.clone();
        std::fs::create_dir_all(&dir).map_err(HaError::platform)?;
        Ok(dir)
    }

    fn stage(&self, _train: Option<&str>) -> HaResult<StagedImage> {
        let dir = self.recreate_upload_area()?;
        let path = dir.join("update.sqsh");
        std::fs::write(&path, b"image").map_err(HaError::platform)?;
        Ok(StagedImage {
            path,
            version: "25.10.0".into(),
        })
    }

    fn boot_environments(&self) -> HaResult<Vec<BootEnvironment>> {
        Ok(self.state().boot_environments.clone())
    }

    fn activate(&self, id: &str) -> HaResult<()> {
        self.record(format!("activate {id}"));
        for be in &mut self.state().boot_environments {
            be.activated = be.id == id;
        }
        Ok(())
    }

    fn start_update(&self, image: &Path, name: &str) -> HaResult<JobId> {
        self.record(format!("update {} {name}", image.display()));
        let mut state = self.state();
        state.boot_environments.push(BootEnvironment {
            id: name.to_string(),
            active: false,
            activated: true,
        });
        state.jobs.push(JobState::Success);
        Ok(JobId::new(state.jobs.len() as u64))
    }

    fn job_status(&self, job: JobId) -> HaResult<JobState> {
        let state = self.state();
        state
            .jobs
            .get(job.as_u64() as usize - 1)
            .cloned()
            .ok_or_else(|| HaError::with_errno(Errno::Enoent, format!("no {job}")))
    }
}

impl SettingsStore for FakeNode {
    fn ha_config(&self) -> HaResult<HaConfig> {
        Ok(self.state().config)
    }

    fn save_ha_config(&self, config: &HaConfig) -> HaResult<()> {
        self.state().config = *config;
        Ok(())
    }

    fn flag(&self, key: &str) -> bool {
        self.state().flags.get(key).copied().unwrap_or(false)
    }

    fn set_flag(&self, key: &str, value: bool) -> HaResult<()> {
        self.state().flags.insert(key.to_string(), value);
        Ok(())
    }
}

impl Datastore for FakeNode {
    fn path(&self) -> PathBuf {
        self.state().db_path.clone()
    }

    fn execute(&self, sql: &str, _params: &[SqlParam]) -> HaResult<()> {
        self.state().executed.push(sql.to_string());
        Ok(())
    }

    fn install(&self, replacement: &Path) -> HaResult<()> {
        self.state().installed.push(replacement.to_path_buf());
        Ok(())
    }
}

impl Kmip for FakeNode {
    fn manages_zfs_keys(&self) -> bool {
        self.state().kmip_enabled
    }

    fn memory_keys(&self) -> Vec<KmipKey> {
        self.state().kmip_keys.clone()
    }

    fn update_memory_keys(&self, keys: Vec<KmipKey>) {
        self.state().kmip_keys = keys;
    }
}

// ============================================================================
// Scripted peer
// ============================================================================

type Script = dyn Fn(&Request) -> PeerResult<Reply> + Send + Sync;

/// Answers interlink calls from a closure and records them.
pub(crate) struct ScriptedPeer {
    script: Box<Script>,
    calls: Mutex<Vec<Request>>,
}

impl ScriptedPeer {
    pub fn new(script: impl Fn(&Request) -> PeerResult<Reply> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// A peer that never answers.
    pub fn down() -> Arc<Self> {
        Self::new(|_| {
            Err(PeerError::Unreachable {
                errno: Errno::Ehostdown,
                reason: "test".into(),
            })
        })
    }

    pub fn calls(&self) -> Vec<Request> {
        self.calls.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.calls().iter().map(Request::method).collect()
    }
}

impl PeerTransport for ScriptedPeer {
    fn call(&self, request: Request, _timeout: Duration) -> PeerResult<Reply> {
        let reply = (self.script)(&request);
        self.calls.lock().unwrap().push(request);
        reply
    }
}

/// Replies of a healthy BACKUP peer.
pub(crate) fn healthy_backup(request: &Request) -> PeerResult<Reply> {
    Ok(match request {
        Request::Ping => Reply::Text("pong".into()),
        Request::SystemReady | Request::Licensed => Reply::Bool(true),
        Request::Status => Reply::Status(tandem_types::HaStatus::Backup),
        Request::ImportedPools => Reply::Pools(Vec::new()),
        Request::Interfaces => Reply::Interfaces(vec![interface("eth0", Some(VrrpState::Backup))]),
        Request::DataDiskSerials => Reply::Names(vec!["S1".into(), "S2".into()]),
        Request::SystemVersion => Reply::Text("25.04.0".into()),
        _ => Reply::Unit,
    })
}

// ============================================================================
// Fixture
// ============================================================================

#[derive(Default)]
struct IdleStack;

impl TargetBackend for IdleStack {
    fn reload(&self) -> TargetResult<()> {
        Ok(())
    }
    fn set_path_state(&self, _endpoint: &TargetEndpoint, _state: PathState) -> TargetResult<()> {
        Ok(())
    }
    fn notify_path_change(&self, _endpoint: &TargetEndpoint) -> TargetResult<()> {
        Ok(())
    }
    fn drop_sessions(&self, _endpoint: &TargetEndpoint) -> TargetResult<()> {
        Ok(())
    }
    fn advertise(&self, _endpoint: &TargetEndpoint) -> TargetResult<()> {
        Ok(())
    }
    fn withdraw(&self, _endpoint: &TargetEndpoint) -> TargetResult<()> {
        Ok(())
    }
    fn active_sessions(&self, _name: &str) -> Vec<String> {
        Vec::new()
    }
    fn remove_target(&self, _name: &str) -> TargetResult<()> {
        Ok(())
    }
    fn alua_settled(&self) -> bool {
        true
    }
    fn lun_present(&self, _naa: &str) -> bool {
        false
    }
}

pub(crate) struct Fixture {
    pub dir: TempDir,
    pub node: Arc<FakeNode>,
    pub peer: Arc<ScriptedPeer>,
    pub service: Arc<FailoverService>,
}

pub(crate) fn fast_settings(dir: &Path) -> FailoverSettings {
    FailoverSettings {
        fence_retry_interval: Duration::from_millis(1),
        shutdown_wait: Duration::from_millis(50),
        boot_wait: Duration::from_millis(50),
        upgrade_poll: Duration::from_millis(1),
        license_path: dir.join("license"),
        pwenc_secret_path: dir.join("pwenc_secret"),
        authorized_keys_paths: vec![dir.join("authorized_keys")],
        watermark_path: dir.join("ha-replay.toml"),
        ..FailoverSettings::default()
    }
}

pub(crate) fn fixture(peer: Arc<ScriptedPeer>) -> Fixture {
    fixture_with(NodeSlot::A, peer)
}

pub(crate) fn fixture_with(slot: NodeSlot, peer: Arc<ScriptedPeer>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let node = FakeNode::paired(dir.path());
    let targets = Arc::new(TargetFailoverEngine::new(
        TargetSettings::default(),
        Arc::new(IdleStack),
        Arc::new(NoPeer),
    ));
    let service = FailoverService::new(
        NodeIdentity::new(slot, true),
        fast_settings(dir.path()),
        node.platform(),
        PeerClient::new(peer.clone(), Duration::from_secs(1)),
        targets,
        Arc::new(AlertRegistry::new()),
    );
    Fixture {
        dir,
        node,
        peer,
        service,
    }
}

impl Fixture {
    /// Makes the local node look like the elected MASTER.
    pub fn make_master(&self) {
        let mut state = self.node.state();
        state.interfaces = vec![interface("eth0", Some(VrrpState::Master))];
        for pool in &mut state.pools {
            pool.imported = true;
        }
        drop(state);
        self.service.status_refresh();
    }
}
