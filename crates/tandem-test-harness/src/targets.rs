//! In-memory target stack of one controller.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tandem_target::{
    FailoverMode, LunIdentity, PathState, Protocol, TargetBackend, TargetEndpoint, TargetResult,
};

use crate::shelf::Shelf;

/// Namespace `nsid` of NVMe-oF subsystem `subsystem`.
pub fn nvme_namespace(subsystem: u32, nsid: u32, mode: FailoverMode) -> TargetEndpoint {
    TargetEndpoint {
        name: format!("subsys{subsystem}-ns{nsid}"),
        protocol: Protocol::NvmeOf,
        identity: LunIdentity {
            naa: format!("naa.6589cfc0{subsystem:08x}{nsid:08x}"),
            nguid: format!("{subsystem:016x}{nsid:016x}"),
            serial: format!("TND{subsystem:05}N{nsid:04}"),
            portal: format!("nqn.2011-06.com.tandem:subsys{subsystem}"),
        },
        backing_path: PathBuf::from(format!("/dev/zvol/tank/subsys{subsystem}/ns{nsid}")),
        lun: nsid,
        mode,
    }
}

/// LUN `lun` of iSCSI target `target`.
pub fn iscsi_lun(target: u32, lun: u32, mode: FailoverMode) -> TargetEndpoint {
    TargetEndpoint {
        name: format!("target{target}-lun{lun}"),
        protocol: Protocol::Iscsi,
        identity: LunIdentity {
            naa: format!("naa.6589cfc1{target:08x}{lun:08x}"),
            nguid: format!("{:016x}{lun:016x}", u64::from(target) | (1 << 63)),
            serial: format!("TND{target:05}L{lun:04}"),
            portal: format!("iqn.2005-10.com.tandem.ctl:target{target}"),
        },
        backing_path: PathBuf::from(format!("/dev/zvol/tank/target{target}/lun{lun}")),
        lun,
        mode,
    }
}

#[derive(Debug, Default)]
pub struct StackState {
    /// NAAs loaded by the last reload.
    pub loaded: BTreeSet<String>,
    pub path_states: BTreeMap<String, PathState>,
    pub advertised: BTreeSet<String>,
    /// Initiator sessions by endpoint name.
    pub sessions: BTreeMap<String, Vec<String>>,
    /// Path-change notifications sent, by endpoint name.
    pub notifications: BTreeMap<String, u32>,
    pub removed: Vec<String>,
}

pub struct MemoryTargets {
    shelf: Shelf,
    state: Mutex<StackState>,
}

impl MemoryTargets {
    pub fn new(shelf: Shelf) -> Self {
        Self {
            shelf,
            state: Mutex::new(StackState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Logs an initiator in to `name`.
    pub fn login(&self, name: &str, initiator: &str) {
        let mut state = self.state();
        let sessions = state.sessions.entry(name.to_string()).or_default();
        if !sessions.iter().any(|s| s == initiator) {
            sessions.push(initiator.to_string());
        }
    }

    pub fn notifications(&self, name: &str) -> u32 {
        self.state().notifications.get(name).copied().unwrap_or(0)
    }
}

impl TargetBackend for MemoryTargets {
    fn reload(&self) -> TargetResult<()> {
        let loaded = self
            .shelf
            .lock()
            .catalog
            .values()
            .map(|e| e.identity.naa.clone())
            .collect();
        self.state().loaded = loaded;
        Ok(())
    }

    fn set_path_state(&self, endpoint: &TargetEndpoint, state: PathState) -> TargetResult<()> {
        self.state()
            .path_states
            .insert(endpoint.name.clone(), state);
        Ok(())
    }

    fn notify_path_change(&self, endpoint: &TargetEndpoint) -> TargetResult<()> {
        *self
            .state()
            .notifications
            .entry(endpoint.name.clone())
            .or_default() += 1;
        Ok(())
    }

    fn drop_sessions(&self, endpoint: &TargetEndpoint) -> TargetResult<()> {
        self.state().sessions.remove(&endpoint.name);
        Ok(())
    }

    fn advertise(&self, endpoint: &TargetEndpoint) -> TargetResult<()> {
        self.state().advertised.insert(endpoint.name.clone());
        Ok(())
    }

    fn withdraw(&self, endpoint: &TargetEndpoint) -> TargetResult<()> {
        self.state().advertised.remove(&endpoint.name);
        Ok(())
    }

    fn active_sessions(&self, name: &str) -> Vec<String> {
        self.state().sessions.get(name).cloned().unwrap_or_default()
    }

    fn remove_target(&self, name: &str) -> TargetResult<()> {
        let mut state = self.state();
        state.path_states.remove(name);
        state.advertised.remove(name);
        state.sessions.remove(name);
        state.removed.push(name.to_string());
        Ok(())
    }

    fn alua_settled(&self) -> bool {
        true
    }

    fn lun_present(&self, naa: &str) -> bool {
        self.state().loaded.contains(naa)
    }
}
