//! Hardware shared by both controllers.
//!
//! The shelf outlives the middleware on either controller: pool ownership,
//! disk reservations, the virtual IP and the block contents survive a crash
//! or restart of a node, the same way they survive a `tandemd` restart on
//! real hardware.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tandem_target::TargetEndpoint;
use tandem_types::{NodeSlot, VrrpState};

/// Name of the only data pool on the shelf.
pub const POOL: &str = "tank";
pub const POOL_GUID: &str = "9313851373452190611";
/// The failover interface on both controllers.
pub const FAILOVER_IFACE: &str = "eth0";
pub const VIP: &str = "10.0.0.100";
pub const SOFTWARE_VERSION: &str = "25.10.0";

/// Per-slot hardware and keepalived state.
#[derive(Debug, Clone)]
pub struct Chassis {
    pub vrrp: VrrpState,
    pub critical: bool,
    pub virtual_aliases: Vec<String>,
    pub licensed: bool,
    pub disk_serials: Vec<String>,
    pub version: String,
}

impl Default for Chassis {
    fn default() -> Self {
        Self {
            vrrp: VrrpState::Backup,
            critical: true,
            virtual_aliases: vec![VIP.to_string()],
            licensed: true,
            disk_serials: vec!["ZL2K4A1B".into(), "ZL2K4A2C".into(), "ZL2K4A3D".into()],
            version: SOFTWARE_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ShelfState {
    /// Controller the pool is imported on.
    pub pool_owner: Option<NodeSlot>,
    /// Controller holding the SCSI reservations.
    pub reservation: Option<NodeSlot>,
    /// Controller answering on the virtual IP.
    pub vip_owner: Option<NodeSlot>,
    /// Controllers whose middleware is running.
    pub running: BTreeSet<NodeSlot>,
    pub chassis: BTreeMap<NodeSlot, Chassis>,
    /// Exported endpoints by name, as in the replicated target configuration.
    pub catalog: BTreeMap<String, TargetEndpoint>,
    /// Block contents keyed by (NAA, LBA).
    pub blocks: BTreeMap<(String, u64), Vec<u8>>,
}

/// Cheap handle to the shared shelf.
#[derive(Debug, Clone)]
pub struct Shelf(Arc<Mutex<ShelfState>>);

impl Default for Shelf {
    fn default() -> Self {
        let mut state = ShelfState::default();
        state.chassis.insert(NodeSlot::A, Chassis::default());
        state.chassis.insert(NodeSlot::B, Chassis::default());
        Self(Arc::new(Mutex::new(state)))
    }
}

impl Shelf {
    pub fn lock(&self) -> MutexGuard<'_, ShelfState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn chassis(&self, slot: NodeSlot) -> Chassis {
        self.lock().chassis.get(&slot).cloned().unwrap_or_default()
    }

    /// Edits the hardware of one controller.
    pub fn update_chassis(&self, slot: NodeSlot, edit: impl FnOnce(&mut Chassis)) {
        edit(self.lock().chassis.entry(slot).or_default());
    }

    pub fn running(&self, slot: NodeSlot) -> bool {
        self.lock().running.contains(&slot)
    }

    /// Whether `slot` runs and has the pool imported.
    pub fn serves_pool(&self, slot: NodeSlot) -> bool {
        let state = self.lock();
        state.running.contains(&slot) && state.pool_owner == Some(slot)
    }
}

impl ShelfState {
    /// Owner that still runs, other than `slot`.
    pub fn live_other(&self, owner: Option<NodeSlot>, slot: NodeSlot) -> Option<NodeSlot> {
        owner.filter(|o| *o != slot && self.running.contains(o))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crashed_owner_is_not_live() {
        let shelf = Shelf::default();
        let mut state = shelf.lock();
        state.pool_owner = Some(NodeSlot::A);
        state.running.insert(NodeSlot::A);
        assert_eq!(state.live_other(state.pool_owner, NodeSlot::B), Some(NodeSlot::A));
        assert_eq!(state.live_other(state.pool_owner, NodeSlot::A), None);
        state.running.remove(&NodeSlot::A);
        assert_eq!(state.live_other(state.pool_owner, NodeSlot::B), None);
    }

    #[test]
    fn test_chassis_edits_persist() {
        let shelf = Shelf::default();
        shelf.update_chassis(NodeSlot::B, |c| c.licensed = false);
        assert!(!shelf.chassis(NodeSlot::B).licensed);
        assert!(shelf.chassis(NodeSlot::A).licensed);
    }
}
