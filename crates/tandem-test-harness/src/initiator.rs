//! A block initiator attached to both controllers.
//!
//! ALUA/ANA endpoints are reached through multipath: I/O goes to whichever
//! controller reports the optimized path. VIP endpoints are reached through
//! the virtual IP only, so I/O goes to the controller that owns it.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tandem_target::{EndpointState, FailoverMode, LunIdentity, PathState};
use tandem_types::NodeSlot;

use crate::HaPair;

const POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    /// No controller serves the endpoint right now.
    #[error("no usable path to {0}")]
    NoPath(String),

    #[error("block {lba} of {name} was never written")]
    Unwritten { name: String, lba: u64 },
}

/// Path the initiator is currently using.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePath {
    pub slot: NodeSlot,
    pub state: EndpointState,
    pub identity: LunIdentity,
}

pub struct Initiator {
    name: String,
    pair: Arc<HaPair>,
}

impl Initiator {
    pub fn new(pair: Arc<HaPair>) -> Self {
        Self {
            name: "iqn.2005-10.org.freenas.ctl:initiator0".to_string(),
            pair,
        }
    }

    /// Finds the controller that can complete I/O for `endpoint`.
    pub fn path(&self, endpoint: &str) -> Result<ActivePath, IoError> {
        let shelf = self.pair.shelf();
        let vip_owner = shelf.lock().vip_owner;
        for slot in [NodeSlot::A, NodeSlot::B] {
            let Some(node) = self.pair.node(slot) else {
                continue;
            };
            let Some((target, state)) = node
                .service
                .targets()
                .snapshot()
                .into_iter()
                .find(|(t, _)| t.name == endpoint)
            else {
                continue;
            };
            let reachable = match target.mode {
                FailoverMode::AluaAna => state == EndpointState::Path(PathState::Optimized),
                FailoverMode::Vip => vip_owner == Some(slot) && state == EndpointState::Advertised,
            };
            if reachable && shelf.serves_pool(slot) {
                node.targets.login(endpoint, &self.name);
                return Ok(ActivePath {
                    slot,
                    state,
                    identity: target.identity,
                });
            }
        }
        Err(IoError::NoPath(endpoint.to_string()))
    }

    /// Identity the initiator sees for `endpoint` on the serving controller.
    pub fn identity(&self, endpoint: &str) -> Result<LunIdentity, IoError> {
        self.path(endpoint).map(|p| p.identity)
    }

    pub fn write(&self, endpoint: &str, lba: u64, data: &[u8]) -> Result<NodeSlot, IoError> {
        let path = self.path(endpoint)?;
        self.pair
            .shelf()
            .lock()
            .blocks
            .insert((path.identity.naa, lba), data.to_vec());
        Ok(path.slot)
    }

    pub fn read(&self, endpoint: &str, lba: u64) -> Result<Vec<u8>, IoError> {
        let path = self.path(endpoint)?;
        self.pair
            .shelf()
            .lock()
            .blocks
            .get(&(path.identity.naa, lba))
            .cloned()
            .ok_or_else(|| IoError::Unwritten {
                name: endpoint.to_string(),
                lba,
            })
    }

    /// Polls until `endpoint` accepts I/O, returning how long that took.
    pub fn wait_for_io(&self, endpoint: &str, timeout: Duration) -> Option<Duration> {
        let start = Instant::now();
        loop {
            if self.path(endpoint).is_ok() {
                return Some(start.elapsed());
            }
            if start.elapsed() >= timeout {
                return None;
            }
            thread::sleep(POLL);
        }
    }
}
