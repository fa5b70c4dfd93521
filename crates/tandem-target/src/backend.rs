//! Contracts with the kernel target stacks and with the peer node.
//!
//! Production implementations drive SCST and nvmet; tests use in-memory
//! fakes that record calls.

use crate::TargetResult;
use crate::endpoint::{PathState, TargetEndpoint};

// ============================================================================
// Local target stack
// ============================================================================

/// The iSCSI / NVMe-oF target stack on this node.
pub trait TargetBackend: Send + Sync {
    /// Reapplies the target configuration.
    fn reload(&self) -> TargetResult<()>;

    /// Sets the ALUA/ANA state of the local path.
    fn set_path_state(&self, endpoint: &TargetEndpoint, state: PathState) -> TargetResult<()>;

    /// Emits an ANA-change asynchronous event (or ALUA unit attention).
    fn notify_path_change(&self, endpoint: &TargetEndpoint) -> TargetResult<()>;

    /// Drops every initiator session on the endpoint.
    fn drop_sessions(&self, endpoint: &TargetEndpoint) -> TargetResult<()>;

    /// Starts exporting the endpoint on the virtual IP.
    fn advertise(&self, endpoint: &TargetEndpoint) -> TargetResult<()>;

    /// Stops exporting the endpoint on the virtual IP.
    fn withdraw(&self, endpoint: &TargetEndpoint) -> TargetResult<()>;

    /// Initiators currently logged in to the target.
    fn active_sessions(&self, name: &str) -> Vec<String>;

    /// Removes the target from the running stack (`scstadmin -rem_target`
    /// or the nvmet equivalent).
    fn remove_target(&self, name: &str) -> TargetResult<()>;

    /// True once no ALUA transition is pending.
    fn alua_settled(&self) -> bool;

    /// Whether the LUN with this NAA is exported.
    fn lun_present(&self, naa: &str) -> bool;
}

// ============================================================================
// Peer node
// ============================================================================

/// The target stack of the other controller.
pub trait TargetPeer: Send + Sync {
    /// Whether the peer is reachable right now.
    fn connected(&self) -> bool;

    fn reload(&self) -> TargetResult<()>;

    fn remove_target(&self, name: &str) -> TargetResult<()>;

    fn alua_settled(&self) -> TargetResult<bool>;

    fn lun_visible(&self, naa: &str) -> TargetResult<bool>;
}

/// Peer for appliances that are not paired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPeer;

impl TargetPeer for NoPeer {
    fn connected(&self) -> bool {
        false
    }

    fn reload(&self) -> TargetResult<()> {
        Ok(())
    }

    fn remove_target(&self, _name: &str) -> TargetResult<()> {
        Ok(())
    }

    fn alua_settled(&self) -> TargetResult<bool> {
        Ok(true)
    }

    fn lun_visible(&self, _naa: &str) -> TargetResult<bool> {
        Ok(false)
    }
}
