//! Exported endpoints and their per-node path state.

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{TargetError, TargetResult};

/// Block-storage protocol an endpoint is exported over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Iscsi,
    NvmeOf,
}

/// How initiators are moved to the new MASTER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailoverMode {
    /// Both nodes export the endpoint; path state steers I/O.
    AluaAna,
    /// Only the MASTER exports the endpoint, on the virtual IP.
    Vip,
}

/// ALUA (iSCSI) or ANA (NVMe-oF) access state of one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathState {
    Optimized,
    NonOptimized,
    Inaccessible,
}

/// State of an endpoint on the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointState {
    Path(PathState),
    Advertised,
    NotAdvertised,
}

impl EndpointState {
    /// Whether initiators can do I/O through this node.
    pub fn serves_io(self) -> bool {
        matches!(
            self,
            EndpointState::Path(PathState::Optimized | PathState::NonOptimized)
                | EndpointState::Advertised
        )
    }
}

impl Display for EndpointState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointState::Path(PathState::Optimized) => f.write_str("OPTIMIZED"),
            EndpointState::Path(PathState::NonOptimized) => f.write_str("NON_OPTIMIZED"),
            EndpointState::Path(PathState::Inaccessible) => f.write_str("INACCESSIBLE"),
            EndpointState::Advertised => f.write_str("advertised"),
            EndpointState::NotAdvertised => f.write_str("not_advertised"),
        }
    }
}

/// Identifiers initiators use to recognise a LUN or namespace.
///
/// Identical on both nodes and never changed by a role transition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LunIdentity {
    pub naa: String,
    pub nguid: String,
    pub serial: String,
    /// Target IQN or subsystem NQN.
    pub portal: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetEndpoint {
    pub name: String,
    pub protocol: Protocol,
    pub identity: LunIdentity,
    /// Backing zvol or file.
    pub backing_path: PathBuf,
    /// LUN number (iSCSI) or NSID (NVMe-oF).
    pub lun: u32,
    pub mode: FailoverMode,
}

impl TargetEndpoint {
    /// State this endpoint takes on the MASTER.
    pub fn active_state(&self) -> EndpointState {
        match self.mode {
            FailoverMode::AluaAna => EndpointState::Path(PathState::Optimized),
            FailoverMode::Vip => EndpointState::Advertised,
        }
    }

    /// State this endpoint takes on the standby.
    ///
    /// iSCSI keeps a non-optimized path open; NVMe-oF reports the namespace
    /// inaccessible through the standby.
    pub fn standby_state(&self) -> EndpointState {
        match (self.mode, self.protocol) {
            (FailoverMode::AluaAna, Protocol::Iscsi) => EndpointState::Path(PathState::NonOptimized),
            (FailoverMode::AluaAna, Protocol::NvmeOf) => {
                EndpointState::Path(PathState::Inaccessible)
            }
            (FailoverMode::Vip, _) => EndpointState::NotAdvertised,
        }
    }
}

/// Endpoints known to this node with their current local state.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    endpoints: BTreeMap<String, (TargetEndpoint, EndpointState)>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint in `state`.
    ///
    /// Rejects duplicate names and identifiers already used by another endpoint.
    pub fn insert(&mut self, endpoint: TargetEndpoint, state: EndpointState) -> TargetResult<()> {
        if self.endpoints.contains_key(&endpoint.name) {
            return Err(TargetError::AlreadyExists(endpoint.name));
        }
        let clash = self.endpoints.values().find(|(other, _)| {
            other.identity.naa == endpoint.identity.naa
                || other.identity.nguid == endpoint.identity.nguid
                || (other.identity.portal == endpoint.identity.portal && other.lun == endpoint.lun)
        });
        if let Some((other, _)) = clash {
            return Err(TargetError::IdentityConflict {
                name: endpoint.name,
                existing: other.name.clone(),
            });
        }
        self.endpoints
            .insert(endpoint.name.clone(), (endpoint, state));
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> TargetResult<TargetEndpoint> {
        self.endpoints
            .remove(name)
            .map(|(endpoint, _)| endpoint)
            .ok_or_else(|| TargetError::NotFound(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&TargetEndpoint> {
        self.endpoints.get(name).map(|(endpoint, _)| endpoint)
    }

    pub fn state(&self, name: &str) -> Option<EndpointState> {
        self.endpoints.get(name).map(|(_, state)| *state)
    }

    pub fn set_state(&mut self, name: &str, state: EndpointState) -> TargetResult<()> {
        let slot = self
            .endpoints
            .get_mut(name)
            .ok_or_else(|| TargetError::NotFound(name.to_string()))?;
        slot.1 = state;
        Ok(())
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &TargetEndpoint> {
        self.endpoints.values().map(|(endpoint, _)| endpoint)
    }

    pub fn states(&self) -> impl Iterator<Item = (&str, EndpointState)> {
        self.endpoints
            .iter()
            .map(|(name, (_, state))| (name.as_str(), *state))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// True when any endpoint relies on ALUA/ANA path states.
    pub fn uses_alua(&self) -> bool {
        self.endpoints()
            .any(|endpoint| endpoint.mode == FailoverMode::AluaAna)
    }
}
