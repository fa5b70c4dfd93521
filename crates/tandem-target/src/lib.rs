//! # tandem-target: iSCSI / NVMe-oF takeover
//!
//! Each exported LUN or namespace is a [`TargetEndpoint`] with a stable
//! [`LunIdentity`] and a per-endpoint [`FailoverMode`]:
//!
//! - `AluaAna`: both nodes export it; the MASTER path is OPTIMIZED
//! - `Vip`: only the MASTER exports it, on the virtual IP
//!
//! [`TargetFailoverEngine`] moves every endpoint on a role change and keeps
//! target setup consistent across the pair.

use std::time::Duration;

mod backend;
mod endpoint;
mod engine;

pub use backend::{NoPeer, TargetBackend, TargetPeer};
pub use endpoint::{
    EndpointState, FailoverMode, LunIdentity, PathState, Protocol, TargetEndpoint, TargetRegistry,
};
pub use engine::{Rediscovery, TargetFailoverEngine, TargetSettings, TransitionReport};

pub type TargetResult<T> = Result<T, TargetError>;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("target {0} not found")]
    NotFound(String),

    #[error("target {0} already exists")]
    AlreadyExists(String),

    #[error("target {name} reuses an identifier of {existing}")]
    IdentityConflict { name: String, existing: String },

    #[error("target {name} has {sessions} active session(s); use force to remove it")]
    InUse { name: String, sessions: usize },

    #[error("timed out after {waited:?} waiting for {what}")]
    Timeout { what: String, waited: Duration },

    #[error("target stack: {0}")]
    Backend(String),

    #[error("peer: {0}")]
    Peer(String),
}
