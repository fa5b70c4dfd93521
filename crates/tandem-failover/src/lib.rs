//! # tandem-failover: HA coordination for a pair of storage controllers
//!
//! One [`FailoverService`] runs on each controller. It decides the local
//! role, reacts to VRRP events, and keeps the standby a faithful copy of the
//! active controller:
//!
//! - **Role engine** ([`status`], [`reasons`]): MASTER/BACKUP/... from VRRP,
//!   pools and the peer, plus the reasons failover is currently unsafe
//! - **Transitions** ([`events`]): fencing, pool import, key unlock, VIP and
//!   target takeover on MASTER; the reverse on BACKUP
//! - **State sync** ([`database`], [`keys`]): whole-database pushes, replayed
//!   journal writes, and the in-memory encryption key cache
//! - **Services** ([`services`]): service actions mirrored to the standby
//! - **Upgrades** ([`upgrade`]): rolling upgrade of both boot environments
//!
//! The engine talks to the operating system only through the traits in
//! [`platform`], and to the peer only through [`tandem_peer::PeerClient`].

mod alerts;
mod bus;
mod database;
pub mod directory;
mod error;
pub mod events;
pub mod keys;
mod locks;
pub mod platform;
pub mod reasons;
pub mod rpc;
mod service;
pub mod services;
mod settings;
pub mod setup;
pub mod status;
mod transitions;
pub mod upgrade;

#[cfg(test)]
mod testing;

pub use alerts::{Alert, AlertRegistry};
pub use bus::{BusMessage, EventBus, FailoverEvent};
pub use database::sync_path;
pub use directory::{DirectoryKind, DirectoryServices, DomainJoiner};
pub use error::{HaError, HaResult};
pub use events::{EventHandler, EventOutcome, IgnoreReason, VrrpEvent};
pub use keys::{DatasetKey, KeyChange, KeyFormat};
pub use locks::{JobGuard, JobLocks};
pub use platform::Platform;
pub use reasons::{DiskMismatch, NicMismatch};
pub use rpc::{Dispatcher, PeerLink, PeerTargets};
pub use service::{FailoverService, FailoverSettings, RoleAdapter};
pub use services::{Forwarded, should_forward};
pub use setup::SetupOutcome;
pub use upgrade::UpgradeProgress;
