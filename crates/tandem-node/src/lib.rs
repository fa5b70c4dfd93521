//! Production platform of a Tandem storage controller.
//!
//! Implements the collaborator traits of `tandem-failover` and
//! `tandem-target` on top of the system tools:
//!
//! - [`store`]: the SQLite configuration database, journaled to the peer
//! - [`system`]: ZFS pools, fencing, keepalived, systemd and updates
//! - [`targets`]: SCST and nvmet
//! - [`daemon`]: wiring for `tandemd serve`

pub mod command;
pub mod daemon;
pub mod store;
pub mod system;
pub mod targets;
