//! MASTER and BACKUP transitions.

use std::sync::atomic::Ordering;
use std::thread;

use tandem_types::{HaStatus, ServiceVerb};
use tracing::{error, info, warn};

use crate::bus::FailoverEvent;
use crate::events::{EventOutcome, VrrpEvent};
use crate::platform::{FailoverPhase, fenced};
use crate::service::FailoverService;
use crate::{HaError, HaResult};

/// Services restarted on the new MASTER, in order. Services that keep
/// standby state are promoted instead of restarted.
const CRITICAL_SERVICES: [(&str, bool); 4] = [
    ("iscsitarget", true),
    ("nvmet", true),
    ("cifs", false),
    ("nfs", false),
];

impl FailoverService {
    /// `failover.force_master`
    ///
    /// Returns false if this node already is MASTER, or already took over
    /// alone. A takeover while the peer does not answer leaves the node
    /// SINGLE until the peer is back.
    pub fn force_master(&self) -> HaResult<bool> {
        if self.current_status() == HaStatus::Master || self.forced_alone.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let critical = self
            .platform
            .network
            .interfaces()
            .into_iter()
            .find(|i| i.critical);
        let taken = match critical {
            Some(iface) => {
                self.handle_event(&iface.name, VrrpEvent::ForceTakeover)?;
                true
            }
            None => {
                let code = self.start_fencing(true);
                code == fenced::OK || code == fenced::ALREADY_RUNNING
            }
        };
        if taken && !self.peer_answers() {
            warn!("forced takeover with the peer unreachable, running SINGLE");
            self.forced_alone.store(true, Ordering::SeqCst);
            self.status_refresh();
        }
        Ok(taken)
    }

    // ========================================================================
    // Peer reachability
    // ========================================================================

    /// Pings the peer and reacts to it appearing or disappearing. Called
    /// periodically by the daemon. Returns whether the peer answered.
    pub fn watch_peer(&self) -> bool {
        let up = self.peer_answers();
        let was_up = self.peer_seen.swap(up, Ordering::SeqCst);
        if up && !was_up {
            self.on_peer_connected();
        } else if !up && was_up {
            info!("peer stopped answering");
            self.status_refresh();
        }
        up
    }

    /// The peer (re)connected. A MASTER pushes its key cache, and also the
    /// whole database if it ran alone meanwhile, since writes made as
    /// SINGLE were never journaled.
    pub fn on_peer_connected(&self) {
        let was_alone = self.forced_alone.load(Ordering::SeqCst);
        self.status_refresh();
        if self.current_status() != HaStatus::Master {
            return;
        }
        info!(was_alone, "peer connected, syncing the standby");
        if was_alone
            && let Err(e) = self.send_database()
        {
            error!(error = %e, "failed to push the database to the returning peer");
        }
        self.sync_keys_to_remote_node();
    }

    /// Starts fencing, retrying while the peer still holds its reservations.
    pub(crate) fn start_fencing(&self, force: bool) -> i32 {
        let mut attempt = 1;
        loop {
            let code = self.platform.fencing.start(force);
            if code != fenced::REMOTE_RUNNING || attempt >= self.settings.fence_attempts {
                return code;
            }
            warn!(attempt, "fenced is running on the remote node, retrying");
            thread::sleep(self.settings.fence_retry_interval);
            attempt += 1;
        }
    }

    pub(crate) fn vrrp_master(&self, interface: &str, force: bool) -> HaResult<EventOutcome> {
        let from = self.last_status().unwrap_or(HaStatus::Unknown);
        let phase = &self.platform.phase;
        phase.set_phase(Some(FailoverPhase::Electing));

        if force {
            warn!(interface, "forcing takeover");
            self.platform.fencing.stop();
        } else {
            warn!(interface, "entering MASTER");
        }
        let code = self.start_fencing(force);
        if code != fenced::OK && code != fenced::ALREADY_RUNNING {
            phase.set_phase(Some(FailoverPhase::Failed));
            error!(code, reason = fenced::describe(code), "fencing failed, aborting takeover");
            return Err(HaError::Fencing(format!(
                "{} (exit code {code})",
                fenced::describe(code)
            )));
        }

        phase.set_phase(Some(FailoverPhase::Importing));
        let pools = self.platform.pools.configured();
        let mut failed = 0;
        for pool in pools.iter().filter(|p| !p.imported) {
            info!(pool = %pool.name, "importing pool");
            if let Err(e) = self.platform.pools.import(&pool.name) {
                error!(pool = %pool.name, error = %e, "pool import failed");
                failed += 1;
            }
        }
        if !pools.is_empty() && failed == pools.len() {
            phase.set_phase(Some(FailoverPhase::Failed));
            return Err(HaError::failed("All pools failed to import"));
        }
        if !self.unlock() {
            warn!("some datasets could not be unlocked");
        }
        phase.set_phase(None);

        if let Err(e) = self.platform.network.set_vips(true) {
            error!(error = %e, "failed to take the virtual addresses");
        }
        let report = self.targets.become_active();
        if !report.is_clean() {
            warn!(failed = ?report.failed, within_budget = report.within_budget, "target takeover incomplete");
        }
        self.restart_critical_services();
        if let Err(e) = self.platform.network.set_traffic(true) {
            error!(error = %e, "failed to allow data traffic");
        }

        info!(interface, %from, "failover to MASTER complete");
        self.bus.publish(FailoverEvent::RoleChanged {
            from,
            to: HaStatus::Master,
            interface: Some(interface.to_string()),
        });
        Ok(EventOutcome::BecameMaster)
    }

    fn restart_critical_services(&self) {
        let services = &self.platform.services;
        for (service, keeps_standby_state) in CRITICAL_SERVICES {
            if !services.enabled(service) {
                continue;
            }
            let result = if keeps_standby_state {
                services.become_active(service)
            } else {
                services.control(ServiceVerb::Restart, service)
            };
            if let Err(e) = result {
                error!(service, error = %e, "failed to start service after takeover");
            }
        }
    }

    pub(crate) fn vrrp_backup(&self, interface: &str) -> HaResult<EventOutcome> {
        let from = self.last_status().unwrap_or(HaStatus::Unknown);
        warn!(interface, "entering BACKUP");

        self.platform.fencing.stop();
        if let Err(e) = self.platform.network.set_traffic(false) {
            error!(error = %e, "failed to block data traffic");
        }
        let report = self.targets.become_standby();
        if !report.is_clean() {
            warn!(failed = ?report.failed, "target demotion incomplete");
        }
        if let Err(e) = self.platform.network.set_vips(false) {
            error!(error = %e, "failed to release the virtual addresses");
        }
        for pool in self
            .platform
            .pools
            .configured()
            .into_iter()
            .filter(|p| p.imported)
        {
            if let Err(e) = self.platform.pools.export(&pool.name) {
                error!(pool = %pool.name, error = %e, "pool export failed");
            }
        }
        self.platform.phase.set_phase(None);

        self.status_refresh();
        self.sync_keys_from_remote_node();

        info!(interface, %from, "failover to BACKUP complete");
        self.bus.publish(FailoverEvent::RoleChanged {
            from,
            to: HaStatus::Backup,
            interface: Some(interface.to_string()),
        });
        Ok(EventOutcome::BecameBackup)
    }
}
