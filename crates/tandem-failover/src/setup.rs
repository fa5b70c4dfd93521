//! Pairing hook, run after a pool import or an interface change.

use tandem_types::{HaStatus, ServiceOptions, ServiceVerb};
use tracing::{debug, info};

use crate::bus::FailoverEvent;
use crate::service::FailoverService;
use crate::HaResult;

/// What the setup hook did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupOutcome {
    /// Not licensed, no VIP, or no pool yet.
    NotReady,
    /// Already paired; this node is not the one to push configuration.
    Unchanged,
    /// Already paired; the database and network config were pushed.
    Reconfigured,
    /// First pairing completed.
    Paired,
}

impl FailoverService {
    /// Configures the standby once the pair has what it needs to fail over.
    pub fn setup_ha(&self) -> HaResult<SetupOutcome> {
        if !self.licensed() {
            return Ok(SetupOutcome::NotReady);
        }
        let has_vip = self
            .platform
            .network
            .interfaces()
            .iter()
            .any(|i| !i.virtual_aliases.is_empty());
        if !has_vip || self.platform.pools.configured().is_empty() {
            return Ok(SetupOutcome::NotReady);
        }

        self.status_refresh();

        let paired = match self.peer.status() {
            Ok(status) => status != HaStatus::Single,
            Err(e) => {
                debug!(error = %e, "peer status unavailable, treating as unpaired");
                false
            }
        };

        if paired {
            let config = self.config()?;
            if self.current_status() == HaStatus::Master || (config.master && config.disabled) {
                debug!("sending database to standby");
                self.send_database()?;
                debug!("configuring network on standby");
                self.peer.interface_sync()?;
                return Ok(SetupOutcome::Reconfigured);
            }
            return Ok(SetupOutcome::Unchanged);
        }

        let ssh_enabled = self.platform.services.enabled("ssh");
        let remote_ssh_started = ssh_enabled && self.peer.service_started("ssh")?;

        debug!("synchronizing database and files");
        self.sync_to_peer(false)?;
        debug!("configuring network on standby");
        self.peer.interface_sync()?;

        if ssh_enabled && !remote_ssh_started {
            debug!("starting ssh on standby");
            self.peer
                .service(ServiceVerb::Start, "ssh", ServiceOptions::LOCAL_ONLY)?;
        }

        self.status_refresh();
        info!("HA setup complete");
        self.bus.publish(FailoverEvent::SetupAdded);
        Ok(SetupOutcome::Paired)
    }
}
