//! Mirrors service control actions from the MASTER to the standby.

use tandem_types::{HaStatus, ServiceOptions, ServiceVerb};
use tracing::{debug, warn};

use crate::HaResult;
use crate::service::FailoverService;

/// Services whose state is per node and never mirrored.
pub const FORWARD_BLOCKLIST: [&str; 5] = ["system", "webshell", "smartd", "system_datasets", "nfs"];

/// Whether an action on `service` should be repeated on the standby.
pub fn should_forward(verb: ServiceVerb, service: &str, options: ServiceOptions) -> bool {
    if !options.ha_propagate || FORWARD_BLOCKLIST.contains(&service) {
        return false;
    }
    // The standby's nginx must keep serving the UI.
    !(service == "nginx" && verb == ServiceVerb::Stop)
}

/// What happened to a forwarded action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    /// Not eligible, or this node is not MASTER.
    Skipped,
    Sent,
    /// The standby rejected or missed it; logged and dropped.
    Failed,
}

impl FailoverService {
    /// Runs a service action locally and mirrors it to the standby.
    pub fn service_control(
        &self,
        verb: ServiceVerb,
        service: &str,
        options: ServiceOptions,
    ) -> HaResult<Forwarded> {
        self.platform.services.control(verb, service)?;
        Ok(self.forward_service_action(verb, service, options))
    }

    /// Repeats an action that already ran locally. Never fails the caller.
    pub fn forward_service_action(
        &self,
        verb: ServiceVerb,
        service: &str,
        options: ServiceOptions,
    ) -> Forwarded {
        if !should_forward(verb, service, options) || !self.licensed() {
            return Forwarded::Skipped;
        }
        if self.current_status() != HaStatus::Master {
            return Forwarded::Skipped;
        }
        match self.peer.service(verb, service, ServiceOptions::LOCAL_ONLY) {
            Ok(()) => {
                debug!(%verb, service, "service action mirrored to standby");
                Forwarded::Sent
            }
            Err(e) if e.is_peer_down() => {
                debug!(%verb, service, "standby unreachable, service action not mirrored");
                Forwarded::Failed
            }
            Err(e) => {
                warn!(%verb, service, error = %e, "failed to mirror service action to standby");
                Forwarded::Failed
            }
        }
    }
}
