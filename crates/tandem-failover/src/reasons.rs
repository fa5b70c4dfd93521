//! Why failover is currently unsafe.

use serde::{Deserialize, Serialize};
use tandem_types::{DisabledReason, DisabledReasons, InterfaceInfo, VrrpSnapshot};
use tracing::{debug, warn};

use crate::HaResult;
use crate::service::FailoverService;

/// Data-disk serials present on only one controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskMismatch {
    pub missing_local: Vec<String>,
    pub missing_remote: Vec<String>,
}

impl DiskMismatch {
    pub fn is_empty(&self) -> bool {
        self.missing_local.is_empty() && self.missing_remote.is_empty()
    }
}

/// Critical interfaces configured on only one controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicMismatch {
    pub missing_local: Vec<String>,
    pub missing_remote: Vec<String>,
}

impl FailoverService {
    pub(crate) fn compute_disabled_reasons(&self) -> DisabledReasons {
        let mut reasons = DisabledReasons::new();
        if self.platform.pools.configured().is_empty() {
            reasons.insert(DisabledReason::NoVolume);
        }
        let interfaces = self.platform.network.interfaces();
        if !interfaces.iter().any(|i| !i.virtual_aliases.is_empty()) {
            reasons.insert(DisabledReason::NoVip);
        }
        if !interfaces.iter().any(|i| i.critical) {
            reasons.insert(DisabledReason::NoCriticalInterfaces);
        }

        match self.peer_reasons(&interfaces) {
            Ok(found) => {
                for reason in found {
                    reasons.insert(reason);
                }
            }
            Err(e) => {
                debug!(error = %e, "peer probe failed");
                reasons.insert(DisabledReason::NoPong);
            }
        }

        match self.ha_config() {
            Ok(config) if config.disabled => {
                reasons.insert(DisabledReason::NoFailover);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to read failover settings"),
        }
        reasons
    }

    /// Reasons that need the peer. Any failure to reach it is `NO_PONG`.
    fn peer_reasons(&self, interfaces: &[InterfaceInfo]) -> HaResult<Vec<DisabledReason>> {
        let timeout = self.settings.probe_timeout;
        let mut reasons = Vec::new();
        if !self.peer.ping(timeout)? {
            reasons.push(DisabledReason::NoPong);
            return Ok(reasons);
        }
        if !self.peer.system_ready()? {
            reasons.push(DisabledReason::NoSystemReady);
        }
        if !self.peer.licensed()? {
            reasons.push(DisabledReason::NoLicense);
        }

        let remote = self.peer.interfaces(timeout)?;
        let disagreements = VrrpSnapshot::disagreements(
            &VrrpSnapshot::from_interfaces(interfaces),
            &VrrpSnapshot::from_interfaces(&remote),
        );
        if !disagreements.is_empty() {
            debug!(?disagreements, "VRRP state disagrees with the peer");
            reasons.push(DisabledReason::DisagreeCarp);
        }

        if !self.mismatch_disks()?.is_empty() {
            reasons.push(DisabledReason::MismatchDisks);
        }
        Ok(reasons)
    }

    /// Compares data-disk serials with the peer.
    pub fn mismatch_disks(&self) -> HaResult<DiskMismatch> {
        let local = self.platform.disks.data_disk_serials()?;
        let remote = self.peer.data_disk_serials(self.settings.probe_timeout)?;
        Ok(DiskMismatch {
            missing_local: difference(&remote, &local),
            missing_remote: difference(&local, &remote),
        })
    }

    /// Compares critical interface names with the peer.
    pub fn mismatch_nics(&self) -> HaResult<NicMismatch> {
        let critical = |interfaces: Vec<InterfaceInfo>| -> Vec<String> {
            interfaces
                .into_iter()
                .filter(|i| i.critical)
                .map(|i| i.name)
                .collect()
        };
        let local = critical(self.platform.network.interfaces());
        let remote = critical(self.peer.interfaces(self.settings.probe_timeout)?);
        Ok(NicMismatch {
            missing_local: difference(&remote, &local),
            missing_remote: difference(&local, &remote),
        })
    }
}

/// Items of `a` not in `b`, sorted.
fn difference(a: &[String], b: &[String]) -> Vec<String> {
    let mut out: Vec<String> = a.iter().filter(|x| !b.contains(x)).cloned().collect();
    out.sort();
    out.dedup();
    out
}
