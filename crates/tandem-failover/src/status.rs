//! Role engine.
//!
//! Determines the local HA status from VRRP, pools and the failover phase
//! markers, falling back to asking the peer when the local view is not
//! conclusive. A node force-mastered while its peer did not answer reports
//! SINGLE until the peer is reachable again.
//!
//! # Caching
//!
//! - A decided local status is cached for `status_ttl`
//! - Each caller session sees at most one recomputation per `throttle`
//! - A peer-derived status is never cached
//!
//! Every change of the status or of the disabled reasons is published on the
//! event bus.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{MutexGuard, PoisonError};
use std::time::Instant;

use tandem_peer::{PeerError, Session};
use tandem_types::{DisabledReasons, HaStatus, VrrpSnapshot};
use tracing::{debug, info, warn};

use crate::bus::FailoverEvent;
use crate::platform::FailoverPhase;
use crate::service::FailoverService;

#[derive(Debug, Default)]
struct Throttle {
    status: Option<(Instant, HaStatus)>,
    reasons: Option<(Instant, DisabledReasons)>,
}

/// Cached role observations.
#[derive(Debug, Default)]
pub(crate) struct RoleCache {
    local: Option<(Instant, HaStatus)>,
    last_status: Option<HaStatus>,
    last_reasons: Option<DisabledReasons>,
    sessions: HashMap<String, Throttle>,
}

impl FailoverService {
    fn roles(&self) -> MutexGuard<'_, RoleCache> {
        self.roles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `failover.status` for `session`.
    pub fn status(&self, session: &Session) -> HaStatus {
        let key = session.key();
        if let Some((at, status)) = self.roles().sessions.get(&key).and_then(|t| t.status) {
            if at.elapsed() < self.settings.throttle {
                return status;
            }
        }

        let status = self.compute_status();
        let mut roles = self.roles();
        roles.sessions.entry(key).or_default().status = Some((Instant::now(), status));
        if roles.last_status != Some(status) {
            roles.last_status = Some(status);
            drop(roles);
            debug!(%status, "failover status changed");
            self.bus.publish(FailoverEvent::StatusChanged { status });
        }
        status
    }

    /// Status for internal callers, sharing the local session's throttle.
    pub fn current_status(&self) -> HaStatus {
        self.status(&Session::local())
    }

    /// Drops every cached observation and recomputes status and reasons.
    pub fn status_refresh(&self) {
        {
            let mut roles = self.roles();
            roles.local = None;
            roles.sessions.clear();
        }
        let local = Session::local();
        self.status(&local);
        self.disabled_reasons(&local);
    }

    /// `failover.disabled.reasons` for `session`.
    pub fn disabled_reasons(&self, session: &Session) -> DisabledReasons {
        let key = session.key();
        if let Some((at, reasons)) = self
            .roles()
            .sessions
            .get(&key)
            .and_then(|t| t.reasons.clone())
        {
            if at.elapsed() < self.settings.throttle {
                return reasons;
            }
        }

        let reasons = self.compute_disabled_reasons();
        let mut roles = self.roles();
        roles.sessions.entry(key).or_default().reasons = Some((Instant::now(), reasons.clone()));
        if roles.last_reasons.as_ref() != Some(&reasons) {
            roles.last_reasons = Some(reasons.clone());
            drop(roles);
            debug!(%reasons, "disabled reasons changed");
            self.bus.publish(FailoverEvent::DisabledReasonsChanged {
                disabled_reasons: reasons.clone(),
            });
        }
        reasons
    }

    /// Last published status, without recomputing.
    pub fn last_status(&self) -> Option<HaStatus> {
        self.roles().last_status
    }

    fn compute_status(&self) -> HaStatus {
        if let Some((at, status)) = self.roles().local {
            if at.elapsed() < self.settings.status_ttl {
                return status;
            }
        }

        if let Some(status) = self.local_status() {
            self.roles().local = Some((Instant::now(), status));
            return status;
        }

        match self.peer.imported_pools(self.settings.probe_timeout) {
            Ok(pools) if pools.iter().any(|p| p.imported) => HaStatus::Backup,
            Ok(_) => HaStatus::Error,
            Err(e) => {
                if !e.is_peer_down() && !matches!(e, PeerError::Remote(_)) {
                    warn!(error = %e, "failed to determine status from the peer");
                }
                HaStatus::Unknown
            }
        }
    }

    /// The status the local node can decide on its own, if any.
    fn local_status(&self) -> Option<HaStatus> {
        let interfaces = self.platform.network.interfaces();
        if !interfaces.iter().any(|i| i.vrrp.is_some()) {
            return Some(HaStatus::Single);
        }
        let pools = self.platform.pools.configured();
        if pools.is_empty() {
            return Some(HaStatus::Single);
        }
        if !self.licensed() {
            return Some(HaStatus::Single);
        }
        if self.forced_alone.load(Ordering::SeqCst) {
            if pools.iter().any(|p| p.imported) && !self.peer_answers() {
                return Some(HaStatus::Single);
            }
            self.forced_alone.store(false, Ordering::SeqCst);
            info!("peer reachable again, leaving forced SINGLE");
        }

        let snapshot = VrrpSnapshot::from_interfaces(&interfaces);
        if snapshot.masters.is_empty() {
            return None;
        }
        if pools.iter().any(|p| p.imported) {
            return Some(HaStatus::Master);
        }
        match self.platform.phase.phase() {
            Some(FailoverPhase::Electing) => Some(HaStatus::Electing),
            Some(FailoverPhase::Importing) => Some(HaStatus::Importing),
            Some(FailoverPhase::Failed) => Some(HaStatus::Error),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tandem_peer::{Reply, Request};
    use tandem_types::{DisabledReason, VrrpState};

    use super::*;
    use crate::testing::{ScriptedPeer, fixture, healthy_backup, interface, pool};

    #[test]
    fn test_no_vrrp_is_single() {
        let fx = fixture(ScriptedPeer::down());
        fx.node.state().interfaces = vec![interface("eth0", None)];
        assert_eq!(fx.service.current_status(), HaStatus::Single);
        assert!(fx.peer.calls().is_empty());
    }

    #[test]
    fn test_unlicensed_is_single() {
        let fx = fixture(ScriptedPeer::down());
        fx.node.state().licensed = false;
        assert_eq!(fx.service.current_status(), HaStatus::Single);
    }

    #[test]
    fn test_vrrp_master_with_imported_pool_is_master() {
        let fx = fixture(ScriptedPeer::down());
        fx.make_master();
        assert_eq!(fx.service.current_status(), HaStatus::Master);
    }

    #[test]
    fn test_phase_markers_while_master_without_pools() {
        let fx = fixture(ScriptedPeer::down());
        fx.node.state().interfaces = vec![interface("eth0", Some(VrrpState::Master))];
        fx.node.state().phase = Some(FailoverPhase::Importing);
        assert_eq!(fx.service.current_status(), HaStatus::Importing);
    }

    #[test]
    fn test_backup_when_peer_has_pools() {
        let fx = fixture(ScriptedPeer::new(|request| match request {
            Request::ImportedPools => Ok(Reply::Pools(vec![pool("tank", true)])),
            other => healthy_backup(other),
        }));
        assert_eq!(fx.service.current_status(), HaStatus::Backup);
    }

    #[test]
    fn test_error_when_nobody_has_pools() {
        let fx = fixture(ScriptedPeer::new(healthy_backup));
        assert_eq!(fx.service.current_status(), HaStatus::Error);
    }

    #[test]
    fn test_unknown_when_peer_down() {
        let fx = fixture(ScriptedPeer::down());
        assert_eq!(fx.service.current_status(), HaStatus::Unknown);
    }

    #[test]
    fn test_throttle_is_per_session() {
        let fx = fixture(ScriptedPeer::new(healthy_backup));
        let origin: SocketAddr = "10.0.0.5:40000".parse().unwrap();
        let client = Session::client(origin);

        fx.service.status(&client);
        fx.service.status(&client);
        assert_eq!(fx.peer.methods(), vec!["pool.imported"]);

        fx.service.status(&Session::local());
        assert_eq!(fx.peer.methods().len(), 2);
    }

    #[test]
    fn test_decided_local_status_is_cached() {
        let fx = fixture(ScriptedPeer::down());
        fx.make_master();
        fx.node.state().interfaces = vec![interface("eth0", None)];
        fx.service.roles().sessions.clear();
        assert_eq!(fx.service.current_status(), HaStatus::Master);

        fx.service.status_refresh();
        assert_eq!(fx.service.current_status(), HaStatus::Single);
    }

    #[test]
    fn test_change_events_published_once() {
        let fx = fixture(ScriptedPeer::down());
        let mut rx = fx.service.bus().subscribe();
        fx.service.status_refresh();
        fx.service.status_refresh();

        let mut statuses = Vec::new();
        let mut reasons = Vec::new();
        while let Ok(message) = rx.try_recv() {
            match message.event {
                FailoverEvent::StatusChanged { status } => statuses.push(status),
                FailoverEvent::DisabledReasonsChanged { disabled_reasons } => {
                    reasons.push(disabled_reasons);
                }
                _ => {}
            }
        }
        assert_eq!(statuses, vec![HaStatus::Unknown]);
        assert_eq!(reasons.len(), 1);
        assert!(reasons[0].contains(DisabledReason::NoPong));
    }
}
