//! Role transitions and HA-aware setup of exported endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::backend::{TargetBackend, TargetPeer};
use crate::endpoint::{EndpointState, FailoverMode, TargetEndpoint, TargetRegistry};
use crate::{TargetError, TargetResult};

/// How initiators learn that the optimized path moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rediscovery {
    /// Emit an ANA-change asynchronous event / ALUA unit attention.
    AsyncEvent,
    /// Drop existing sessions so initiators reconnect and rediscover.
    TearDown,
}

#[derive(Debug, Clone)]
pub struct TargetSettings {
    /// Upper bound for moving every endpoint on a role change.
    pub failover_budget: Duration,
    pub settle_retries: u32,
    pub settle_interval: Duration,
    /// How long the peer gets to see an attached or detached LUN.
    pub lun_wait: Duration,
    pub lun_poll: Duration,
    pub rediscovery: Rediscovery,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            failover_budget: Duration::from_secs(60),
            settle_retries: 10,
            settle_interval: Duration::from_secs(1),
            lun_wait: Duration::from_secs(30),
            lun_poll: Duration::from_millis(500),
            rediscovery: Rediscovery::AsyncEvent,
        }
    }
}

/// Outcome of moving every endpoint to a new role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionReport {
    pub moved: usize,
    /// Endpoints that could not be moved, with the reason.
    pub failed: Vec<(String, String)>,
    pub elapsed: Duration,
    pub within_budget: bool,
}

impl TransitionReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.within_budget
    }
}

/// Drives the local target stack through role changes.
///
/// Endpoint identity is owned by the registry and never rewritten here; a
/// transition only changes path state or advertisement.
pub struct TargetFailoverEngine {
    settings: TargetSettings,
    backend: Arc<dyn TargetBackend>,
    peer: Arc<dyn TargetPeer>,
    registry: Mutex<TargetRegistry>,
    active: AtomicBool,
}

impl TargetFailoverEngine {
    pub fn new(
        settings: TargetSettings,
        backend: Arc<dyn TargetBackend>,
        peer: Arc<dyn TargetPeer>,
    ) -> Self {
        Self {
            settings,
            backend,
            peer,
            registry: Mutex::new(TargetRegistry::new()),
            active: AtomicBool::new(false),
        }
    }

    fn registry(&self) -> MutexGuard<'_, TargetRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &TargetSettings {
        &self.settings
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Current endpoints with their local state.
    pub fn snapshot(&self) -> Vec<(TargetEndpoint, EndpointState)> {
        let registry = self.registry();
        registry
            .endpoints()
            .filter_map(|endpoint| {
                registry
                    .state(&endpoint.name)
                    .map(|state| (endpoint.clone(), state))
            })
            .collect()
    }

    pub fn state(&self, name: &str) -> Option<EndpointState> {
        self.registry().state(name)
    }

    fn role_state(&self, endpoint: &TargetEndpoint) -> EndpointState {
        if self.is_active() {
            endpoint.active_state()
        } else {
            endpoint.standby_state()
        }
    }

    /// Loads an existing endpoint at startup without touching the peer.
    pub fn register(&self, endpoint: TargetEndpoint) -> TargetResult<()> {
        let state = self.role_state(&endpoint);
        self.registry().insert(endpoint, state)
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Adds an endpoint, reloads both nodes and waits until the peer sees it.
    ///
    /// On failure the endpoint is removed again and both nodes reloaded.
    pub fn attach(&self, endpoint: TargetEndpoint) -> TargetResult<()> {
        let naa = endpoint.identity.naa.clone();
        let name = endpoint.name.clone();
        let state = self.role_state(&endpoint);
        self.registry().insert(endpoint, state)?;

        if let Err(e) = self.propagate(&naa, true) {
            warn!(target = %name, error = %e, "attach failed, rolling back");
            if let Err(undo) = self.registry().remove(&name) {
                debug!(target = %name, error = %undo, "endpoint already gone");
            }
            self.resync();
            return Err(e);
        }
        info!(target = %name, %naa, "endpoint attached");
        Ok(())
    }

    /// Removes an extent from its target and waits until the peer dropped it.
    ///
    /// On failure the endpoint is restored with its previous state.
    pub fn detach(&self, name: &str, force: bool) -> TargetResult<()> {
        self.check_sessions(name, force)?;
        let (endpoint, state) = {
            let mut registry = self.registry();
            let state = registry
                .state(name)
                .ok_or_else(|| TargetError::NotFound(name.to_string()))?;
            (registry.remove(name)?, state)
        };
        let naa = endpoint.identity.naa.clone();

        if let Err(e) = self.propagate(&naa, false) {
            warn!(target = %name, error = %e, "detach failed, restoring endpoint");
            if let Err(undo) = self.registry().insert(endpoint, state) {
                debug!(target = %name, error = %undo, "endpoint already restored");
            }
            self.resync();
            return Err(e);
        }
        info!(target = %name, "endpoint detached");
        Ok(())
    }

    /// Deletes a target.
    ///
    /// On ALUA systems with a reachable peer the peer removes it first and
    /// both nodes are given time to settle. If that fails the peer reloads
    /// its configuration, which still holds the target, and nothing is
    /// removed locally.
    pub fn delete(&self, name: &str, force: bool) -> TargetResult<()> {
        if self.registry().get(name).is_none() {
            return Err(TargetError::NotFound(name.to_string()));
        }
        let sessions = self.check_sessions(name, force)?;

        if self.registry().uses_alua() && self.peer.connected() {
            let removed = self
                .peer
                .remove_target(name)
                .and_then(|()| self.wait_alua_settled());
            if let Err(e) = removed {
                warn!(target = %name, error = %e, "peer removal did not settle, restoring peer");
                if let Err(undo) = self.peer.reload() {
                    warn!(target = %name, error = %undo, "failed to restore target on peer");
                }
                return Err(e);
            }
        }
        if sessions > 0 {
            self.backend.remove_target(name)?;
        }
        self.registry().remove(name)?;
        self.backend.reload()?;
        info!(target = %name, force, "target deleted");
        Ok(())
    }

    /// Reloads both nodes and waits for the peer to see the LUN come or go.
    fn propagate(&self, naa: &str, present: bool) -> TargetResult<()> {
        self.backend.reload()?;
        if self.peer.connected() {
            self.peer.reload()?;
            self.wait_for_lun(naa, present)?;
        }
        Ok(())
    }

    /// Best-effort reload of both nodes after a rollback.
    fn resync(&self) {
        if let Err(e) = self.backend.reload() {
            warn!(error = %e, "reload after rollback failed");
        }
        if self.peer.connected()
            && let Err(e) = self.peer.reload()
        {
            warn!(error = %e, "peer reload after rollback failed");
        }
    }

    fn check_sessions(&self, name: &str, force: bool) -> TargetResult<usize> {
        let sessions = self.backend.active_sessions(name);
        if sessions.is_empty() {
            return Ok(0);
        }
        if !force {
            return Err(TargetError::InUse {
                name: name.to_string(),
                sessions: sessions.len(),
            });
        }
        warn!(
            target = %name,
            sessions = sessions.len(),
            "removing target with active sessions"
        );
        Ok(sessions.len())
    }

    pub fn wait_for_ha_lun_present(&self, naa: &str) -> TargetResult<()> {
        self.wait_for_lun(naa, true)
    }

    pub fn wait_for_ha_lun_absent(&self, naa: &str) -> TargetResult<()> {
        self.wait_for_lun(naa, false)
    }

    fn wait_for_lun(&self, naa: &str, present: bool) -> TargetResult<()> {
        let deadline = Instant::now() + self.settings.lun_wait;
        loop {
            if self.peer.lun_visible(naa)? == present {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(TargetError::Timeout {
                    what: if present {
                        format!("LUN {naa} to appear on the peer")
                    } else {
                        format!("LUN {naa} to disappear from the peer")
                    },
                    waited: self.settings.lun_wait,
                });
            }
            thread::sleep(self.settings.lun_poll);
        }
    }

    /// Local ALUA state settled.
    pub fn alua_settled(&self) -> bool {
        self.backend.alua_settled()
    }

    fn wait_alua_settled(&self) -> TargetResult<()> {
        for attempt in 0..self.settings.settle_retries {
            if self.backend.alua_settled() && self.peer.alua_settled()? {
                return Ok(());
            }
            debug!(attempt, "waiting for ALUA to settle");
            thread::sleep(self.settings.settle_interval);
        }
        Err(TargetError::Timeout {
            what: "ALUA to settle".to_string(),
            waited: self.settings.settle_interval * self.settings.settle_retries,
        })
    }

    // ========================================================================
    // Role transitions
    // ========================================================================

    /// Moves every endpoint to its MASTER state.
    pub fn become_active(&self) -> TransitionReport {
        self.active.store(true, Ordering::SeqCst);
        self.transition(true)
    }

    /// Moves every endpoint to its standby state.
    pub fn become_standby(&self) -> TransitionReport {
        self.active.store(false, Ordering::SeqCst);
        self.transition(false)
    }

    fn transition(&self, active: bool) -> TransitionReport {
        let started = Instant::now();
        let endpoints: Vec<TargetEndpoint> = self.registry().endpoints().cloned().collect();
        let mut moved = 0;
        let mut failed = Vec::new();

        for endpoint in &endpoints {
            let target = if active {
                endpoint.active_state()
            } else {
                endpoint.standby_state()
            };
            match self.move_endpoint(endpoint, target, active) {
                Ok(()) => {
                    if let Err(e) = self.registry().set_state(&endpoint.name, target) {
                        failed.push((endpoint.name.clone(), e.to_string()));
                    } else {
                        moved += 1;
                    }
                }
                Err(e) => {
                    warn!(target = %endpoint.name, error = %e, "endpoint transition failed");
                    failed.push((endpoint.name.clone(), e.to_string()));
                }
            }
        }

        let elapsed = started.elapsed();
        let within_budget = elapsed <= self.settings.failover_budget;
        if !within_budget {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                budget_secs = self.settings.failover_budget.as_secs(),
                "target transition exceeded failover budget"
            );
        }
        info!(
            role = if active { "active" } else { "standby" },
            moved,
            failed = failed.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "target transition complete"
        );
        TransitionReport {
            moved,
            failed,
            elapsed,
            within_budget,
        }
    }

    fn move_endpoint(
        &self,
        endpoint: &TargetEndpoint,
        target: EndpointState,
        active: bool,
    ) -> TargetResult<()> {
        match (endpoint.mode, target) {
            (FailoverMode::AluaAna, EndpointState::Path(state)) => {
                self.backend.set_path_state(endpoint, state)?;
                if active {
                    match self.settings.rediscovery {
                        Rediscovery::AsyncEvent => self.backend.notify_path_change(endpoint),
                        Rediscovery::TearDown => self.backend.drop_sessions(endpoint),
                    }
                } else {
                    self.backend.notify_path_change(endpoint)
                }
            }
            (FailoverMode::Vip, EndpointState::Advertised) => self.backend.advertise(endpoint),
            (FailoverMode::Vip, EndpointState::NotAdvertised) => {
                self.backend.withdraw(endpoint)?;
                self.backend.drop_sessions(endpoint)
            }
            (mode, state) => Err(TargetError::Backend(format!(
                "state {state} does not apply to {mode:?} endpoint {}",
                endpoint.name
            ))),
        }
    }
}
