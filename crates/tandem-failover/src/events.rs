//! VRRP event handling.
//!
//! Keepalived reports every state change of a failover interface. After a
//! debounce of `timeout_seconds`, [`FailoverService::handle_event`] decides
//! whether the event is actionable and, if so, runs the transition under the
//! `vrrp_event` lock. One transition runs at a time; an event of the kind
//! already running is dropped.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_types::{DisabledReason, DisabledReasons, HaConfig};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::locks::VRRP_EVENT;
use crate::service::FailoverService;
use crate::{HaError, HaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VrrpEvent {
    Master,
    Backup,
    /// Operator-requested takeover; skips every safety check.
    ForceTakeover,
}

impl VrrpEvent {
    fn kind(self) -> EventKind {
        match self {
            VrrpEvent::Master | VrrpEvent::ForceTakeover => EventKind::Master,
            VrrpEvent::Backup => EventKind::Backup,
        }
    }
}

impl fmt::Display for VrrpEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VrrpEvent::Master => "MASTER",
            VrrpEvent::Backup => "BACKUP",
            VrrpEvent::ForceTakeover => "forcetakeover",
        })
    }
}

impl FromStr for VrrpEvent {
    type Err = HaError;

    /// Accepts the state names keepalived passes to notify scripts.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MASTER" => Ok(VrrpEvent::Master),
            "BACKUP" | "FAULT" => Ok(VrrpEvent::Backup),
            "FORCETAKEOVER" | "FORCE_TAKEOVER" => Ok(VrrpEvent::ForceTakeover),
            other => Err(HaError::Validation(format!("unknown VRRP event {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Master,
    Backup,
}

/// Why an event did not lead to a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Failover is disabled and this node is not the configured MASTER.
    DisabledStandby,
    NonCritical,
    /// Every pool is already imported here.
    AlreadyImported,
    /// A transition of the same kind is already running.
    Duplicate,
    /// Taking over would be unsafe.
    Unsafe(DisabledReasons),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Ignored(IgnoreReason),
    BecameMaster,
    BecameBackup,
}

/// Reasons that veto an automatic takeover. Reasons caused by the peer
/// being gone are exactly what failover is for and do not count.
fn blocks_takeover(reason: DisabledReason) -> bool {
    matches!(
        reason,
        DisabledReason::NoVolume
            | DisabledReason::NoVip
            | DisabledReason::NoCriticalInterfaces
            | DisabledReason::NoLicense
            | DisabledReason::MismatchDisks
    )
}

/// Serialises transitions and remembers which kind is running.
#[derive(Debug, Default)]
pub(crate) struct EventSlot {
    serial: Mutex<()>,
    running: Mutex<Option<EventKind>>,
}

impl EventSlot {
    fn running(&self) -> MutexGuard<'_, Option<EventKind>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the running marker on drop.
struct Running<'a>(&'a EventSlot);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        *self.0.running() = None;
    }
}

impl FailoverService {
    /// Handles one (already debounced) VRRP event for `interface`.
    ///
    /// Status is refreshed after every event that was acted on.
    pub fn handle_event(&self, interface: &str, event: VrrpEvent) -> HaResult<EventOutcome> {
        let outcome = self.dispatch_event(interface, event);
        match &outcome {
            Ok(EventOutcome::Ignored(reason)) => {
                info!(interface, %event, ?reason, "ignoring failover event");
            }
            _ => self.status_refresh(),
        }
        outcome
    }

    fn dispatch_event(&self, interface: &str, event: VrrpEvent) -> HaResult<EventOutcome> {
        if let Some(reason) = self.ignore_reason(interface, event)? {
            return Ok(EventOutcome::Ignored(reason));
        }

        let kind = event.kind();
        if *self.events.running() == Some(kind) {
            return Ok(EventOutcome::Ignored(IgnoreReason::Duplicate));
        }
        let _serial = self
            .events
            .serial
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _job = self.locks.acquire(VRRP_EVENT)?;
        *self.events.running() = Some(kind);
        let _running = Running(&self.events);

        match event {
            VrrpEvent::Master => self.vrrp_master(interface, false),
            VrrpEvent::ForceTakeover => self.vrrp_master(interface, true),
            VrrpEvent::Backup => self.vrrp_backup(interface),
        }
    }

    fn ignore_reason(&self, interface: &str, event: VrrpEvent) -> HaResult<Option<IgnoreReason>> {
        if event == VrrpEvent::ForceTakeover {
            return Ok(None);
        }
        let config = self.ha_config()?;
        if config.disabled && config.master_slot != self.slot() {
            return Ok(Some(IgnoreReason::DisabledStandby));
        }
        let interfaces = self.platform.network.interfaces();
        if interfaces
            .iter()
            .any(|i| i.name == interface && !i.critical)
        {
            return Ok(Some(IgnoreReason::NonCritical));
        }
        if event == VrrpEvent::Master {
            let pools = self.platform.pools.configured();
            if !pools.is_empty() && pools.iter().all(|p| p.imported) {
                return Ok(Some(IgnoreReason::AlreadyImported));
            }
            let blocking: DisabledReasons = self
                .compute_disabled_reasons()
                .iter()
                .filter(|r| blocks_takeover(*r))
                .collect();
            if !blocking.is_empty() {
                return Ok(Some(IgnoreReason::Unsafe(blocking)));
            }
        }
        Ok(None)
    }

    /// `failover.in_progress`: a transition is running on this node.
    pub fn in_progress(&self) -> bool {
        self.locks.is_held(VRRP_EVENT)
    }
}

// ============================================================================
// Async front end
// ============================================================================

/// Debounces VRRP notifications and runs them on the blocking pool.
#[derive(Clone)]
pub struct EventHandler {
    service: Arc<FailoverService>,
}

impl EventHandler {
    pub fn new(service: Arc<FailoverService>) -> Self {
        Self { service }
    }

    /// Waits out the debounce, then handles the event.
    pub async fn handle(&self, interface: String, event: VrrpEvent) -> HaResult<EventOutcome> {
        if event != VrrpEvent::ForceTakeover {
            let timeout = self
                .service
                .ha_config()
                .map_or(HaConfig::DEFAULT_TIMEOUT_SECONDS, |c| c.timeout_seconds);
            debug!(interface, %event, timeout, "debouncing failover event");
            tokio::time::sleep(Duration::from_secs(u64::from(timeout))).await;
        }
        let service = self.service.clone();
        tokio::task::spawn_blocking(move || service.handle_event(&interface, event))
            .await
            .map_err(|e| HaError::failed(format!("failover event task failed: {e}")))?
    }

    /// Handles events from `events` until the sender side closes.
    pub async fn run(self, mut events: mpsc::Receiver<(String, VrrpEvent)>) {
        while let Some((interface, event)) = events.recv().await {
            let handler = self.clone();
            tokio::spawn(async move {
                match handler.handle(interface.clone(), event).await {
                    Ok(outcome) => debug!(interface, %event, ?outcome, "failover event handled"),
                    Err(e) => error!(interface, %event, error = %e, "failover event failed"),
                }
            });
        }
        info!("failover event channel closed");
    }
}
