//! # tandem-test-harness: an HA pair in one process
//!
//! Runs two complete Tandem controllers against a simulated disk shelf:
//!
//! - [`shelf`]: pool ownership, reservations, the virtual IP and block data,
//!   shared by both controllers and surviving their crashes
//! - [`controller`]: each controller's platform, backed by the shelf
//! - [`targets`]: an in-memory iSCSI/NVMe-oF target stack per controller
//! - [`interlink`]: the heartbeat link, served by the other controller's
//!   dispatcher and able to be cut
//! - [`initiator`]: a client doing block I/O through whichever path works
//!
//! Each controller keeps its datastore, journal and replay watermark on
//! disk under its own directory, so a crash followed by [`HaPair::restart`]
//! resumes from the same persistent state as a real reboot.
//!
//! VRRP is driven by the test: [`HaPair::orderly_failover`] and
//! [`HaPair::crash_failover`] deliver the events keepalived would.

pub mod controller;
pub mod initiator;
pub mod interlink;
pub mod shelf;
pub mod targets;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tandem_failover::{
    AlertRegistry, Dispatcher, EventOutcome, FailoverService, FailoverSettings, HaError, HaResult,
    PeerLink, PeerTargets, RoleAdapter, VrrpEvent,
};
use tandem_journal::{Journal, ReplicatorSettings};
use tandem_node::store::SqliteStore;
use tandem_peer::PeerClient;
use tandem_target::{
    Rediscovery, TargetBackend, TargetEndpoint, TargetFailoverEngine, TargetSettings,
};
use tandem_types::{HaStatus, NodeIdentity, NodeSlot, VrrpState};
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::interlink::Fabric;
use crate::shelf::{FAILOVER_IFACE, Shelf};
use crate::targets::MemoryTargets;

pub use crate::initiator::{ActivePath, Initiator, IoError};

// ============================================================================
// Settings
// ============================================================================

/// Timing for both controllers. Defaults are scaled down for tests.
#[derive(Debug, Clone)]
pub struct HarnessSettings {
    pub rediscovery: Rediscovery,
    pub failover_budget: Duration,
    pub journal_retry: Duration,
    pub call_timeout: Duration,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            rediscovery: Rediscovery::AsyncEvent,
            failover_budget: Duration::from_secs(60),
            journal_retry: Duration::from_millis(10),
            call_timeout: Duration::from_secs(1),
        }
    }
}

impl HarnessSettings {
    fn failover(&self, root: &Path) -> FailoverSettings {
        FailoverSettings {
            status_ttl: Duration::ZERO,
            throttle: Duration::ZERO,
            probe_timeout: self.call_timeout,
            fence_retry_interval: Duration::from_millis(1),
            fence_attempts: 4,
            sync_reboot_delay: Duration::ZERO,
            shutdown_wait: Duration::from_millis(50),
            boot_wait: Duration::from_millis(50),
            upgrade_poll: Duration::from_millis(1),
            upgrade_reboot_delay: Duration::ZERO,
            finish_reboot_delay: Duration::ZERO,
            license_path: root.join("license"),
            pwenc_secret_path: root.join("pwenc_secret"),
            authorized_keys_paths: vec![root.join("authorized_keys")],
            watermark_path: root.join("ha-replay.toml"),
        }
    }

    fn targets(&self) -> TargetSettings {
        TargetSettings {
            failover_budget: self.failover_budget,
            settle_retries: 3,
            settle_interval: Duration::from_millis(1),
            lun_wait: Duration::from_secs(1),
            lun_poll: Duration::from_millis(1),
            rediscovery: self.rediscovery,
        }
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// One running controller.
pub struct HarnessNode {
    pub slot: NodeSlot,
    pub controller: Arc<Controller>,
    pub store: Arc<SqliteStore>,
    pub targets: Arc<MemoryTargets>,
    pub service: Arc<FailoverService>,
    root: PathBuf,
    dispatcher: Arc<Dispatcher>,
    replicator: Mutex<Option<JoinHandle<()>>>,
}

impl HarnessNode {
    fn boot(
        slot: NodeSlot,
        root: &Path,
        boot: u32,
        shelf: &Shelf,
        fabric: &Arc<Fabric>,
        settings: &HarnessSettings,
    ) -> HaResult<Arc<Self>> {
        let store = Arc::new(SqliteStore::open(root.join("tandem.db"))?);
        let controller = Controller::new(slot, shelf.clone(), root, boot);
        let platform = controller.platform(store.clone());
        let targets = Arc::new(MemoryTargets::new(shelf.clone()));
        let peer = PeerClient::new(Arc::new(fabric.transport(slot)), settings.call_timeout);
        let engine = Arc::new(TargetFailoverEngine::new(
            settings.targets(),
            targets.clone(),
            Arc::new(PeerTargets(peer.clone())),
        ));
        let alerts = Arc::new(AlertRegistry::new());
        let local_version = shelf.chassis(slot).version;
        let service = FailoverService::new(
            NodeIdentity::new(slot, true),
            settings.failover(root),
            platform,
            peer.clone(),
            engine,
            alerts.clone(),
        );

        let (queue, replicator) = tandem_journal::replicator::spawn(
            ReplicatorSettings {
                journal_path: root.join("ha-journal"),
                queue_capacity: 1024,
                retry_poll: settings.journal_retry,
                recovery_sleep: settings.journal_retry,
                local_version,
            },
            RoleAdapter(service.clone()),
            PeerLink(peer),
            alerts,
        )?;
        // Only the datastore holds the queue, so detaching it stops the worker.
        store.attach_journal(queue);

        let catalog: Vec<TargetEndpoint> = shelf.lock().catalog.values().cloned().collect();
        for endpoint in catalog {
            service.targets().register(endpoint)?;
        }
        targets.reload()?;

        let dispatcher = Arc::new(Dispatcher::new(service.clone(), targets.clone()));
        shelf.lock().running.insert(slot);
        fabric.plug(slot, &dispatcher);
        info!(%slot, boot, "controller up");
        service.on_system_ready();

        Ok(Arc::new(Self {
            slot,
            controller,
            store,
            targets,
            service,
            root: root.to_path_buf(),
            dispatcher,
            replicator: Mutex::new(Some(replicator)),
        }))
    }

    /// Writes waiting in the local journal for the peer.
    pub fn pending_journal(&self) -> usize {
        Journal::open(self.root.join("ha-journal")).len()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Stops the journal worker after it drained everything already queued.
    fn halt(&self) {
        drop(self.store.detach_journal());
        let handle = self
            .replicator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(slot = %self.slot, "journal worker panicked");
        }
    }
}

// ============================================================================
// Pair
// ============================================================================

pub struct HaPairBuilder {
    settings: HarnessSettings,
    elect: bool,
}

impl HaPairBuilder {
    pub fn rediscovery(mut self, rediscovery: Rediscovery) -> Self {
        self.settings.rediscovery = rediscovery;
        self
    }

    pub fn failover_budget(mut self, budget: Duration) -> Self {
        self.settings.failover_budget = budget;
        self
    }

    /// Leaves both controllers BACKUP after boot.
    pub fn unelected(mut self) -> Self {
        self.elect = false;
        self
    }

    /// Boots both controllers and, unless told otherwise, makes A MASTER.
    pub fn start(self) -> HaResult<Arc<HaPair>> {
        let dir = tempfile::tempdir().map_err(HaError::platform)?;
        let roots: BTreeMap<NodeSlot, PathBuf> = [NodeSlot::A, NodeSlot::B]
            .into_iter()
            .map(|slot| (slot, dir.path().join(slot.to_string().to_lowercase())))
            .collect();
        let pair = Arc::new(HaPair {
            shelf: Shelf::default(),
            fabric: Fabric::new(roots.clone()),
            roots,
            settings: self.settings,
            nodes: Mutex::new(BTreeMap::new()),
            boots: Mutex::new(BTreeMap::new()),
            _dir: dir,
        });
        pair.restart(NodeSlot::A)?;
        pair.restart(NodeSlot::B)?;
        if self.elect {
            pair.shelf.update_chassis(NodeSlot::A, |c| c.vrrp = VrrpState::Master);
            expect_master(
                pair.running(NodeSlot::A)?
                    .service
                    .handle_event(FAILOVER_IFACE, VrrpEvent::Master)?,
            )?;
            pair.settle();
        }
        Ok(pair)
    }
}

/// Two controllers sharing a shelf.
pub struct HaPair {
    shelf: Shelf,
    fabric: Arc<Fabric>,
    roots: BTreeMap<NodeSlot, PathBuf>,
    settings: HarnessSettings,
    nodes: Mutex<BTreeMap<NodeSlot, Arc<HarnessNode>>>,
    boots: Mutex<BTreeMap<NodeSlot, u32>>,
    _dir: tempfile::TempDir,
}

fn expect_master(outcome: EventOutcome) -> HaResult<()> {
    match outcome {
        EventOutcome::BecameMaster => Ok(()),
        other => Err(HaError::failed(format!("takeover did not happen: {other:?}"))),
    }
}

impl HaPair {
    pub fn builder() -> HaPairBuilder {
        HaPairBuilder {
            settings: HarnessSettings::default(),
            elect: true,
        }
    }

    /// Boots a pair with A as MASTER.
    pub fn start() -> HaResult<Arc<Self>> {
        Self::builder().start()
    }

    fn nodes(&self) -> MutexGuard<'_, BTreeMap<NodeSlot, Arc<HarnessNode>>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shelf(&self) -> &Shelf {
        &self.shelf
    }

    /// The controller in `slot`, if it is running.
    pub fn node(&self, slot: NodeSlot) -> Option<Arc<HarnessNode>> {
        self.nodes().get(&slot).cloned()
    }

    fn running(&self, slot: NodeSlot) -> HaResult<Arc<HarnessNode>> {
        self.node(slot)
            .ok_or_else(|| HaError::failed(format!("controller {slot} is down")))
    }

    /// Status of every running controller.
    pub fn statuses(&self) -> BTreeMap<NodeSlot, HaStatus> {
        let nodes: Vec<_> = self.nodes().values().cloned().collect();
        nodes
            .into_iter()
            .map(|n| (n.slot, n.service.current_status()))
            .collect()
    }

    pub fn master(&self) -> Option<NodeSlot> {
        self.statuses()
            .into_iter()
            .find(|(_, s)| *s == HaStatus::Master)
            .map(|(slot, _)| slot)
    }

    /// Drops every cached observation on both controllers and lets each
    /// notice whether its peer is reachable, as the daemon's watch would.
    pub fn settle(&self) {
        let nodes: Vec<_> = self.nodes().values().cloned().collect();
        for node in nodes {
            node.service.status_refresh();
            node.service.watch_peer();
        }
    }

    /// Cuts or restores the heartbeat link.
    pub fn set_link(&self, up: bool) {
        self.fabric.set_link(up);
        self.settle();
    }

    /// Exports a new endpoint: the standby learns it first, then the MASTER
    /// attaches it and waits for the standby to see the LUN.
    pub fn create_endpoint(&self, endpoint: TargetEndpoint) -> HaResult<()> {
        self.shelf
            .lock()
            .catalog
            .insert(endpoint.name.clone(), endpoint.clone());
        let master = self.master();
        let nodes: Vec<_> = self.nodes().values().cloned().collect();
        for node in nodes.iter().filter(|n| Some(n.slot) != master) {
            node.service.targets().register(endpoint.clone())?;
            node.targets.reload()?;
        }
        if let Some(node) = nodes.iter().find(|n| Some(n.slot) == master) {
            node.service.targets().attach(endpoint)?;
        }
        Ok(())
    }

    /// Planned failover: the MASTER steps down, then its peer takes over.
    pub fn orderly_failover(&self) -> HaResult<NodeSlot> {
        let (from, to) = self.roles()?;
        let (old, new) = (self.running(from)?, self.running(to)?);
        info!(%from, %to, "orderly failover");

        self.shelf.update_chassis(from, |c| c.vrrp = VrrpState::Backup);
        self.shelf.update_chassis(to, |c| c.vrrp = VrrpState::Master);
        old.service.handle_event(FAILOVER_IFACE, VrrpEvent::Backup)?;
        expect_master(new.service.handle_event(FAILOVER_IFACE, VrrpEvent::Master)?)?;
        self.settle();
        Ok(to)
    }

    /// Unplanned failover: the MASTER dies and its peer takes over.
    pub fn crash_failover(&self) -> HaResult<NodeSlot> {
        let (from, to) = self.roles()?;
        let survivor = self.running(to)?;
        info!(%from, %to, "crash failover");

        self.crash(from)?;
        // The dead controller rejoins VRRP as BACKUP.
        self.shelf.update_chassis(from, |c| c.vrrp = VrrpState::Backup);
        self.shelf.update_chassis(to, |c| c.vrrp = VrrpState::Master);
        expect_master(
            survivor
                .service
                .handle_event(FAILOVER_IFACE, VrrpEvent::Master)?,
        )?;
        self.settle();
        Ok(to)
    }

    fn roles(&self) -> HaResult<(NodeSlot, NodeSlot)> {
        let from = self
            .master()
            .ok_or_else(|| HaError::failed("no controller is MASTER"))?;
        let to = from
            .peer()
            .ok_or_else(|| HaError::failed(format!("controller {from} has no peer")))?;
        Ok((from, to))
    }

    /// Kills the middleware in `slot`. The shelf keeps whatever it held.
    pub fn crash(&self, slot: NodeSlot) -> HaResult<()> {
        let node = self
            .nodes()
            .remove(&slot)
            .ok_or_else(|| HaError::failed(format!("controller {slot} is already down")))?;
        self.fabric.unplug(slot);
        self.shelf.lock().running.remove(&slot);
        node.halt();
        debug!(%slot, "controller crashed");
        self.settle();
        Ok(())
    }

    /// Boots the controller in `slot` from its on-disk state.
    pub fn restart(&self, slot: NodeSlot) -> HaResult<Arc<HarnessNode>> {
        if self.node(slot).is_some() {
            return Err(HaError::failed(format!("controller {slot} is running")));
        }
        let root = self
            .roots
            .get(&slot)
            .ok_or_else(|| HaError::failed(format!("no root for controller {slot}")))?;
        let boot = {
            let mut boots = self.boots.lock().unwrap_or_else(PoisonError::into_inner);
            let boot = boots.entry(slot).or_default();
            *boot += 1;
            *boot
        };
        let node = HarnessNode::boot(slot, root, boot, &self.shelf, &self.fabric, &self.settings)?;
        self.nodes().insert(slot, node.clone());
        self.settle();
        Ok(node)
    }
}

impl Drop for HaPair {
    fn drop(&mut self) {
        let nodes: Vec<_> = std::mem::take(&mut *self.nodes()).into_values().collect();
        for node in nodes {
            self.fabric.unplug(node.slot);
            node.halt();
        }
    }
}

/// Polls `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}
