//! `tandemd serve`: wires the failover service to this controller.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tandem_config::TandemConfig;
use tandem_failover::{
    AlertRegistry, Dispatcher, EventHandler, FailoverService, FailoverSettings, PeerLink,
    PeerTargets, RoleAdapter,
};
use tandem_journal::ReplicatorSettings;
use tandem_peer::{InterlinkAuth, PeerClient, PeerServer, TcpTransport};
use tandem_target::{Rediscovery, TargetBackend, TargetFailoverEngine, TargetSettings};
use tandem_types::{NodeIdentity, NodeSlot};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::store::SqliteStore;
use crate::system::{SystemPaths, SystemPlatform};
use crate::targets::KernelTargets;

/// Written by the hardware probe at boot.
const SLOT_FILE: &str = "/etc/tandem/slot";
const EVENT_QUEUE: usize = 64;

/// Slot from the configuration, else from the hardware probe result.
fn resolve_slot(config: &TandemConfig, slot_file: &Path) -> Result<NodeSlot> {
    if let Some(slot) = config.node.slot_override()? {
        return Ok(slot);
    }
    match fs::read_to_string(slot_file) {
        Ok(text) => text
            .parse()
            .with_context(|| format!("invalid slot in {}", slot_file.display())),
        Err(e) => {
            warn!(path = %slot_file.display(), error = %e, "slot unknown, running as MANUAL");
            Ok(NodeSlot::Manual)
        }
    }
}

fn target_settings(config: &TandemConfig) -> TargetSettings {
    let targets = &config.targets;
    TargetSettings {
        failover_budget: std::time::Duration::from_secs(targets.failover_budget_secs),
        settle_retries: targets.settle_retries,
        settle_interval: std::time::Duration::from_millis(targets.settle_interval_ms),
        lun_wait: std::time::Duration::from_secs(targets.lun_wait_secs),
        rediscovery: Rediscovery::AsyncEvent,
        ..TargetSettings::default()
    }
}

async fn shutdown_signal() {
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = terminate => {}
    }
}

pub fn run(config: &TandemConfig) -> Result<()> {
    let slot = resolve_slot(config, Path::new(SLOT_FILE))?;
    let identity = NodeIdentity::new(slot, config.node.licensed);
    info!(%slot, data_dir = %config.node.data_dir.display(), "starting tandemd");

    let store = Arc::new(
        SqliteStore::open(&config.node.database_path)
            .context("Failed to open configuration database")?,
    );
    let system = SystemPlatform::new(
        SystemPaths::from_config(config),
        store.clone(),
        config.node.licensed,
    );
    system.clear_ready();
    let platform = system.platform();

    let transport = TcpTransport::new(
        config.peer.endpoint(),
        Some(config.peer.token.clone()),
        config.peer.connect_timeout(),
    )?;
    let peer = PeerClient::new(Arc::new(transport), config.peer.rpc_timeout());

    let group = match slot {
        NodeSlot::B => "controller_B",
        _ => "controller_A",
    };
    let backend: Arc<dyn TargetBackend> = Arc::new(KernelTargets::new(group));
    let targets = Arc::new(TargetFailoverEngine::new(
        target_settings(config),
        backend.clone(),
        Arc::new(PeerTargets(peer.clone())),
    ));

    let alerts = Arc::new(AlertRegistry::new());
    let service = FailoverService::new(
        identity,
        FailoverSettings::from_config(config),
        platform.clone(),
        peer.clone(),
        targets,
        alerts.clone(),
    );

    let (queue, _replicator) = tandem_journal::replicator::spawn(
        ReplicatorSettings {
            journal_path: config.node.journal_path.clone(),
            queue_capacity: config.journal.queue_capacity,
            retry_poll: config.journal.retry_poll(),
            recovery_sleep: config.journal.recovery_sleep(),
            local_version: platform.system.version(),
        },
        RoleAdapter(service.clone()),
        PeerLink(peer),
        alerts,
    )?;
    store.attach_journal(queue.clone());
    service.attach_journal(queue);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("tandemd")
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        tokio::spawn(EventHandler::new(service.clone()).run(events_rx));

        let dispatcher = Arc::new(Dispatcher::new(service.clone(), backend).with_events(events_tx));
        let auth = InterlinkAuth::new(
            &config.peer.interlink_addresses,
            Some(config.peer.token.clone()),
        )?;
        let server = PeerServer::bind(&config.peer.listen_endpoint(), dispatcher, auth)
            .await
            .with_context(|| format!("Failed to bind {}", config.peer.listen_endpoint()))?;

        system.mark_ready()?;
        let startup = service.clone();
        tokio::task::spawn_blocking(move || {
            startup.on_system_ready();
            match startup.setup_ha() {
                Ok(outcome) => info!(?outcome, "HA setup checked"),
                Err(e) => warn!(error = %e, "HA setup failed"),
            }
        });
        tokio::spawn(watch_peer(service.clone(), config.failover.peer_watch()));

        server.serve(shutdown_signal()).await?;
        anyhow::Ok(())
    })?;

    system.clear_ready();
    info!("tandemd stopped");
    Ok(())
}

/// Runs the peer reachability check every `period`.
async fn watch_peer(service: Arc<FailoverService>, period: Duration) {
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticks.tick().await;
        let service = service.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || service.watch_peer()).await {
            warn!(error = %e, "peer watch task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_configured_slot_wins() {
        let mut config = TandemConfig::default();
        config.node.slot = "B".to_string();
        let slot = resolve_slot(&config, Path::new("/nonexistent/slot")).unwrap();
        assert_eq!(slot, NodeSlot::B);
    }

    #[test]
    fn test_probed_slot_read_from_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("slot");
        fs::write(&file, "A\n").unwrap();
        let slot = resolve_slot(&TandemConfig::default(), &file).unwrap();
        assert_eq!(slot, NodeSlot::A);

        fs::write(&file, "Z\n").unwrap();
        assert!(resolve_slot(&TandemConfig::default(), &file).is_err());
    }

    #[test]
    fn test_missing_probe_runs_manual() {
        let slot = resolve_slot(&TandemConfig::default(), Path::new("/nonexistent/slot")).unwrap();
        assert_eq!(slot, NodeSlot::Manual);
    }

    #[test]
    fn test_target_settings_from_config() {
        let mut config = TandemConfig::default();
        config.targets.settle_interval_ms = 250;
        let settings = target_settings(&config);
        assert_eq!(settings.settle_interval, std::time::Duration::from_millis(250));
        assert_eq!(settings.settle_retries, 10);
    }
}
