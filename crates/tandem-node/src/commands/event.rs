//! keepalived notify hook.

use anyhow::{Context, Result};
use tandem_config::TandemConfig;
use tandem_failover::VrrpEvent;
use tandem_peer::Request;
use tandem_types::VrrpState;
use tracing::info;

use tandem_node::system::record_vrrp_state;

/// Interface state as the role engine sees it; FAULT means the link is down.
fn interface_state(state: &str) -> VrrpState {
    match state.to_ascii_uppercase().as_str() {
        "MASTER" | "FORCETAKEOVER" | "FORCE_TAKEOVER" => VrrpState::Master,
        "BACKUP" => VrrpState::Backup,
        _ => VrrpState::Init,
    }
}

/// Records the new interface state and hands the event to the daemon.
pub fn run(config: &TandemConfig, interface: &str, state: &str) -> Result<()> {
    let event: VrrpEvent = state.parse()?;
    record_vrrp_state(&config.node.marker_dir, interface, interface_state(state))
        .with_context(|| format!("failed to record VRRP state of {interface}"))?;

    let client = super::local_client(config)?;
    client
        .call(Request::VrrpEvent {
            interface: interface.to_string(),
            event: state.to_string(),
        })
        .context("failed to deliver failover event")?;
    info!(interface, %event, "failover event delivered");
    Ok(())
}
