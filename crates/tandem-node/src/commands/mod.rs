//! CLI command implementations.

pub mod config;
pub mod event;
pub mod status;

use std::sync::Arc;

use anyhow::{Result, bail};
use tandem_config::TandemConfig;
use tandem_peer::{PeerClient, TcpTransport};

/// Client for the daemon running on this controller.
///
/// Local callers authenticate with the shared token; only the other
/// controller is trusted by source address.
pub fn local_client(config: &TandemConfig) -> Result<PeerClient> {
    if config.peer.token.is_empty() {
        bail!("peer.token must be set to talk to the local daemon");
    }
    let endpoint = format!("127.0.0.1:{}", config.peer.port);
    let transport = TcpTransport::new(
        endpoint,
        Some(config.peer.token.clone()),
        config.peer.connect_timeout(),
    )?;
    Ok(PeerClient::new(Arc::new(transport), config.peer.rpc_timeout()))
}
