//! # tandem-peer: Interlink RPC between the two controllers
//!
//! - [`wire`]: frame format and the request/reply vocabulary
//! - [`client`]: typed outbound calls over a pluggable [`PeerTransport`]
//! - [`server`]: the listener that authenticates and dispatches inbound calls
//!
//! Calls from the other controller arrive on a privileged source port from an
//! interlink address. Everyone else must present the configured token.

mod client;
mod error;
mod server;
pub mod wire;

pub use client::{FILE_CHUNK_SIZE, PeerClient, PeerTransport, TcpTransport, decode_chunk};
pub use error::{PeerError, PeerResult};
pub use server::{InterlinkAuth, PeerServer, Principal, RequestHandler, Session};
pub use wire::{RemoteError, Reply, Request, RequestEnvelope, Response};
