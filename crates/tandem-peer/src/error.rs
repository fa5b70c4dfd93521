//! Peer transport error types.

use std::io;
use std::time::Duration;

use tandem_types::Errno;
use thiserror::Error;

use crate::wire::{RemoteError, WireError};

/// Result type for peer calls.
pub type PeerResult<T> = Result<T, PeerError>;

#[derive(Debug, Error)]
pub enum PeerError {
    /// The peer refused, reset or could not be routed to.
    #[error("peer unreachable ({errno}): {reason}")]
    Unreachable { errno: Errno, reason: String },

    #[error("call {method} timed out after {timeout:?}")]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// The remote handler ran and failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("unexpected reply to {method}: got {got}")]
    UnexpectedReply {
        method: &'static str,
        got: &'static str,
    },

    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl PeerError {
    /// Classifies a socket error, mapping the "node is down" family to
    /// [`PeerError::Unreachable`].
    pub fn from_io(error: io::Error) -> Self {
        let errno = match error.kind() {
            io::ErrorKind::ConnectionRefused => Some(Errno::Econnrefused),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::NetworkDown
            | io::ErrorKind::AddrNotAvailable => Some(Errno::Ehostdown),
            _ => None,
        };
        match errno {
            Some(errno) => PeerError::Unreachable {
                errno,
                reason: error.to_string(),
            },
            None => PeerError::Io(error),
        }
    }

    /// Connection refused, reset, or host down.
    pub fn is_peer_down(&self) -> bool {
        match self {
            PeerError::Unreachable { .. } | PeerError::ConnectionClosed => true,
            PeerError::Remote(remote) => matches!(
                remote.errno,
                Some(Errno::Econnrefused | Errno::Ehostdown)
            ),
            _ => false,
        }
    }

    /// Stable error code, when one applies.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            PeerError::Unreachable { errno, .. } => Some(*errno),
            PeerError::Timeout { .. } => Some(Errno::Etimedout),
            PeerError::ConnectionClosed => Some(Errno::Ehostdown),
            PeerError::Remote(remote) => remote.errno,
            _ => None,
        }
    }

    /// Converts to the error reported back to a remote caller.
    pub fn into_remote(self) -> RemoteError {
        match self {
            PeerError::Remote(remote) => remote,
            other => RemoteError {
                errno: other.errno(),
                message: other.to_string(),
            },
        }
    }
}
