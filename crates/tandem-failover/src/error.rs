//! Error type shared by every failover operation.

use std::time::Duration;

use tandem_journal::JournalError;
use tandem_peer::{PeerError, RemoteError};
use tandem_target::TargetError;
use tandem_types::{Errno, HaStatus};
use thiserror::Error;

pub type HaResult<T> = Result<T, HaError>;

#[derive(Debug, Error)]
pub enum HaError {
    /// The operation needs a different local role.
    #[error("operation requires {required} but this node is {actual}")]
    WrongRole {
        required: &'static str,
        actual: HaStatus,
    },

    #[error("{0}")]
    Validation(String),

    #[error("{what} did not complete within {waited:?}")]
    Timeout { what: String, waited: Duration },

    /// Another job holds the named lock.
    #[error("job {0} is already running")]
    Busy(&'static str),

    #[error("fencing failed: {0}")]
    Fencing(String),

    #[error("platform: {0}")]
    Platform(String),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("{message}")]
    Failed {
        errno: Option<Errno>,
        message: String,
    },
}

impl HaError {
    pub fn failed(message: impl Into<String>) -> Self {
        HaError::Failed {
            errno: None,
            message: message.into(),
        }
    }

    pub fn with_errno(errno: Errno, message: impl Into<String>) -> Self {
        HaError::Failed {
            errno: Some(errno),
            message: message.into(),
        }
    }

    pub fn platform(message: impl std::fmt::Display) -> Self {
        HaError::Platform(message.to_string())
    }

    /// Stable code reported to callers.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            HaError::WrongRole { .. } => Some(Errno::Eperm),
            HaError::Validation(_) => Some(Errno::Einval),
            HaError::Timeout { .. } => Some(Errno::Etimedout),
            HaError::Busy(_) => Some(Errno::Ebusy),
            HaError::Peer(e) => e.errno(),
            HaError::Target(TargetError::NotFound(_)) => Some(Errno::Enoent),
            HaError::Target(TargetError::InUse { .. }) => Some(Errno::Ebusy),
            HaError::Target(TargetError::Timeout { .. }) => Some(Errno::Etimedout),
            HaError::Failed { errno, .. } => *errno,
            _ => None,
        }
    }

    pub fn is_peer_down(&self) -> bool {
        matches!(self, HaError::Peer(e) if e.is_peer_down())
    }

    pub fn into_remote(self) -> RemoteError {
        match self {
            HaError::Peer(e) => e.into_remote(),
            other => RemoteError {
                errno: other.errno(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(HaError::Timeout { what: "standby reboot".into(), waited: Duration::from_secs(90) } => Some(Errno::Etimedout))]
    #[test_case(HaError::Busy("failover_upgrade") => Some(Errno::Ebusy))]
    #[test_case(HaError::Validation("bad".into()) => Some(Errno::Einval))]
    #[test_case(HaError::failed("Standby Controller failed to reboot.") => None)]
    fn test_errno(err: HaError) -> Option<Errno> {
        err.errno()
    }

    #[test]
    fn test_wrong_role_message() {
        let err = HaError::WrongRole {
            required: "MASTER",
            actual: HaStatus::Backup,
        };
        assert_eq!(err.to_string(), "operation requires MASTER but this node is BACKUP");
        assert_eq!(err.into_remote().errno, Some(Errno::Eperm));
    }
}
