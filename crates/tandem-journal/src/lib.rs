//! # tandem-journal: Configuration journal for the Tandem HA pair
//!
//! Every persistent configuration mutation made on the MASTER is replayed on
//! the standby in the order it was committed. This crate provides:
//! - [`Journal`]: crash-safe on-disk queue of mutations the peer has not
//!   acknowledged yet (length-prefixed, CRC-checked frames, atomic rewrite)
//! - [`replicator`]: the single worker thread draining the journal to the peer
//! - [`WatermarkStore`]: the standby's record of what it already applied, so
//!   redelivered entries are acknowledged without being executed twice

use std::path::PathBuf;

use tandem_types::WriteSequence;

pub mod checksum;
mod frame;
mod journal;
pub mod replicator;
mod watermark;

pub use frame::{FileHeader, JournalEntry};
pub use journal::Journal;
pub use replicator::{
    AlertSink, Flow, JournalQueue, JournalSync, LinkError, QueueItem, ReplicaLink,
    ReplicatorSettings, RoleSource,
};
pub use watermark::{Admission, Watermark, WatermarkStore};

/// Errors that can occur in journal operations.
#[derive(thiserror::Error, Debug)]
pub enum JournalError {
    #[error("journal I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unexpected end of journal data")]
    UnexpectedEof,

    #[error("corrupted journal frame at {sequence}: CRC mismatch")]
    CorruptedFrame { sequence: WriteSequence },

    #[error("torn write detected: {reason}")]
    TornWrite { reason: String },

    #[error("invalid journal header: {0}")]
    BadHeader(String),

    #[error("journal frame of {len} bytes exceeds the format limit")]
    FrameTooLarge { len: usize },

    #[error("failed to encode journal entry: {0}")]
    Encode(postcard::Error),

    #[error("failed to decode journal entry: {0}")]
    Decode(postcard::Error),

    #[error("replay watermark: {0}")]
    Watermark(String),

    #[error("journal replicator is not running")]
    WorkerStopped,

    #[error("database push failed: {0}")]
    PushFailed(#[from] LinkError),
}
