//! Journal replicator.
//!
//! The datastore calls [`JournalQueue::post_execute_write`] after every
//! committed write. A single worker thread moves queued writes into the
//! [`Journal`], persists it, and drains it to the peer in order. Entries
//! leave the journal only after the peer acknowledged them, so delivery is
//! at-least-once across peer outages and local restarts.
//!
//! Full database pushes run on the same thread, so no journal entry from an
//! older generation can reach the peer after the database that supersedes it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tandem_types::{AlertKind, HaStatus, JournalGeneration, SqlParam};
use tracing::{debug, error, info, trace, warn};

use crate::JournalError;
use crate::frame::JournalEntry;
use crate::journal::Journal;

// ============================================================================
// Collaborators
// ============================================================================

/// Failure talking to the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// Connection refused, reset, or host down. Retried silently.
    #[error("peer unreachable: {0}")]
    PeerDown(String),
    #[error("{0}")]
    Failed(String),
}

/// Source of the local role, refreshed on every call.
pub trait RoleSource: Send {
    fn current_status(&self) -> HaStatus;

    /// Newest generation this node applied as a standby, if any.
    fn applied_generation(&self) -> Option<JournalGeneration> {
        None
    }
}

/// The peer as seen by the replicator.
pub trait ReplicaLink: Send {
    /// Software version reported by the peer.
    fn remote_version(&self) -> Result<String, LinkError>;

    /// Replays one entry on the peer (`datastore.sql`).
    fn apply(&self, entry: &JournalEntry) -> Result<(), LinkError>;

    /// Ships the database file and has the peer install it as the start of
    /// `generation`.
    fn push_database(
        &self,
        database: &Path,
        generation: JournalGeneration,
    ) -> Result<(), LinkError>;
}

/// Raises and clears one-shot alerts.
pub trait AlertSink: Send + Sync {
    fn raise(&self, kind: AlertKind, message: String);
    fn clear(&self, kind: AlertKind);
}

impl<T: AlertSink + ?Sized> AlertSink for Arc<T> {
    fn raise(&self, kind: AlertKind, message: String) {
        (**self).raise(kind, message);
    }

    fn clear(&self, kind: AlertKind) {
        (**self).clear(kind);
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug)]
pub enum QueueItem {
    Write { sql: String, params: Vec<SqlParam> },
    /// Push the whole database; on success the journal restarts at a fresh
    /// generation, which is sent back on `done`.
    FullPush {
        database: PathBuf,
        done: SyncSender<Result<JournalGeneration, LinkError>>,
    },
}

/// Producer side of the replicator. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JournalQueue {
    tx: SyncSender<QueueItem>,
}

impl JournalQueue {
    /// Enqueues a committed write. Blocks while the queue is full.
    pub fn post_execute_write(
        &self,
        sql: impl Into<String>,
        params: Vec<SqlParam>,
    ) -> Result<(), JournalError> {
        self.tx
            .send(QueueItem::Write {
                sql: sql.into(),
                params,
            })
            .map_err(|_| JournalError::WorkerStopped)
    }

    /// Has the worker push `database` to the peer, after every write queued
    /// before this call. Blocks until the push finished.
    pub fn full_push(
        &self,
        database: impl Into<PathBuf>,
    ) -> Result<JournalGeneration, JournalError> {
        let (done, result) = mpsc::sync_channel(1);
        self.tx
            .send(QueueItem::FullPush {
                database: database.into(),
                done,
            })
            .map_err(|_| JournalError::WorkerStopped)?;
        let generation = result.recv().map_err(|_| JournalError::WorkerStopped)??;
        Ok(generation)
    }
}

// ============================================================================
// Worker
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReplicatorSettings {
    pub journal_path: PathBuf,
    pub queue_capacity: usize,
    /// Wait for new writes while the peer is not in sync.
    pub retry_poll: Duration,
    /// Pause before rebuilding after an unexpected error.
    pub recovery_sleep: Duration,
    /// Software version of this node, compared against the peer's.
    pub local_version: String,
}

/// Whether the worker keeps running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Every producer is gone.
    Stop,
}

pub struct JournalSync<R, L, A> {
    settings: ReplicatorSettings,
    journal: Journal,
    rx: Receiver<QueueItem>,
    role: R,
    link: L,
    alerts: A,
    status: HaStatus,
    /// Only affects logging.
    last_query_failed: bool,
    version_mismatch_raised: bool,
    /// Role seen on the previous pass.
    was_master: bool,
}

/// Creates the queue and the worker without starting it.
pub fn channel<R, L, A>(
    settings: ReplicatorSettings,
    role: R,
    link: L,
    alerts: A,
) -> (JournalQueue, JournalSync<R, L, A>)
where
    R: RoleSource,
    L: ReplicaLink,
    A: AlertSink,
{
    let (tx, rx) = mpsc::sync_channel(settings.queue_capacity.max(1));
    let journal = Journal::open(&settings.journal_path);
    let status = role.current_status();
    let worker = JournalSync {
        settings,
        journal,
        rx,
        role,
        link,
        alerts,
        status,
        last_query_failed: false,
        version_mismatch_raised: false,
        was_master: false,
    };
    (JournalQueue { tx }, worker)
}

/// Starts the replicator on a dedicated thread.
pub fn spawn<R, L, A>(
    settings: ReplicatorSettings,
    role: R,
    link: L,
    alerts: A,
) -> Result<(JournalQueue, JoinHandle<()>), JournalError>
where
    R: RoleSource + 'static,
    L: ReplicaLink + 'static,
    A: AlertSink + 'static,
{
    let (queue, worker) = channel(settings, role, link, alerts);
    let handle = thread::Builder::new()
        .name("journal-sync".to_string())
        .spawn(move || worker.run())
        .map_err(|source| JournalError::Io {
            path: PathBuf::from("journal-sync"),
            source,
        })?;
    Ok((queue, handle))
}

impl<R, L, A> JournalSync<R, L, A>
where
    R: RoleSource,
    L: ReplicaLink,
    A: AlertSink,
{
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Runs until every [`JournalQueue`] is dropped.
    pub fn run(mut self) {
        info!(path = %self.settings.journal_path.display(), "journal replicator started");
        loop {
            match self.process() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    info!("journal replicator stopped");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "failed to sync journal");
                    thread::sleep(self.settings.recovery_sleep);
                    self.journal = Journal::open(&self.settings.journal_path);
                }
            }
        }
    }

    /// One pass: drain to the peer, absorb queued writes, persist.
    ///
    /// Waits up to `retry_poll` for the next write, so role changes are
    /// noticed even when nothing is written.
    pub fn process(&mut self) -> Result<Flow, JournalError> {
        self.status = self.role.current_status();
        if self.status != HaStatus::Master && !self.journal.is_empty() {
            warn!(
                status = %self.status,
                entries = self.journal.len(),
                "node is not MASTER but has queries in journal"
            );
            self.journal.clear();
        }
        self.note_role();

        let had_entries = !self.journal.is_empty();
        let flushed = self.flush();
        if had_entries {
            self.status = self.role.current_status();
        }
        self.persist()?;
        if !flushed {
            trace!(entries = self.journal.len(), "journal not drained, polling");
        }

        let flow = match self.receive(self.settings.retry_poll) {
            Received::Item(item) => {
                self.status = self.role.current_status();
                self.note_role();
                self.handle(item);
                self.consume_nonblocking()
            }
            Received::Nothing => Flow::Continue,
            Received::Disconnected => Flow::Stop,
        };

        self.persist()?;
        Ok(flow)
    }

    /// On becoming MASTER with nothing pending, starts a generation newer
    /// than anything this node wrote or applied, so the peer's watermark
    /// never treats the new writes as stale.
    fn note_role(&mut self) {
        let is_master = self.status == HaStatus::Master;
        if is_master && !self.was_master && self.journal.is_empty() {
            let floor = self
                .role
                .applied_generation()
                .max(Some(self.journal.generation()));
            let generation = JournalGeneration::mint_after(floor);
            debug!(%generation, "became MASTER, starting journal generation");
            self.journal.reset(generation);
        }
        self.was_master = is_master;
    }

    fn flush(&mut self) -> bool {
        if self.journal.is_empty() {
            return true;
        }
        if !self.remote_version_matches() {
            return false;
        }

        while let Some(entry) = self.journal.peek() {
            match self.link.apply(entry) {
                Ok(()) => {
                    self.last_query_failed = false;
                    self.alerts.clear(AlertKind::FailoverSyncFailed);
                    self.journal.shift();
                }
                Err(LinkError::PeerDown(reason)) => {
                    trace!(%reason, "skipping journal sync, node down");
                    return false;
                }
                Err(LinkError::Failed(reason)) => {
                    if !self.last_query_failed {
                        error!(
                            sql = %entry.sql,
                            sequence = %entry.sequence,
                            error = %reason,
                            "failed to replay query on peer"
                        );
                        self.last_query_failed = true;
                    }
                    self.alerts.raise(
                        AlertKind::FailoverSyncFailed,
                        format!("Failed to sync configuration to the standby: {reason}"),
                    );
                    return false;
                }
            }
        }
        true
    }

    fn remote_version_matches(&mut self) -> bool {
        match self.link.remote_version() {
            Ok(remote) if remote == self.settings.local_version => {
                self.alerts.clear(AlertKind::RemoteVersionUnknown);
                if self.version_mismatch_raised {
                    self.alerts.clear(AlertKind::RemoteVersionMismatch);
                    self.version_mismatch_raised = false;
                }
                true
            }
            Ok(remote) => {
                if !self.version_mismatch_raised {
                    warn!(
                        local = %self.settings.local_version,
                        %remote,
                        "peer runs a different version, pausing journal"
                    );
                    self.alerts.raise(
                        AlertKind::RemoteVersionMismatch,
                        format!(
                            "Standby runs {remote} while this node runs {}",
                            self.settings.local_version
                        ),
                    );
                    self.version_mismatch_raised = true;
                }
                false
            }
            Err(LinkError::PeerDown(reason)) => {
                trace!(%reason, "peer down, journal sync paused");
                false
            }
            Err(LinkError::Failed(reason)) => {
                debug!(%reason, "unable to read peer version");
                self.alerts.raise(
                    AlertKind::RemoteVersionUnknown,
                    format!("Cannot determine the software version of the standby: {reason}"),
                );
                false
            }
        }
    }

    fn receive(&self, timeout: Duration) -> Received {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Received::Item(item),
            Err(RecvTimeoutError::Timeout) => Received::Nothing,
            Err(RecvTimeoutError::Disconnected) => Received::Disconnected,
        }
    }

    fn consume_nonblocking(&mut self) -> Flow {
        loop {
            match self.rx.try_recv() {
                Ok(item) => self.handle(item),
                Err(TryRecvError::Empty) => return Flow::Continue,
                Err(TryRecvError::Disconnected) => return Flow::Stop,
            }
        }
    }

    fn handle(&mut self, item: QueueItem) {
        match item {
            QueueItem::FullPush { database, done } => {
                let result = self.push_database(&database);
                if done.send(result).is_err() {
                    debug!("full push requester went away");
                }
            }
            QueueItem::Write { sql, params } => match self.status {
                HaStatus::Single => {}
                HaStatus::Master => {
                    self.journal.append(sql, params);
                }
                status => {
                    warn!(%status, %sql, "node is not MASTER but executed SQL query");
                }
            },
        }
    }

    /// Pushes the database and restarts the journal at the new generation.
    /// On failure the journal is kept, so nothing already queued is lost.
    fn push_database(&mut self, database: &Path) -> Result<JournalGeneration, LinkError> {
        let generation = JournalGeneration::mint_after(Some(self.journal.generation()));
        match self.link.push_database(database, generation) {
            Ok(()) => {
                info!(
                    %generation,
                    superseded = self.journal.len(),
                    "database pushed, journal reset"
                );
                self.journal.reset(generation);
                self.alerts.clear(AlertKind::FailoverSyncFailed);
                Ok(generation)
            }
            Err(e) => {
                warn!(error = %e, "failed to push database to peer");
                Err(e)
            }
        }
    }

    fn persist(&mut self) -> Result<(), JournalError> {
        match self.journal.write() {
            Ok(_) => Ok(()),
            Err(JournalError::Io { path, source }) => {
                warn!(path = %path.display(), error = %source, "failed to write journal");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

enum Received {
    Item(QueueItem),
    Nothing,
    Disconnected,
}
