//! Whole-database pushes, replayed writes, and file shipping.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::PoisonError;

use tandem_journal::{Admission, JournalEntry};
use tandem_peer::{PeerClient, PeerResult, decode_chunk};
use tandem_types::{Errno, JournalGeneration, WriteSequence};
use tracing::{debug, info, warn};

use crate::service::FailoverService;
use crate::{HaError, HaResult};

/// Where the peer stages an incoming database copy.
pub fn sync_path(database: &Path) -> PathBuf {
    let mut path: OsString = database.as_os_str().to_owned();
    path.push(".sync");
    PathBuf::from(path)
}

/// Ships `database` to the peer's staging path and has the peer install it
/// as the start of `generation`. Returns false if `database` is missing.
pub(crate) fn ship_database(
    peer: &PeerClient,
    database: &Path,
    generation: JournalGeneration,
) -> PeerResult<bool> {
    if !peer.send_file(database, &sync_path(database))? {
        return Ok(false);
    }
    peer.receive_database(generation)?;
    Ok(true)
}

impl FailoverService {
    /// `failover.send_database`
    ///
    /// Ships the database file and has the peer install it under a fresh
    /// generation. With a replicator attached the push runs on its thread,
    /// after every write queued before it, and restarts the journal.
    pub fn send_database(&self) -> HaResult<()> {
        let database = self.platform.datastore.path();
        if let Some(queue) = self.journal.get() {
            let generation = queue.full_push(&database)?;
            info!(%generation, "database pushed to peer through the journal");
            return Ok(());
        }
        let generation = JournalGeneration::mint();
        if !ship_database(&self.peer, &database, generation)? {
            return Err(HaError::with_errno(
                Errno::Enoent,
                format!("database {} does not exist", database.display()),
            ));
        }
        info!(%generation, "database pushed to peer");
        Ok(())
    }

    /// `failover.receive_database`
    pub fn receive_database(&self, generation: JournalGeneration) -> HaResult<()> {
        let staged = sync_path(&self.platform.datastore.path());
        if !staged.exists() {
            return Err(HaError::with_errno(
                Errno::Enoent,
                format!("{} was not received", staged.display()),
            ));
        }
        let mut watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner);
        self.platform.datastore.install(&staged)?;
        watermark.record(generation, WriteSequence::ZERO)?;
        info!(%generation, "database received from peer");
        Ok(())
    }

    /// `datastore.sql`: replays one write from the MASTER.
    ///
    /// Entries at or below the watermark were applied before, and entries
    /// from a generation older than the last pushed database were
    /// superseded by it. Both are acknowledged without executing.
    pub fn apply_replicated_write(&self, entry: &JournalEntry) -> HaResult<()> {
        let mut watermark = self.watermark.lock().unwrap_or_else(PoisonError::into_inner);
        match watermark.admit(entry.generation, entry.sequence) {
            Admission::Duplicate => {
                debug!(generation = %entry.generation, sequence = %entry.sequence, "duplicate write acknowledged");
                Ok(())
            }
            Admission::Stale => {
                warn!(
                    generation = %entry.generation,
                    sequence = %entry.sequence,
                    sql = %entry.sql,
                    "write from a superseded generation dropped"
                );
                Ok(())
            }
            Admission::Apply => {
                self.platform.datastore.execute(&entry.sql, &entry.params)?;
                watermark.record(entry.generation, entry.sequence)?;
                Ok(())
            }
        }
    }

    /// `filesystem.file_receive`
    pub fn file_receive(&self, path: &Path, chunk: &str, mode: u32, append: bool) -> HaResult<()> {
        let data = decode_chunk(chunk)
            .map_err(|e| HaError::Validation(format!("invalid file chunk: {e}")))?;
        let io = |e: std::io::Error| HaError::platform(format!("{}: {e}", path.display()));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(io)?;
        file.write_all(&data).map_err(io)?;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)).map_err(io)?;
        Ok(())
    }

    /// `failover.sync_to_peer`
    ///
    /// Pushes the database, the key cache and the node secrets to the
    /// standby, optionally rebooting it afterwards.
    pub fn sync_to_peer(&self, reboot: bool) -> HaResult<()> {
        self.send_database()?;
        self.sync_keys_to_remote_node();

        let mut files = vec![
            self.settings.license_path.clone(),
            self.settings.pwenc_secret_path.clone(),
        ];
        files.extend(self.settings.authorized_keys_paths.iter().cloned());
        for file in &files {
            if !self.peer.send_file(file, file)? {
                debug!(path = %file.display(), "not present, skipped");
            }
        }

        if reboot {
            warn!("rebooting standby after sync");
            self.peer.reboot(self.settings.sync_reboot_delay.as_secs())?;
        }
        Ok(())
    }

    /// `failover.sync_from_peer`: has the peer push its state here.
    pub fn sync_from_peer(&self) -> HaResult<()> {
        self.peer.sync_to_peer(false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use base64::Engine;
    use tandem_peer::Request;
    use tandem_types::SqlParam;

    use super::*;
    use crate::testing::{ScriptedPeer, fixture, healthy_backup};

    fn entry(generation: u64, sequence: u64, sql: &str) -> JournalEntry {
        JournalEntry {
            generation: JournalGeneration::new(generation),
            sequence: WriteSequence::new(sequence),
            sql: sql.to_string(),
            params: vec![SqlParam::Integer(1)],
        }
    }

    #[test]
    fn test_sync_path() {
        assert_eq!(
            sync_path(Path::new("/data/tandem.db")),
            PathBuf::from("/data/tandem.db.sync")
        );
    }

    #[test]
    fn test_redelivered_write_applied_once() {
        let fx = fixture(ScriptedPeer::down());
        fx.service.apply_replicated_write(&entry(7, 1, "A")).unwrap();
        fx.service.apply_replicated_write(&entry(7, 2, "B")).unwrap();
        fx.service.apply_replicated_write(&entry(7, 2, "B")).unwrap();
        fx.service.apply_replicated_write(&entry(7, 1, "A")).unwrap();
        assert_eq!(fx.node.state().executed, vec!["A", "B"]);
    }

    #[test]
    fn test_receive_database_starts_generation() {
        let fx = fixture(ScriptedPeer::down());
        let db = fx.node.state().db_path.clone();
        assert!(fx.service.receive_database(JournalGeneration::new(9)).is_err());

        fs::write(sync_path(&db), b"db").unwrap();
        fx.service.receive_database(JournalGeneration::new(9)).unwrap();
        assert_eq!(fx.node.state().installed, vec![sync_path(&db)]);

        fx.service.apply_replicated_write(&entry(9, 1, "after push")).unwrap();
        assert_eq!(fx.node.state().executed, vec!["after push"]);
    }

    #[test]
    fn test_write_from_older_generation_after_push_is_dropped() {
        let fx = fixture(ScriptedPeer::down());
        let db = fx.node.state().db_path.clone();
        fx.service.apply_replicated_write(&entry(7, 4, "before push")).unwrap();

        fs::write(sync_path(&db), b"db").unwrap();
        fx.service.receive_database(JournalGeneration::new(9)).unwrap();

        // A late redelivery from the superseded journal must not run on top
        // of the pushed database.
        fx.service.apply_replicated_write(&entry(7, 5, "late")).unwrap();
        fx.service.apply_replicated_write(&entry(9, 1, "post push")).unwrap();
        assert_eq!(fx.node.state().executed, vec!["before push", "post push"]);
    }

    #[test]
    fn test_file_receive_appends_and_sets_mode() {
        let fx = fixture(ScriptedPeer::down());
        let path = fx.dir.path().join("nested/pwenc_secret");
        let encode = |b: &[u8]| base64::engine::general_purpose::STANDARD.encode(b);
        fx.service.file_receive(&path, &encode(b"abc"), 0o100600, false).unwrap();
        fx.service.file_receive(&path, &encode(b"def"), 0o100600, true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcdef");
        assert_eq!(fs::metadata(&path).unwrap().permissions().mode() & 0o777, 0o600);

        fx.service.file_receive(&path, &encode(b"x"), 0o600, false).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"x");
    }

    #[test]
    fn test_sync_to_peer_ships_database_and_secrets() {
        let fx = fixture(ScriptedPeer::new(healthy_backup));
        fs::write(fx.node.state().db_path.clone(), b"db").unwrap();
        fs::write(fx.dir.path().join("license"), b"lic").unwrap();

        fx.service.sync_to_peer(true).unwrap();

        let calls = fx.peer.calls();
        let shipped: Vec<PathBuf> = calls
            .iter()
            .filter_map(|c| match c {
                Request::FileReceive { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect();
        let db = fx.node.state().db_path.clone();
        assert_eq!(shipped, vec![sync_path(&db), fx.dir.path().join("license")]);
        assert!(calls.iter().any(|c| matches!(c, Request::ReceiveDatabase { .. })));
        assert_eq!(calls.last(), Some(&Request::SystemReboot { delay_secs: 2 }));
    }
}
