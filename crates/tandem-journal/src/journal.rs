//! The journal store.
//!
//! Holds the mutations the peer has not acknowledged yet, in enqueue order,
//! plus the bytes last persisted so unchanged journals are never rewritten.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tandem_types::{JournalGeneration, SqlParam, WriteSequence};
use tracing::{debug, warn};

use crate::JournalError;
use crate::frame::{FileHeader, JournalEntry, decode_file};

#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    generation: JournalGeneration,
    next_sequence: WriteSequence,
    entries: VecDeque<JournalEntry>,
    persisted: Option<Vec<u8>>,
}

impl Journal {
    /// Opens the journal at `path`, starting empty when the file is missing
    /// or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::load(&path) {
            Ok(journal) => journal,
            Err(JournalError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                debug!(path = %path.display(), "no journal on disk, starting empty");
                Self::empty(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unable to read journal, starting empty");
                Self::empty(path)
            }
        }
    }

    /// Loads the journal at `path`, failing on any I/O or format error.
    pub fn load(path: &Path) -> Result<Self, JournalError> {
        let raw = fs::read(path).map_err(|source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let (header, entries) = decode_file(Bytes::from(raw.clone()))?;
        Ok(Self {
            path: path.to_path_buf(),
            generation: header.generation,
            next_sequence: header.next_sequence,
            entries: entries.into(),
            persisted: Some(raw),
        })
    }

    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            generation: JournalGeneration::mint(),
            next_sequence: WriteSequence::new(1),
            entries: VecDeque::new(),
            persisted: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn generation(&self) -> JournalGeneration {
        self.generation
    }

    pub fn next_sequence(&self) -> WriteSequence {
        self.next_sequence
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &JournalEntry> {
        self.entries.iter()
    }

    /// Oldest entry not yet acknowledged.
    pub fn peek(&self) -> Option<&JournalEntry> {
        self.entries.front()
    }

    /// Drops the oldest entry after the peer acknowledged it.
    pub fn shift(&mut self) -> Option<JournalEntry> {
        self.entries.pop_front()
    }

    /// Appends a mutation, stamping it with the next sequence of the current generation.
    pub fn append(&mut self, sql: impl Into<String>, params: Vec<SqlParam>) -> &JournalEntry {
        let sequence = self.next_sequence;
        self.next_sequence = sequence.next();
        self.entries.push_back(JournalEntry {
            generation: self.generation,
            sequence,
            sql: sql.into(),
            params,
        });
        &self.entries[self.entries.len() - 1]
    }

    /// Drops every entry; sequence numbering continues.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops every entry and starts `generation` at sequence 1.
    ///
    /// Used when the whole database is pushed to the peer.
    pub fn reset(&mut self, generation: JournalGeneration) {
        self.entries.clear();
        self.generation = generation;
        self.next_sequence = WriteSequence::new(1);
    }

    /// Encodes header and entries exactly as [`Journal::write`] persists them.
    pub fn encode(&self) -> Result<Vec<u8>, JournalError> {
        let count = u32::try_from(self.entries.len()).map_err(|_| JournalError::FrameTooLarge {
            len: self.entries.len(),
        })?;
        let mut buf = Vec::with_capacity(FileHeader::size() + self.entries.len() * 64);
        FileHeader {
            generation: self.generation,
            next_sequence: self.next_sequence,
            count,
        }
        .encode_into(&mut buf);
        for entry in &self.entries {
            entry.encode_into(&mut buf)?;
        }
        Ok(buf)
    }

    /// Persists the journal if it changed since the last write.
    ///
    /// Writes `<path>.tmp`, syncs it, then renames it over `path`. Returns
    /// whether anything was written.
    pub fn write(&mut self) -> Result<bool, JournalError> {
        let encoded = self.encode()?;
        if self.persisted.as_deref() == Some(encoded.as_slice()) {
            return Ok(false);
        }

        let io_err = |source| JournalError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp = tmp_path(&self.path);
        {
            let mut file = File::create(&tmp).map_err(io_err)?;
            file.write_all(&encoded).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, &self.path).map_err(io_err)?;

        debug!(entries = self.entries.len(), bytes = encoded.len(), "journal persisted");
        self.persisted = Some(encoded);
        Ok(true)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
