//! Receiver-side record of the last replayed journal entry.
//!
//! Lets the standby acknowledge redelivered entries without applying them twice.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tandem_types::{JournalGeneration, WriteSequence};
use tracing::warn;

use crate::JournalError;

/// Outcome of offering an entry to the watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Apply,
    /// Already applied; acknowledge without executing.
    Duplicate,
    /// From a generation older than the one last applied, i.e. superseded
    /// by a full database push. Acknowledge without executing.
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
    last: Option<(JournalGeneration, WriteSequence)>,
}

impl Watermark {
    pub fn admit(&self, generation: JournalGeneration, sequence: WriteSequence) -> Admission {
        match self.last {
            Some((g, _)) if generation < g => Admission::Stale,
            Some((g, s)) if g == generation && sequence <= s => Admission::Duplicate,
            _ => Admission::Apply,
        }
    }

    pub fn record(&mut self, generation: JournalGeneration, sequence: WriteSequence) {
        self.last = Some((generation, sequence));
    }

    pub fn last(&self) -> Option<(JournalGeneration, WriteSequence)> {
        self.last
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    /// Hex, since TOML integers are signed.
    generation: String,
    sequence: u64,
}

/// A [`Watermark`] persisted as a small TOML file next to the database.
#[derive(Debug)]
pub struct WatermarkStore {
    path: PathBuf,
    current: Watermark,
}

impl WatermarkStore {
    /// Opens the store; a missing or unreadable file means nothing applied yet.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match Self::read(&path) {
            Ok(current) => current,
            Err(e) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %e, "discarding unreadable replay watermark");
                }
                Watermark::default()
            }
        };
        Self { path, current }
    }

    fn read(path: &Path) -> Result<Watermark, JournalError> {
        let text = fs::read_to_string(path).map_err(|source| JournalError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: WatermarkFile =
            toml::from_str(&text).map_err(|e| JournalError::Watermark(e.to_string()))?;
        let generation = u64::from_str_radix(&file.generation, 16)
            .map_err(|e| JournalError::Watermark(e.to_string()))?;
        let mut mark = Watermark::default();
        mark.record(
            JournalGeneration::new(generation),
            WriteSequence::new(file.sequence),
        );
        Ok(mark)
    }

    pub fn current(&self) -> Watermark {
        self.current
    }

    pub fn admit(&self, generation: JournalGeneration, sequence: WriteSequence) -> Admission {
        self.current.admit(generation, sequence)
    }

    /// Records and persists `(generation, sequence)` as the last applied entry.
    pub fn record(
        &mut self,
        generation: JournalGeneration,
        sequence: WriteSequence,
    ) -> Result<(), JournalError> {
        self.current.record(generation, sequence);
        let file = WatermarkFile {
            generation: format!("{:016x}", generation.as_u64()),
            sequence: sequence.as_u64(),
        };
        let text = toml::to_string(&file).map_err(|e| JournalError::Watermark(e.to_string()))?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let io_err = |source| JournalError::Io {
            path: self.path.clone(),
            source,
        };
        fs::write(&tmp, text).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use test_case::test_case;

    const G1: JournalGeneration = JournalGeneration::new(1);

    #[test_case(None, 1, 5 => Admission::Apply; "nothing applied yet")]
    #[test_case(Some((1, 5)), 1, 5 => Admission::Duplicate; "same sequence")]
    #[test_case(Some((1, 5)), 1, 4 => Admission::Duplicate; "older sequence")]
    #[test_case(Some((1, 5)), 1, 6 => Admission::Apply; "next sequence")]
    #[test_case(Some((1, 5)), 2, 1 => Admission::Apply; "new generation resets")]
    #[test_case(Some((2, 1)), 1, 6 => Admission::Stale; "older generation is stale")]
    fn test_admission(last: Option<(u64, u64)>, generation: u64, sequence: u64) -> Admission {
        let mut mark = Watermark::default();
        if let Some((g, s)) = last {
            mark.record(JournalGeneration::new(g), WriteSequence::new(s));
        }
        mark.admit(JournalGeneration::new(generation), WriteSequence::new(sequence))
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay-watermark.toml");
        let high = JournalGeneration::new(u64::MAX - 3);
        {
            let mut store = WatermarkStore::open(&path);
            assert_eq!(store.admit(high, WriteSequence::new(1)), Admission::Apply);
            store.record(high, WriteSequence::new(9)).unwrap();
        }
        let store = WatermarkStore::open(&path);
        assert_eq!(store.current().last(), Some((high, WriteSequence::new(9))));
        assert_eq!(store.admit(high, WriteSequence::new(9)), Admission::Duplicate);
        assert_eq!(store.admit(G1, WriteSequence::new(1)), Admission::Stale);
    }
}
