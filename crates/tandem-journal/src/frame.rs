//! On-disk encoding of the journal.
//!
//! # File Format
//!
//! ```text
//! header: [MAGIC:u32][version:u8][generation:u64][next_seq:u64][count:u32][crc32:u32]
//! frame:  [FRAME_START:u32][generation:u64][sequence:u64][length:u32][payload][crc32:u32][FRAME_END:u32]
//! ```
//!
//! All integers are little-endian. The payload is the postcard encoding of
//! `(sql, params)`. The frame CRC covers everything from `FRAME_START` to the
//! end of the payload; a missing `FRAME_END` marks a torn write.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tandem_types::{JournalGeneration, SqlParam, WriteSequence};

use crate::JournalError;
use crate::checksum::{Crc32, crc32};

const MAGIC: u32 = 0x4A44_4E54; // "TNDJ"
const VERSION: u8 = 1;
const HEADER_SIZE: usize = 4 + 1 + 8 + 8 + 4 + 4;

const FRAME_START: u32 = 0x5AFE_C0DE;
const FRAME_END: u32 = 0xC0DE_5AFE;
const FRAME_HEADER_SIZE: usize = 4 + 8 + 8 + 4;
const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + 4 + 4;

/// A configuration-database mutation waiting to be replayed on the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub generation: JournalGeneration,
    pub sequence: WriteSequence,
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl JournalEntry {
    /// Serializes the entry as one frame.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), JournalError> {
        let payload =
            postcard::to_allocvec(&(&self.sql, &self.params)).map_err(JournalError::Encode)?;
        let length = u32::try_from(payload.len()).map_err(|_| JournalError::FrameTooLarge {
            len: payload.len(),
        })?;

        let start = buf.len();
        buf.reserve(FRAME_OVERHEAD + payload.len());
        buf.extend_from_slice(&FRAME_START.to_le_bytes());
        buf.extend_from_slice(&self.generation.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.sequence.as_u64().to_le_bytes());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&payload);
        let crc = crc32(&buf[start..]);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf.extend_from_slice(&FRAME_END.to_le_bytes());
        Ok(())
    }

    /// Parses one frame, returning the entry and the bytes consumed.
    pub fn decode(data: &Bytes) -> Result<(Self, usize), JournalError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(JournalError::UnexpectedEof);
        }
        if read_u32(data, 0) != FRAME_START {
            return Err(JournalError::TornWrite {
                reason: "missing or corrupted FRAME_START sentinel".to_string(),
            });
        }
        let generation = JournalGeneration::new(read_u64(data, 4));
        let sequence = WriteSequence::new(read_u64(data, 12));
        let length = read_u32(data, 20) as usize;

        let total = FRAME_OVERHEAD + length;
        if data.len() < total {
            return Err(JournalError::UnexpectedEof);
        }

        let crc_offset = FRAME_HEADER_SIZE + length;
        if read_u32(data, crc_offset) != crc32(&data[..crc_offset]) {
            return Err(JournalError::CorruptedFrame { sequence });
        }
        if read_u32(data, crc_offset + 4) != FRAME_END {
            return Err(JournalError::TornWrite {
                reason: format!("missing FRAME_END sentinel after {sequence}"),
            });
        }

        let (sql, params): (String, Vec<SqlParam>) =
            postcard::from_bytes(&data[FRAME_HEADER_SIZE..crc_offset])
                .map_err(JournalError::Decode)?;

        Ok((
            JournalEntry {
                generation,
                sequence,
                sql,
                params,
            },
            total,
        ))
    }
}

/// Fixed-size file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub generation: JournalGeneration,
    pub next_sequence: WriteSequence,
    pub count: u32,
}

impl FileHeader {
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut hasher = Crc32::new();
        let start = buf.len();
        buf.extend_from_slice(&MAGIC.to_le_bytes());
        buf.push(VERSION);
        buf.extend_from_slice(&self.generation.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.next_sequence.as_u64().to_le_bytes());
        buf.extend_from_slice(&self.count.to_le_bytes());
        hasher.update(&buf[start..]);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    }

    pub fn decode(data: &Bytes) -> Result<Self, JournalError> {
        if data.len() < HEADER_SIZE {
            return Err(JournalError::UnexpectedEof);
        }
        if read_u32(data, 0) != MAGIC {
            return Err(JournalError::BadHeader("not a journal file".to_string()));
        }
        if data[4] != VERSION {
            return Err(JournalError::BadHeader(format!(
                "unsupported journal version {}",
                data[4]
            )));
        }
        if read_u32(data, HEADER_SIZE - 4) != crc32(&data[..HEADER_SIZE - 4]) {
            return Err(JournalError::BadHeader("header checksum mismatch".to_string()));
        }
        Ok(Self {
            generation: JournalGeneration::new(read_u64(data, 5)),
            next_sequence: WriteSequence::new(read_u64(data, 13)),
            count: read_u32(data, 21),
        })
    }

    pub const fn size() -> usize {
        HEADER_SIZE
    }
}

/// Decodes a complete journal file.
pub fn decode_file(data: Bytes) -> Result<(FileHeader, Vec<JournalEntry>), JournalError> {
    let header = FileHeader::decode(&data)?;
    let mut entries = Vec::with_capacity(header.count as usize);
    let mut pos = HEADER_SIZE;
    while pos < data.len() {
        let (entry, consumed) = JournalEntry::decode(&data.slice(pos..))?;
        if entry.generation != header.generation {
            return Err(JournalError::BadHeader(format!(
                "frame {} belongs to {}, header says {}",
                entry.sequence, entry.generation, header.generation
            )));
        }
        entries.push(entry);
        pos += consumed;
    }
    if entries.len() != header.count as usize {
        return Err(JournalError::BadHeader(format!(
            "header lists {} entries, found {}",
            header.count,
            entries.len()
        )));
    }
    Ok((header, entries))
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(raw)
}
