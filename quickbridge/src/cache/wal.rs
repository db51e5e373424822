//! Write-ahead journal for the L2 index
//!
//! Each record is framed as:
//! - size (u64, big endian)
//! - checksum (u32, crc32 of the payload)
//! - payload (bincode)
//!
//! Replay stops at the first frame that is torn, oversized, fails its
//! checksum or does not decode. Opening the journal truncates it to the
//! intact prefix so later appends follow valid records.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::ttl::now_millis;
use crate::core::CacheError;

/// Upper bound on one encoded record; index ops are tiny
const MAX_FRAME_BYTES: u64 = 1024 * 1024;
const HEADER_BYTES: u64 = 12;

/// Index location of one stored value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub offset: u64,
    /// Bytes on disk (after compression)
    pub size: u64,
    /// Codec tag, see `CompressionAlgorithm::tag`
    pub codec: u8,
    pub checksum: u32,
    pub created_at_ms: u64,
    pub ttl_ms: u64,
}

/// Journaled index mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalOp {
    Put { key: String, entry: IndexEntry },
    Remove { key: String },
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub op: JournalOp,
}

/// Append-only journal file
pub struct Journal {
    file: BufWriter<File>,
    path: PathBuf,
    next_sequence: u64,
}

impl Journal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let scan = read_records(&path)?;
        let file_len = file.metadata()?.len();
        if scan.valid_len < file_len {
            warn!(
                "Journal {:?}: dropping {} bytes after the last intact record",
                path,
                file_len - scan.valid_len
            );
            file.set_len(scan.valid_len)?;
        }
        let next_sequence = scan.records.last().map(|r| r.sequence + 1).unwrap_or(0);

        info!("Journal opened at {:?}, next sequence: {}", path, next_sequence);

        Ok(Self {
            file: BufWriter::new(file),
            path,
            next_sequence,
        })
    }

    pub fn append(&mut self, op: JournalOp) -> Result<u64, CacheError> {
        let sequence = self.next_sequence;
        let record = JournalRecord {
            sequence,
            timestamp_ms: now_millis(),
            op,
        };

        let data = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| CacheError::Serialization(e.to_string()))?;
        let checksum = crc32fast::hash(&data);

        self.file.write_all(&(data.len() as u64).to_be_bytes())?;
        self.file.write_all(&checksum.to_be_bytes())?;
        self.file.write_all(&data)?;
        self.file.flush()?;

        self.next_sequence += 1;
        debug!("Journal append: seq={}, size={}", sequence, data.len());
        Ok(sequence)
    }

    /// All intact records in write order
    pub fn replay(&mut self) -> Result<Vec<JournalRecord>, CacheError> {
        self.file.flush()?;
        let records = read_records(&self.path)?.records;
        info!("Replayed {} journal records", records.len());
        Ok(records)
    }

    /// Drop every record, typically right after the index was saved
    pub fn reset(&mut self) -> Result<(), CacheError> {
        self.file.flush()?;
        self.file.get_ref().set_len(0)?;
        self.next_sequence = 0;
        debug!("Journal reset: {:?}", self.path);
        Ok(())
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

struct JournalScan {
    records: Vec<JournalRecord>,
    /// Length of the intact prefix
    valid_len: u64,
}

fn read_records(path: &Path) -> Result<JournalScan, CacheError> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(JournalScan {
                records: Vec::new(),
                valid_len: 0,
            });
        }
        Err(e) => return Err(e.into()),
    };
    let file_len = file.metadata()?.len();

    let mut records = Vec::new();
    let mut valid_len = 0u64;
    loop {
        let mut header = [0u8; HEADER_BYTES as usize];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                if valid_len < file_len {
                    warn!("Incomplete journal record header");
                }
                break;
            }
            Err(e) => return Err(e.into()),
        }

        let mut size_buf = [0u8; 8];
        size_buf.copy_from_slice(&header[..8]);
        let mut checksum_buf = [0u8; 4];
        checksum_buf.copy_from_slice(&header[8..]);
        let size = u64::from_be_bytes(size_buf);

        let remaining = file_len.saturating_sub(valid_len + HEADER_BYTES);
        if size > MAX_FRAME_BYTES || size > remaining {
            warn!("Journal record length {} out of bounds, ending replay", size);
            break;
        }

        let mut data = vec![0u8; size as usize];
        if file.read_exact(&mut data).is_err() {
            warn!("Incomplete journal record data");
            break;
        }

        let expected = u32::from_be_bytes(checksum_buf);
        let actual = crc32fast::hash(&data);
        if actual != expected {
            warn!(
                "Journal checksum mismatch (expected {}, got {}), ending replay",
                expected, actual
            );
            break;
        }

        match bincode::serde::decode_from_slice::<JournalRecord, _>(&data, bincode::config::standard()) {
            Ok((record, _)) => records.push(record),
            Err(e) => {
                warn!("Undecodable journal record ({}), ending replay", e);
                break;
            }
        }
        valid_len += HEADER_BYTES + size;
    }

    Ok(JournalScan { records, valid_len })
}
