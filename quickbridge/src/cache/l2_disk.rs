//! L2 Disk Cache
//!
//! Persistent tier, one directory per alias:
//! - `cache.dat`: append-only value bytes
//! - `index.json`: key → location, codec and freshness stamp
//! - `config.fingerprint`: digest of the cache config that wrote the files
//! - `l2.wal`: optional journal of index changes since the last index save
//!
//! Overwritten and removed values leave dead bytes in the data file; the file
//! is compacted once dead bytes outweigh live ones.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::config::L2CacheConfig;
use super::ttl::EntryStamp;
use super::wal::{IndexEntry, Journal, JournalOp};
use crate::compression::{CompressionAlgorithm, CompressionConfig, Compressor};
use crate::core::CacheError;

const DATA_FILE: &str = "cache.dat";
const INDEX_FILE: &str = "index.json";
const FINGERPRINT_FILE: &str = "config.fingerprint";
const JOURNAL_FILE: &str = "l2.wal";

/// Puts between index saves when no journal is kept
const INDEX_SAVE_EVERY: usize = 100;
/// Journaled ops between checkpoints
const JOURNAL_CHECKPOINT_EVERY: usize = 1000;
/// Dead bytes below this never trigger compaction on their own
const COMPACT_MIN_DEAD_BYTES: u64 = 1024 * 1024;

/// Result of an L2 read
#[derive(Debug, Clone, PartialEq)]
pub enum L2Lookup {
    /// Decompressed payload
    Hit(Vec<u8>, EntryStamp),
    /// Present but expired; already removed
    Stale,
    Miss,
}

/// L2 tier statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct L2Stats {
    pub entries: usize,
    pub live_bytes: u64,
    pub file_bytes: u64,
}

struct L2State {
    index: HashMap<String, IndexEntry>,
    data_file: File,
    end_offset: u64,
    live_bytes: u64,
    journal: Option<Journal>,
    pending_puts: usize,
}

/// Disk-resident cache tier
pub struct L2DiskCache {
    directory: PathBuf,
    max_bytes: u64,
    compressor: Compressor,
    state: Mutex<L2State>,
}

impl L2DiskCache {
    /// Open (or create) the tier in `directory`. Files written under a
    /// different config fingerprint, or with `clear_on_startup`, are wiped.
    pub fn open(
        directory: impl AsRef<Path>,
        config: &L2CacheConfig,
        compression: CompressionConfig,
        fingerprint: &str,
    ) -> Result<Self, CacheError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let fingerprint_path = directory.join(FINGERPRINT_FILE);
        let stored = fs::read_to_string(&fingerprint_path).ok();
        if config.clear_on_startup {
            info!("L2 cache at {:?}: clear_on_startup set, wiping", directory);
            wipe(&directory)?;
        } else if stored.as_deref().map(str::trim) != Some(fingerprint) {
            if stored.is_some() {
                info!("L2 cache at {:?}: cache config changed, wiping", directory);
            }
            wipe(&directory)?;
        }
        fs::write(&fingerprint_path, fingerprint)?;

        let data_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(directory.join(DATA_FILE))?;

        let mut index = match load_index(&directory) {
            Ok(index) => index,
            Err(e) => {
                warn!("L2 index at {:?} unreadable ({}), starting empty", directory, e);
                data_file.set_len(0)?;
                HashMap::new()
            }
        };
        let end_offset = data_file.metadata()?.len();

        let mut journal = None;
        if config.enable_wal {
            let mut j = Journal::open(directory.join(JOURNAL_FILE))?;
            let records = j.replay()?;
            let replayed = records.len();
            for record in records {
                match record.op {
                    JournalOp::Put { key, entry } => {
                        index.insert(key, entry);
                    }
                    JournalOp::Remove { key } => {
                        index.remove(&key);
                    }
                    JournalOp::Clear => index.clear(),
                }
            }
            if replayed > 0 {
                save_index(&directory, &index)?;
                j.reset()?;
            }
            journal = Some(j);
        }

        // Entries pointing past the data file were never fully written
        index.retain(|_, e| e.offset + e.size <= end_offset);
        let live_bytes = index.values().map(|e| e.size).sum();

        info!(
            "L2 cache opened at {:?}: {} entries, {} live bytes",
            directory,
            index.len(),
            live_bytes
        );

        Ok(Self {
            directory,
            max_bytes: config.max_bytes(),
            compressor: Compressor::new(compression, config.compression_level),
            state: Mutex::new(L2State {
                index,
                data_file,
                end_offset,
                live_bytes,
                journal,
                pending_puts: 0,
            }),
        })
    }

    pub fn get(&self, key: &str, now_ms: u64) -> Result<L2Lookup, CacheError> {
        let mut state = self.state.lock();

        let Some(entry) = state.index.get(key).cloned() else {
            return Ok(L2Lookup::Miss);
        };
        let stamp = EntryStamp {
            created_at_ms: entry.created_at_ms,
            ttl_ms: entry.ttl_ms,
        };
        if !stamp.is_fresh(now_ms) {
            self.remove_locked(&mut state, key)?;
            debug!("L2 Cache STALE: {}", key);
            return Ok(L2Lookup::Stale);
        }

        let mut buffer = vec![0u8; entry.size as usize];
        state.data_file.seek(SeekFrom::Start(entry.offset))?;
        state.data_file.read_exact(&mut buffer)?;
        drop(state);

        if crc32fast::hash(&buffer) != entry.checksum {
            return Err(CacheError::Corrupted(format!("checksum mismatch for {}", key)));
        }
        let codec = CompressionAlgorithm::from_tag(entry.codec)
            .ok_or_else(|| CacheError::Corrupted(format!("unknown codec tag {}", entry.codec)))?;
        let payload = self.compressor.decompress(&buffer, codec)?;

        debug!("L2 Cache HIT: {}", key);
        Ok(L2Lookup::Hit(payload, stamp))
    }

    /// Store a payload, evicting the oldest entries past the disk budget.
    /// Returns the number of evicted entries.
    pub fn put(&self, key: &str, payload: &[u8], stamp: EntryStamp) -> Result<usize, CacheError> {
        let (codec, stored) = self.compressor.compress(payload)?;
        let size = stored.len() as u64;
        if size > self.max_bytes {
            debug!("L2 Cache SKIP: {} ({} bytes over budget)", key, size);
            return Ok(0);
        }

        let mut state = self.state.lock();
        if state.index.contains_key(key) {
            self.remove_locked(&mut state, key)?;
        }

        let mut evicted = 0;
        while state.live_bytes + size > self.max_bytes {
            let oldest = state
                .index
                .iter()
                .min_by_key(|(_, e)| e.created_at_ms)
                .map(|(k, _)| k.clone());
            let Some(victim) = oldest else { break };
            self.remove_locked(&mut state, &victim)?;
            debug!("L2 Cache EVICT: {}", victim);
            evicted += 1;
        }

        let offset = state.end_offset;
        state.data_file.seek(SeekFrom::Start(offset))?;
        state.data_file.write_all(&stored)?;
        state.end_offset += size;
        state.live_bytes += size;

        let entry = IndexEntry {
            offset,
            size,
            codec: codec.tag(),
            checksum: crc32fast::hash(&stored),
            created_at_ms: stamp.created_at_ms,
            ttl_ms: stamp.ttl_ms,
        };
        if let Some(journal) = state.journal.as_mut() {
            journal.append(JournalOp::Put {
                key: key.to_string(),
                entry: entry.clone(),
            })?;
        }
        state.index.insert(key.to_string(), entry);
        state.pending_puts += 1;

        let checkpoint_due = match state.journal {
            Some(_) => state.pending_puts >= JOURNAL_CHECKPOINT_EVERY,
            None => state.pending_puts >= INDEX_SAVE_EVERY,
        };
        if checkpoint_due {
            self.checkpoint_locked(&mut state)?;
        }
        self.maybe_compact_locked(&mut state)?;

        debug!("L2 Cache PUT: {} ({} bytes, {:?})", key, size, codec);
        Ok(evicted)
    }

    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let mut state = self.state.lock();
        let removed = self.remove_locked(&mut state, key)?;
        if removed {
            self.persist_removals_locked(&mut state)?;
        }
        Ok(removed)
    }

    pub fn remove_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .index
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            self.remove_locked(&mut state, key)?;
        }
        if !keys.is_empty() {
            self.persist_removals_locked(&mut state)?;
        }
        Ok(keys.len())
    }

    pub fn sweep_expired(&self, now_ms: u64) -> Result<usize, CacheError> {
        let mut state = self.state.lock();
        let stale: Vec<String> = state
            .index
            .iter()
            .filter(|(_, e)| now_ms.saturating_sub(e.created_at_ms) >= e.ttl_ms)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            self.remove_locked(&mut state, key)?;
        }
        if !stale.is_empty() {
            self.persist_removals_locked(&mut state)?;
            self.maybe_compact_locked(&mut state)?;
        }
        Ok(stale.len())
    }

    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut state = self.state.lock();
        let count = state.index.len();
        state.index.clear();
        state.data_file.set_len(0)?;
        state.end_offset = 0;
        state.live_bytes = 0;
        self.checkpoint_locked(&mut state)?;
        debug!("L2 Cache CLEAR ({} entries)", count);
        Ok(count)
    }

    /// Save the index and drop the journal
    pub fn flush(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock();
        state.data_file.sync_data()?;
        self.checkpoint_locked(&mut state)
    }

    /// Rewrite the data file with live entries only. Returns reclaimed bytes.
    pub fn compact(&self) -> Result<u64, CacheError> {
        let mut state = self.state.lock();
        self.compact_locked(&mut state)
    }

    pub fn stats(&self) -> L2Stats {
        let state = self.state.lock();
        L2Stats {
            entries: state.index.len(),
            live_bytes: state.live_bytes,
            file_bytes: state.end_offset,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Mark the files untrusted so the next `open` wipes them. Used once the
    /// tier stops receiving invalidations.
    pub fn poison(&self) {
        match fs::remove_file(self.directory.join(FINGERPRINT_FILE)) {
            Ok(()) => debug!("L2 cache at {:?} poisoned", self.directory),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!("L2 cache at {:?}: could not poison ({}), wiping", self.directory, e);
                if let Err(e) = wipe(&self.directory) {
                    warn!("L2 cache at {:?}: wipe failed ({})", self.directory, e);
                }
            }
        }
    }

    fn remove_locked(&self, state: &mut L2State, key: &str) -> Result<bool, CacheError> {
        let Some(entry) = state.index.remove(key) else {
            return Ok(false);
        };
        state.live_bytes = state.live_bytes.saturating_sub(entry.size);
        if let Some(journal) = state.journal.as_mut() {
            journal.append(JournalOp::Remove {
                key: key.to_string(),
            })?;
        }
        Ok(true)
    }

    /// Removals must survive a restart so that invalidated values never
    /// come back. The journal covers that when present.
    fn persist_removals_locked(&self, state: &mut L2State) -> Result<(), CacheError> {
        if state.journal.is_none() {
            save_index(&self.directory, &state.index)?;
            state.pending_puts = 0;
        }
        Ok(())
    }

    fn checkpoint_locked(&self, state: &mut L2State) -> Result<(), CacheError> {
        save_index(&self.directory, &state.index)?;
        if let Some(journal) = state.journal.as_mut() {
            journal.reset()?;
        }
        state.pending_puts = 0;
        Ok(())
    }

    fn maybe_compact_locked(&self, state: &mut L2State) -> Result<(), CacheError> {
        let dead = state.end_offset.saturating_sub(state.live_bytes);
        if dead >= COMPACT_MIN_DEAD_BYTES && dead > state.live_bytes {
            self.compact_locked(state)?;
        }
        Ok(())
    }

    fn compact_locked(&self, state: &mut L2State) -> Result<u64, CacheError> {
        let before = state.end_offset;
        let tmp_path = self.directory.join(format!("{}.compact", DATA_FILE));
        let mut tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut keys: Vec<(String, u64)> = state
            .index
            .iter()
            .map(|(k, e)| (k.clone(), e.offset))
            .collect();
        keys.sort_by_key(|(_, offset)| *offset);

        let mut new_offset = 0u64;
        let mut relocated = Vec::with_capacity(keys.len());
        for (key, offset) in keys {
            let size = state.index.get(&key).map(|e| e.size).unwrap_or(0);
            let mut buffer = vec![0u8; size as usize];
            state.data_file.seek(SeekFrom::Start(offset))?;
            state.data_file.read_exact(&mut buffer)?;
            tmp.write_all(&buffer)?;
            relocated.push((key, new_offset));
            new_offset += size;
        }
        tmp.sync_all()?;
        drop(tmp);

        let data_path = self.directory.join(DATA_FILE);
        fs::rename(&tmp_path, &data_path)?;
        state.data_file = OpenOptions::new().read(true).write(true).open(&data_path)?;
        for (key, offset) in relocated {
            if let Some(entry) = state.index.get_mut(&key) {
                entry.offset = offset;
            }
        }
        state.end_offset = new_offset;
        state.live_bytes = new_offset;
        self.checkpoint_locked(state)?;

        let reclaimed = before.saturating_sub(new_offset);
        info!("L2 cache compacted: {} bytes reclaimed", reclaimed);
        Ok(reclaimed)
    }
}

fn wipe(directory: &Path) -> Result<(), CacheError> {
    for name in [DATA_FILE, INDEX_FILE, JOURNAL_FILE] {
        match fs::remove_file(directory.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn load_index(directory: &Path) -> Result<HashMap<String, IndexEntry>, CacheError> {
    let index_path = directory.join(INDEX_FILE);
    let contents = match fs::read_to_string(&index_path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&contents)
        .map_err(|e| CacheError::Corrupted(format!("Failed to parse index: {}", e)))
}

fn save_index(directory: &Path, index: &HashMap<String, IndexEntry>) -> Result<(), CacheError> {
    let json = serde_json::to_string(index)
        .map_err(|e| CacheError::Serialization(format!("Failed to serialize index: {}", e)))?;
    let tmp_path = directory.join(format!("{}.tmp", INDEX_FILE));
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, directory.join(INDEX_FILE))?;
    Ok(())
}
