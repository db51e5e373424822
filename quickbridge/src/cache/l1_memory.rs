//! L1 Memory Cache
//!
//! Bounded LRU over a radix trie so that a whole table scope (`alias:table:`)
//! can be dropped with one prefix walk. Recency is a monotonically increasing
//! tick. Reads only take the read lock and record their tick in the entry;
//! the ordering map catches up lazily when a victim is chosen.

use parking_lot::RwLock;
use radix_trie::{Trie, TrieCommon};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::config::L1CacheConfig;
use super::ttl::{EntryStamp, Freshness};

#[derive(Debug)]
struct L1Entry {
    value: Arc<Value>,
    size: usize,
    stamp: EntryStamp,
    /// Tick under which the key sits in `LruState::order`
    queued: u64,
    /// Tick of the latest read or write
    last_used: AtomicU64,
}

#[derive(Default)]
struct LruState {
    entries: Trie<String, L1Entry>,
    order: BTreeMap<u64, String>,
    bytes: usize,
}

impl LruState {
    fn remove(&mut self, key: &str) -> Option<L1Entry> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.queued);
        self.bytes = self.bytes.saturating_sub(entry.size);
        Some(entry)
    }

    /// Evict the least recently used key. Entries read since they were
    /// queued are requeued at their latest tick first.
    fn pop_lru(&mut self) -> Option<String> {
        loop {
            let (tick, key) = self.order.pop_first()?;
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            let last_used = *entry.last_used.get_mut();
            if last_used > tick {
                entry.queued = last_used;
                self.order.insert(last_used, key);
                continue;
            }
            if let Some(entry) = self.entries.remove(&key) {
                self.bytes = self.bytes.saturating_sub(entry.size);
            }
            return Some(key);
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .get_raw_descendant(prefix)
            .map(|subtrie| {
                subtrie
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Result of an L1 read
#[derive(Debug, Clone, PartialEq)]
pub enum L1Lookup {
    Hit(Arc<Value>, EntryStamp),
    /// Present but expired; already removed
    Stale,
    Miss,
}

/// Bounded in-memory LRU tier
pub struct L1Cache {
    state: RwLock<LruState>,
    next_tick: AtomicU64,
    max_capacity: usize,
    max_bytes: usize,
}

impl L1Cache {
    pub fn new(config: &L1CacheConfig) -> Self {
        Self {
            state: RwLock::new(LruState::default()),
            next_tick: AtomicU64::new(0),
            max_capacity: config.max_capacity.max(1),
            max_bytes: config.max_bytes(),
        }
    }

    fn tick(&self) -> u64 {
        self.next_tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read and mark as most recently used. Stale entries are removed.
    pub fn get(&self, key: &str, now_ms: u64) -> L1Lookup {
        {
            let state = self.state.read();
            let Some(entry) = state.entries.get(key) else {
                return L1Lookup::Miss;
            };
            if entry.stamp.freshness(now_ms) == Freshness::Fresh {
                entry.last_used.fetch_max(self.tick(), Ordering::Relaxed);
                return L1Lookup::Hit(entry.value.clone(), entry.stamp);
            }
        }

        let mut state = self.state.write();
        match state.entries.get(key) {
            None => return L1Lookup::Miss,
            Some(entry) if entry.stamp.freshness(now_ms) == Freshness::Stale => {}
            // Replaced by a fresh value since the read lock was dropped
            Some(entry) => {
                entry.last_used.fetch_max(self.tick(), Ordering::Relaxed);
                return L1Lookup::Hit(entry.value.clone(), entry.stamp);
            }
        }
        state.remove(key);
        debug!("L1 Cache STALE: {}", key);
        L1Lookup::Stale
    }

    /// Insert or replace, evicting least recently used entries past either
    /// bound. Returns the number of evicted entries. A value larger than the
    /// whole memory budget is not stored.
    pub fn put(&self, key: &str, value: Arc<Value>, size: usize, stamp: EntryStamp) -> usize {
        if size > self.max_bytes {
            debug!("L1 Cache SKIP: {} ({} bytes over budget)", key, size);
            return 0;
        }

        let mut state = self.state.write();
        state.remove(key);

        let mut evicted = 0;
        while !state.order.is_empty()
            && (state.entries.len() >= self.max_capacity
                || state.bytes + size > self.max_bytes)
        {
            if let Some(victim) = state.pop_lru() {
                debug!("L1 Cache EVICT: {}", victim);
                evicted += 1;
            }
        }

        let tick = self.tick();
        state.order.insert(tick, key.to_string());
        state.entries.insert(
            key.to_string(),
            L1Entry {
                value,
                size,
                stamp,
                queued: tick,
                last_used: AtomicU64::new(tick),
            },
        );
        state.bytes += size;

        debug!("L1 Cache PUT: {} ({} bytes)", key, size);
        evicted
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state.write().remove(key).is_some()
    }

    /// Drop every key under a prefix
    pub fn remove_prefix(&self, prefix: &str) -> usize {
        let mut state = self.state.write();
        let keys = state.keys_with_prefix(prefix);
        for key in &keys {
            state.remove(key);
        }
        keys.len()
    }

    pub fn sweep_expired(&self, now_ms: u64) -> usize {
        let mut state = self.state.write();
        let stale: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| !e.stamp.is_fresh(now_ms))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            state.remove(key);
        }
        stale.len()
    }

    pub fn clear(&self) -> usize {
        let mut state = self.state.write();
        let count = state.entries.len();
        *state = LruState::default();
        count
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.read().entries.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.state.read().bytes
    }
}
