//! Tiered cache engine
//!
//! Reads go L1 → L2 → caller-supplied fetch. Concurrent misses on one key
//! share a single fetch. Every table scope carries an epoch that
//! invalidation bumps; a fetch that started under an older epoch does not
//! populate the cache.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::CacheConfig;
use super::l1_memory::{L1Cache, L1Lookup};
use super::l2_disk::{L2DiskCache, L2Lookup};
use super::ttl::{EntryStamp, ExpirySweep, now_millis, spawn_sweep};
use crate::core::{CacheError, ConfigError};
use crate::query::CacheKey;

/// Snapshot of cache counters and tier sizes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l1_evictions: u64,
    pub l2_evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub l1_entries: usize,
    pub l1_bytes: usize,
    pub l2_entries: usize,
    pub l2_bytes: u64,
    pub l2_enabled: bool,
}

impl CacheStats {
    /// Fraction of lookups served from either tier
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.l1_hits + self.l1_misses;
        if lookups == 0 {
            return 0.0;
        }
        (self.l1_hits + self.l2_hits) as f64 / lookups as f64
    }
}

/// How a `get_or_fetch` was served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOutcome {
    Hit,
    Miss,
}

#[derive(Default)]
struct Counters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l1_evictions: AtomicU64,
    l2_evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
}

#[derive(Default)]
struct Epochs {
    global: u64,
    scopes: HashMap<String, u64>,
}

impl Epochs {
    fn snapshot(&self, scope: &str) -> (u64, u64) {
        (self.global, self.scopes.get(scope).copied().unwrap_or(0))
    }

    fn bump(&mut self, scope: &str) {
        *self.scopes.entry(scope.to_string()).or_insert(0) += 1;
    }
}

/// Per-alias cache engine
pub struct CacheEngine {
    name: String,
    config: CacheConfig,
    l1: L1Cache,
    l2: Option<L2DiskCache>,
    l2_enabled: AtomicBool,
    counters: Counters,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    epochs: Mutex<Epochs>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

impl CacheEngine {
    /// Build the tiers for one alias. An L2 tier that cannot be opened is
    /// logged and left out; the engine then runs L1-only.
    pub fn new(name: &str, config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let l1 = L1Cache::new(&config.l1);
        let l2 = config.l2.as_ref().and_then(|l2_config| {
            let directory = l2_config.storage_path.join(directory_name(name));
            match L2DiskCache::open(
                &directory,
                l2_config,
                config.compression.clone(),
                &config.fingerprint(),
            ) {
                Ok(l2) => Some(l2),
                Err(e) => {
                    warn!("L2 cache for '{}' unavailable ({}), running L1-only", name, e);
                    None
                }
            }
        });

        info!(
            "Cache engine for '{}' created: L1 {{capacity={}, memory={}MB}}, L2 {}, default TTL {}s",
            name,
            config.l1.max_capacity,
            config.l1.max_memory_mb,
            l2.as_ref()
                .map(|l2| format!("at {:?}", l2.directory()))
                .unwrap_or_else(|| "off".to_string()),
            config.ttl.default_ttl_secs
        );

        let l2_enabled = AtomicBool::new(l2.is_some());
        Ok(Self {
            name: name.to_string(),
            config,
            l1,
            l2,
            l2_enabled,
            counters: Counters::default(),
            inflight: Mutex::new(HashMap::new()),
            epochs: Mutex::new(Epochs::default()),
            sweep: Mutex::new(None),
        })
    }

    /// Start the background TTL sweep. Needs a tokio runtime.
    pub fn start_sweep(self: &Arc<Self>) {
        let mut slot = self.sweep.lock();
        if slot.is_none() {
            *slot = Some(spawn_sweep(
                Arc::downgrade(self),
                self.config.ttl.check_interval(),
                self.name.clone(),
            ));
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn l2_enabled(&self) -> bool {
        self.l2_enabled.load(Ordering::SeqCst)
    }

    /// Fresh value for a key from L1, then L2 (promoting to L1)
    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let key_str = key.to_string();
        let now = now_millis();

        match self.l1.get(&key_str, now) {
            L1Lookup::Hit(value, _) => {
                self.count(&self.counters.l1_hits, 1);
                debug!("Cache HIT (L1): {}", key_str);
                return Some(value.as_ref().clone());
            }
            L1Lookup::Stale => {
                self.count(&self.counters.l1_misses, 1);
                self.count(&self.counters.expirations, 1);
            }
            L1Lookup::Miss => self.count(&self.counters.l1_misses, 1),
        }

        let l2 = self.active_l2()?;
        let scope = key.scope();
        let snapshot = self.epochs.lock().snapshot(&scope);

        match l2.get(&key_str, now) {
            Ok(L2Lookup::Hit(bytes, stamp)) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    self.count(&self.counters.l2_hits, 1);
                    debug!("Cache HIT (L2): {}", key_str);
                    self.promote(&key_str, &scope, snapshot, &value, bytes.len(), stamp);
                    Some(value)
                }
                Err(e) => {
                    self.count(&self.counters.l2_misses, 1);
                    self.degrade(CacheError::Corrupted(format!("payload of {}: {}", key_str, e)));
                    None
                }
            },
            Ok(L2Lookup::Stale) => {
                self.count(&self.counters.l2_misses, 1);
                self.count(&self.counters.expirations, 1);
                None
            }
            Ok(L2Lookup::Miss) => {
                self.count(&self.counters.l2_misses, 1);
                None
            }
            Err(e) => {
                self.count(&self.counters.l2_misses, 1);
                self.degrade(e);
                None
            }
        }
    }

    /// Store a value in every active tier. `ttl_secs` is clamped to the
    /// configured maximum; `None` uses the default.
    pub fn put(&self, key: &CacheKey, value: &Value, ttl_secs: Option<u64>) {
        let scope = key.scope();
        let snapshot = self.epochs.lock().snapshot(&scope);
        self.populate(&key.to_string(), &scope, snapshot, value, ttl_secs);
    }

    /// Serve from cache or run `fetch` once for all concurrent callers of
    /// the same key. A failed fetch leaves the cache untouched.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        key: &CacheKey,
        ttl_secs: Option<u64>,
        fetch: F,
    ) -> Result<(Value, CacheOutcome), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok((value, CacheOutcome::Hit));
        }

        let key_str = key.to_string();
        let gate = self
            .inflight
            .lock()
            .entry(key_str.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let result = {
            let _turn = gate.lock().await;

            // A concurrent leader may have populated the key while we waited
            if let L1Lookup::Hit(value, _) = self.l1.get(&key_str, now_millis()) {
                self.count(&self.counters.l1_hits, 1);
                Ok((value.as_ref().clone(), CacheOutcome::Hit))
            } else {
                let scope = key.scope();
                let snapshot = self.epochs.lock().snapshot(&scope);
                match fetch().await {
                    Ok(value) => {
                        self.populate(&key_str, &scope, snapshot, &value, ttl_secs);
                        Ok((value, CacheOutcome::Miss))
                    }
                    Err(e) => Err(e),
                }
            }
        };

        {
            let mut inflight = self.inflight.lock();
            if Arc::strong_count(&gate) <= 2 {
                inflight.remove(&key_str);
            }
            drop(gate);
        }
        result
    }

    /// Drop one key from every tier
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let key_str = key.to_string();
        let removed_l1 = {
            let mut epochs = self.epochs.lock();
            epochs.bump(&key.scope());
            self.l1.remove(&key_str)
        };
        let removed_l2 = match self.active_l2().map(|l2| l2.remove(&key_str)) {
            Some(Ok(removed)) => removed,
            Some(Err(e)) => {
                self.degrade(e);
                false
            }
            None => false,
        };
        self.count(&self.counters.invalidations, 1);
        removed_l1 || removed_l2
    }

    /// Drop every entry scoped to `table` under this alias. Returns the
    /// number of distinct tier entries removed.
    pub fn invalidate_table(&self, table: &str) -> usize {
        let prefix = CacheKey::table_prefix(&self.name, table);
        let removed_l1 = {
            let mut epochs = self.epochs.lock();
            epochs.bump(&prefix);
            self.l1.remove_prefix(&prefix)
        };
        let removed_l2 = match self.active_l2().map(|l2| l2.remove_prefix(&prefix)) {
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                self.degrade(e);
                0
            }
            None => 0,
        };
        self.count(&self.counters.invalidations, 1);
        debug!(
            "Cache INVALIDATE '{}': {} L1 + {} L2 entries",
            prefix, removed_l1, removed_l2
        );
        removed_l1 + removed_l2
    }

    /// Drop everything in every tier
    pub fn clear(&self) -> usize {
        let removed_l1 = {
            let mut epochs = self.epochs.lock();
            epochs.global += 1;
            self.l1.clear()
        };
        let removed_l2 = match self.active_l2().map(L2DiskCache::clear) {
            Some(Ok(n)) => n,
            Some(Err(e)) => {
                self.degrade(e);
                0
            }
            None => 0,
        };
        info!("Cache for '{}' cleared ({} L1, {} L2 entries)", self.name, removed_l1, removed_l2);
        removed_l1 + removed_l2
    }

    pub fn stats(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let l2 = self.active_l2().map(L2DiskCache::stats).unwrap_or_default();
        CacheStats {
            l1_hits: load(&self.counters.l1_hits),
            l1_misses: load(&self.counters.l1_misses),
            l2_hits: load(&self.counters.l2_hits),
            l2_misses: load(&self.counters.l2_misses),
            l1_evictions: load(&self.counters.l1_evictions),
            l2_evictions: load(&self.counters.l2_evictions),
            expirations: load(&self.counters.expirations),
            invalidations: load(&self.counters.invalidations),
            l1_entries: self.l1.len(),
            l1_bytes: self.l1.bytes(),
            l2_entries: l2.entries,
            l2_bytes: l2.live_bytes,
            l2_enabled: self.l2_enabled(),
        }
    }

    /// Stop the sweep and persist the L2 index
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweep.lock().take() {
            handle.abort();
        }
        if let Some(Err(e)) = self.active_l2().map(L2DiskCache::flush) {
            self.degrade(e);
        }
        debug!("Cache engine for '{}' shut down", self.name);
    }

    fn populate(&self, key: &str, scope: &str, snapshot: (u64, u64), value: &Value, ttl_secs: Option<u64>) {
        let payload = match serde_json::to_vec(value) {
            Ok(p) => p,
            Err(e) => {
                debug!("Cache SKIP {}: unserializable value ({})", key, e);
                return;
            }
        };
        let stamp = EntryStamp::new(self.config.ttl.effective(ttl_secs));

        {
            let epochs = self.epochs.lock();
            if epochs.snapshot(scope) != snapshot {
                debug!("Cache SKIP {}: invalidated while fetching", key);
                return;
            }
            let evicted = self.l1.put(key, Arc::new(value.clone()), payload.len(), stamp);
            self.count(&self.counters.l1_evictions, evicted as u64);
        }

        let Some(l2) = self.active_l2() else { return };
        match l2.put(key, &payload, stamp) {
            Ok(evicted) => self.count(&self.counters.l2_evictions, evicted as u64),
            Err(e) => {
                self.degrade(e);
                return;
            }
        }
        // An invalidation that ran between the L1 insert and the L2 write
        // has already swept L2; undo our late write.
        if self.epochs.lock().snapshot(scope) != snapshot {
            if let Err(e) = l2.remove(key) {
                self.degrade(e);
            }
        }
    }

    fn promote(
        &self,
        key: &str,
        scope: &str,
        snapshot: (u64, u64),
        value: &Value,
        size: usize,
        stamp: EntryStamp,
    ) {
        let epochs = self.epochs.lock();
        if epochs.snapshot(scope) == snapshot {
            let evicted = self.l1.put(key, Arc::new(value.clone()), size, stamp);
            self.count(&self.counters.l1_evictions, evicted as u64);
        }
    }

    fn active_l2(&self) -> Option<&L2DiskCache> {
        if self.l2_enabled.load(Ordering::SeqCst) {
            self.l2.as_ref()
        } else {
            None
        }
    }

    /// Switch to L1-only. The disk files stop seeing invalidations, so they
    /// are poisoned to keep a restart from serving them.
    fn degrade(&self, error: CacheError) {
        if self.l2_enabled.swap(false, Ordering::SeqCst) {
            warn!(
                "L2 cache for '{}' disabled after error: {}; continuing L1-only",
                self.name, error
            );
            if let Some(l2) = &self.l2 {
                l2.poison();
            }
        }
    }

    fn count(&self, counter: &AtomicU64, n: u64) {
        if self.config.l1.enable_stats && n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }
}

impl ExpirySweep for CacheEngine {
    fn sweep_expired(&self) -> usize {
        let now = now_millis();
        let mut removed = self.l1.sweep_expired(now);
        match self.active_l2().map(|l2| l2.sweep_expired(now)) {
            Some(Ok(n)) => removed += n,
            Some(Err(e)) => self.degrade(e),
            None => {}
        }
        self.count(&self.counters.expirations, removed as u64);
        removed
    }
}

impl Drop for CacheEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep.get_mut().take() {
            handle.abort();
        }
    }
}

/// `<sanitized alias>-<digest prefix>`; sanitizing alone sends `db.1` and
/// `db_1` to the same place.
fn directory_name(alias: &str) -> String {
    let readable: String = alias
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let digest = hex::encode(Sha256::digest(alias.as_bytes()));
    format!("{}-{}", readable, &digest[..16])
}
