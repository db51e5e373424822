//! Entry freshness and the background expiry sweep
//!
//! Timestamps are wall-clock milliseconds so that L2 entries keep their age
//! across restarts. The sweep is advisory: every read checks freshness on
//! its own.

use serde::{Deserialize, Serialize};
use std::sync::Weak;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// age < ttl, served
    Fresh,
    /// age >= ttl, treated as a miss and removed on access or by the sweep
    Stale,
    /// not present (evicted, invalidated, never cached)
    Evicted,
}

/// Creation time and lifetime of one cached value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryStamp {
    pub created_at_ms: u64,
    pub ttl_ms: u64,
}

impl EntryStamp {
    pub fn new(ttl: Duration) -> Self {
        Self {
            created_at_ms: now_millis(),
            ttl_ms: ttl.as_millis() as u64,
        }
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_at_ms)
    }

    pub fn freshness(&self, now_ms: u64) -> Freshness {
        if self.age_ms(now_ms) < self.ttl_ms {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }

    pub fn is_fresh(&self, now_ms: u64) -> bool {
        self.freshness(now_ms) == Freshness::Fresh
    }
}

/// Freshness of an optional entry
pub fn classify(stamp: Option<&EntryStamp>, now_ms: u64) -> Freshness {
    stamp.map_or(Freshness::Evicted, |s| s.freshness(now_ms))
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Something holding entries that can expire
pub trait ExpirySweep: Send + Sync + 'static {
    /// Drop stale entries, returning how many were removed
    fn sweep_expired(&self) -> usize;
}

/// Start the periodic sweep. Each pass runs on the blocking pool since it
/// holds the tier's write lock for a full scan. The task ends on its own once
/// the target is dropped; callers abort it for prompt teardown.
pub fn spawn_sweep<T: ExpirySweep>(target: Weak<T>, interval: Duration, name: String) -> JoinHandle<()> {
    info!("Starting TTL sweep for '{}' (interval={:?})", name, interval);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(target) = target.upgrade() else {
                debug!("TTL sweep for '{}' stopped: cache dropped", name);
                break;
            };
            match tokio::task::spawn_blocking(move || target.sweep_expired()).await {
                Ok(0) => {}
                Ok(removed) => debug!("TTL sweep for '{}' removed {} entries", name, removed),
                Err(e) => warn!("TTL sweep for '{}' failed: {}", name, e),
            }
        }
    })
}
