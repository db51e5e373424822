//! Cache Module
//!
//! Two tiers per alias:
//! - L1: bounded in-memory LRU
//! - L2: optional disk tier, persists across restarts
//!
//! plus TTL freshness checks on every read and a background sweep.

pub mod config;
pub mod engine;
pub mod l1_memory;
pub mod l2_disk;
pub mod ttl;
pub mod wal;

pub use config::{CacheConfig, CacheStrategy, L1CacheConfig, L2CacheConfig, TtlConfig};
pub use engine::{CacheEngine, CacheOutcome, CacheStats};
pub use l1_memory::{L1Cache, L1Lookup};
pub use l2_disk::{L2DiskCache, L2Lookup, L2Stats};
pub use ttl::{EntryStamp, Freshness};
