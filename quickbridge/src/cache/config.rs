use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

use crate::compression::{CompressionAlgorithm, CompressionConfig};
use crate::core::ConfigError;
use crate::query::canonical_json;

/// Eviction strategy. Only `lru` is implemented; the others parse so that
/// validation can reject them with a clear message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    #[default]
    Lru,
    Lfu,
    Fifo,
}

/// In-memory tier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct L1CacheConfig {
    pub max_capacity: usize,
    pub max_memory_mb: usize,
    pub enable_stats: bool,
}

impl Default for L1CacheConfig {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            max_memory_mb: 100,
            enable_stats: true,
        }
    }
}

impl L1CacheConfig {
    pub fn max_bytes(&self) -> usize {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }
}

/// Disk tier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct L2CacheConfig {
    pub storage_path: PathBuf,
    pub max_disk_mb: u64,
    /// Zstd level used when the codec is zstd
    pub compression_level: i32,
    pub enable_wal: bool,
    pub clear_on_startup: bool,
}

impl Default for L2CacheConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("./data/cache"),
            max_disk_mb: 1024,
            compression_level: 3,
            enable_wal: false,
            clear_on_startup: false,
        }
    }
}

impl L2CacheConfig {
    pub fn max_bytes(&self) -> u64 {
        self.max_disk_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
    pub check_interval_secs: u64,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            max_ttl_secs: 3600,
            check_interval_secs: 60,
        }
    }
}

impl TtlConfig {
    /// Requested TTL (or the default when absent or zero), capped at the max
    pub fn effective(&self, requested_secs: Option<u64>) -> Duration {
        let secs = requested_secs
            .filter(|s| *s > 0)
            .unwrap_or(self.default_ttl_secs)
            .min(self.max_ttl_secs);
        Duration::from_secs(secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Cache policy attached to one alias. Immutable once attached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub strategy: CacheStrategy,
    pub l1: L1CacheConfig,
    pub l2: Option<L2CacheConfig>,
    pub ttl: TtlConfig,
    pub compression: CompressionConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CacheStrategy::Lru,
            l1: L1CacheConfig::default(),
            l2: None,
            ttl: TtlConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategy != CacheStrategy::Lru {
            return Err(ConfigError::new(
                "cache.strategy",
                format!("{:?} eviction is not supported, use lru", self.strategy).to_lowercase(),
            ));
        }
        if self.l1.max_capacity == 0 {
            return Err(ConfigError::new("cache.l1.max_capacity", "must be greater than 0"));
        }
        if self.l1.max_memory_mb == 0 {
            return Err(ConfigError::new("cache.l1.max_memory_mb", "must be greater than 0"));
        }
        if self.ttl.default_ttl_secs > self.ttl.max_ttl_secs {
            return Err(ConfigError::new(
                "cache.ttl.default_ttl_secs",
                "must not exceed max_ttl_secs",
            ));
        }
        if self.ttl.check_interval_secs == 0 {
            return Err(ConfigError::new(
                "cache.ttl.check_interval_secs",
                "must be greater than 0",
            ));
        }
        if let Some(l2) = &self.l2 {
            if l2.max_disk_mb == 0 {
                return Err(ConfigError::new("cache.l2.max_disk_mb", "must be greater than 0"));
            }
            let zstd_selected = self.compression.enabled
                && self.compression.algorithm == CompressionAlgorithm::Zstd;
            if zstd_selected && !(1..=22).contains(&l2.compression_level) {
                return Err(ConfigError::new(
                    "cache.l2.compression_level",
                    "zstd level must be within 1..=22",
                ));
            }
        }
        Ok(())
    }

    /// Whether an engine should exist at all for this config
    pub fn is_active(&self) -> bool {
        self.enabled
    }

    /// Stable digest of everything that affects how L2 entries are written
    /// and read. `clear_on_startup` is excluded since it is an action, not a
    /// format.
    pub fn fingerprint(&self) -> String {
        let mut shape = self.clone();
        if let Some(l2) = shape.l2.as_mut() {
            l2.clear_on_startup = false;
        }
        let encoded = serde_json::to_value(&shape)
            .map(|v| canonical_json(&v))
            .unwrap_or_default();
        hex::encode(Sha256::digest(encoded.as_bytes()))
    }
}
