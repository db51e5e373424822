// Tiered Cache Engine Tests
// Tests for LRU eviction, TTL fallback, table invalidation and the disk tier

use quickbridge::cache::{CacheConfig, CacheEngine, CacheOutcome, L1CacheConfig, L2CacheConfig, TtlConfig};
use quickbridge::query::{CacheKey, CacheKeyFragment};
use quickbridge::{BackendError, OperationKind};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;

fn key(table: &str, id: i64) -> CacheKey {
    CacheKey::new(
        "db1",
        table,
        OperationKind::FindById,
        &CacheKeyFragment::of_id(&json!(id)),
    )
}

fn short_ttl(secs: u64) -> TtlConfig {
    TtlConfig {
        default_ttl_secs: secs,
        max_ttl_secs: 60,
        check_interval_secs: 30,
    }
}

#[test]
fn test_lru_evicts_least_recently_used_first() {
    let config = CacheConfig {
        l1: L1CacheConfig {
            max_capacity: 3,
            ..Default::default()
        },
        ..Default::default()
    };
    let cache = CacheEngine::new("db1", config).unwrap();

    cache.put(&key("users", 1), &json!("a"), None);
    cache.put(&key("users", 2), &json!("b"), None);
    cache.put(&key("users", 3), &json!("c"), None);

    // Touch 1 so 2 becomes the eldest
    assert_eq!(cache.get(&key("users", 1)), Some(json!("a")));

    cache.put(&key("users", 4), &json!("d"), None);
    assert_eq!(cache.get(&key("users", 2)), None);
    assert_eq!(cache.get(&key("users", 1)), Some(json!("a")));
    assert_eq!(cache.get(&key("users", 3)), Some(json!("c")));
    assert_eq!(cache.get(&key("users", 4)), Some(json!("d")));

    let stats = cache.stats();
    assert_eq!(stats.l1_entries, 3);
    assert_eq!(stats.l1_evictions, 1);
}

#[tokio::test]
async fn test_stale_entry_falls_back_to_fetch() {
    let cache = CacheEngine::new(
        "db1",
        CacheConfig {
            ttl: short_ttl(1),
            ..Default::default()
        },
    )
    .unwrap();
    let fetches = AtomicUsize::new(0);
    let fetch = || async {
        fetches.fetch_add(1, Ordering::SeqCst);
        Ok::<Value, BackendError>(json!({"id": 1}))
    };

    let (_, outcome) = cache.get_or_fetch(&key("users", 1), None, fetch).await.unwrap();
    assert_eq!(outcome, CacheOutcome::Miss);
    let (_, outcome) = cache.get_or_fetch(&key("users", 1), None, fetch).await.unwrap();
    assert_eq!(outcome, CacheOutcome::Hit);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let (value, outcome) = cache.get_or_fetch(&key("users", 1), None, fetch).await.unwrap();
    assert_eq!(outcome, CacheOutcome::Miss);
    assert_eq!(value, json!({"id": 1}));
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
    assert!(cache.stats().expirations >= 1);
}

#[tokio::test]
async fn test_request_ttl_is_capped_by_max() {
    let cache = CacheEngine::new(
        "db1",
        CacheConfig {
            ttl: TtlConfig {
                default_ttl_secs: 30,
                max_ttl_secs: 1,
                check_interval_secs: 30,
            },
            ..Default::default()
        },
    );
    // default above max is a configuration error
    assert!(cache.is_err());

    let cache = CacheEngine::new(
        "db1",
        CacheConfig {
            ttl: TtlConfig {
                default_ttl_secs: 1,
                max_ttl_secs: 1,
                check_interval_secs: 30,
            },
            ..Default::default()
        },
    )
    .unwrap();
    cache.put(&key("users", 1), &json!(1), Some(3600));
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.get(&key("users", 1)), None);
}

#[test]
fn test_invalidate_table_leaves_other_tables() {
    let cache = CacheEngine::new("db1", CacheConfig::default()).unwrap();
    cache.put(&key("users", 1), &json!(1), None);
    cache.put(&key("users", 2), &json!(2), None);
    cache.put(&key("users_archive", 1), &json!(3), None);
    cache.put(&key("orders", 1), &json!(4), None);

    assert_eq!(cache.invalidate_table("users"), 2);
    assert_eq!(cache.get(&key("users", 1)), None);
    assert_eq!(cache.get(&key("users_archive", 1)), Some(json!(3)));
    assert_eq!(cache.get(&key("orders", 1)), Some(json!(4)));

    assert!(cache.invalidate(&key("orders", 1)));
    assert!(!cache.invalidate(&key("orders", 1)));
    assert_eq!(cache.stats().invalidations, 3);
}

#[tokio::test]
async fn test_concurrent_misses_fetch_once() {
    let cache = Arc::new(CacheEngine::new("db1", CacheConfig::default()).unwrap());
    let fetches = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let fetches = fetches.clone();
        handles.push(tokio::spawn(async move {
            cache
                .get_or_fetch(&key("users", 9), None, move || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<Value, BackendError>(json!("nine"))
                })
                .await
                .unwrap()
                .0
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), json!("nine"));
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[test]
fn test_disk_tier_survives_restart() {
    let dir = tempdir().unwrap();
    let config = CacheConfig {
        l2: Some(L2CacheConfig {
            storage_path: dir.path().to_path_buf(),
            enable_wal: true,
            ..Default::default()
        }),
        ..Default::default()
    };

    {
        let cache = CacheEngine::new("db1", config.clone()).unwrap();
        cache.put(&key("users", 1), &json!({"name": "Ann"}), None);
        cache.put(&key("users", 2), &json!({"name": "Bob"}), None);
        cache.invalidate(&key("users", 2));
        cache.shutdown();
    }

    let cache = CacheEngine::new("db1", config).unwrap();
    assert!(cache.l2_enabled());
    assert_eq!(cache.get(&key("users", 1)), Some(json!({"name": "Ann"})));
    assert_eq!(cache.get(&key("users", 2)), None);
    let stats = cache.stats();
    assert_eq!(stats.l2_hits, 1);
    assert_eq!(stats.l1_entries, 1);
}

#[test]
fn test_config_change_invalidates_disk_tier() {
    let dir = tempdir().unwrap();
    let config = CacheConfig {
        l2: Some(L2CacheConfig {
            storage_path: dir.path().to_path_buf(),
            ..Default::default()
        }),
        ..Default::default()
    };
    {
        let cache = CacheEngine::new("db1", config.clone()).unwrap();
        cache.put(&key("users", 1), &json!("kept?"), None);
        cache.shutdown();
    }

    let mut changed = config;
    changed.compression.enabled = true;
    let cache = CacheEngine::new("db1", changed).unwrap();
    assert_eq!(cache.get(&key("users", 1)), None);
}

#[test]
fn test_unwritable_disk_tier_runs_memory_only() {
    let dir = tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").unwrap();

    let config = CacheConfig {
        l2: Some(L2CacheConfig {
            storage_path: blocker,
            ..Default::default()
        }),
        ..Default::default()
    };
    let cache = CacheEngine::new("db1", config).unwrap();
    assert!(!cache.l2_enabled());
    cache.put(&key("users", 1), &json!(1), None);
    assert_eq!(cache.get(&key("users", 1)), Some(json!(1)));
    assert!(!cache.stats().l2_enabled);
}

fn tier_directory(root: &std::path::Path) -> std::path::PathBuf {
    let dirs: Vec<_> = std::fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(dirs.len(), 1);
    dirs[0].clone()
}

fn disk_config(root: &std::path::Path, enable_wal: bool) -> CacheConfig {
    CacheConfig {
        l1: L1CacheConfig {
            max_capacity: 1,
            ..Default::default()
        },
        l2: Some(L2CacheConfig {
            storage_path: root.to_path_buf(),
            enable_wal,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn test_similar_aliases_get_separate_disk_tiers() {
    let dir = tempdir().unwrap();
    let a = CacheEngine::new("db.1", disk_config(dir.path(), false)).unwrap();
    let b = CacheEngine::new("db_1", disk_config(dir.path(), false)).unwrap();

    let key_of = |alias: &str, id: i64| {
        CacheKey::new(alias, "users", OperationKind::FindById, &CacheKeyFragment::of_id(&json!(id)))
    };
    a.put(&key_of("db.1", 1), &json!("a-one"), None);
    b.put(&key_of("db_1", 1), &json!("b-one"), None);
    a.put(&key_of("db.1", 2), &json!("a-two"), None);
    b.put(&key_of("db_1", 2), &json!("b-two"), None);

    // Both first entries were pushed out of L1 and come back from disk
    assert_eq!(a.get(&key_of("db.1", 1)), Some(json!("a-one")));
    assert_eq!(b.get(&key_of("db_1", 1)), Some(json!("b-one")));
    assert!(a.l2_enabled());
    assert!(b.l2_enabled());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
}

#[test]
fn test_degraded_disk_tier_is_not_served_after_restart() {
    let dir = tempdir().unwrap();
    let config = disk_config(dir.path(), true);
    {
        let cache = CacheEngine::new("db1", config.clone()).unwrap();
        cache.put(&key("users", 1), &json!("one"), None);
        cache.put(&key("users", 2), &json!("two"), None);

        let data_path = tier_directory(dir.path()).join("cache.dat");
        let mut bytes = std::fs::read(&data_path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&data_path, bytes).unwrap();

        assert_eq!(cache.get(&key("users", 1)), None);
        assert!(!cache.l2_enabled());
        // Only L1 sees this invalidation
        cache.invalidate_table("users");
        cache.shutdown();
    }

    let cache = CacheEngine::new("db1", config).unwrap();
    assert!(cache.l2_enabled());
    assert_eq!(cache.get(&key("users", 2)), None);
    assert_eq!(cache.get(&key("users", 1)), None);
}

#[test]
fn test_garbage_journal_does_not_block_startup() {
    let dir = tempdir().unwrap();
    let config = disk_config(dir.path(), true);
    {
        let cache = CacheEngine::new("db1", config.clone()).unwrap();
        cache.shutdown();
    }

    let mut junk = vec![0xFF; 8];
    junk.extend_from_slice(&[0, 0, 0, 0]);
    junk.extend_from_slice(b"junk");
    std::fs::write(tier_directory(dir.path()).join("l2.wal"), junk).unwrap();

    let cache = CacheEngine::new("db1", config).unwrap();
    assert!(cache.l2_enabled());
    cache.put(&key("users", 1), &json!("one"), None);
    cache.put(&key("users", 2), &json!("two"), None);
    assert_eq!(cache.get(&key("users", 1)), Some(json!("one")));
    assert!(cache.l2_enabled());
}
