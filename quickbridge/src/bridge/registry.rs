//! Alias registry
//!
//! Maps each alias to its backend adapter and, when caching is enabled for
//! it, a cache engine owned by that alias alone.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::{BackendAdapter, BackendConnector};
use crate::cache::CacheEngine;
use crate::config::DatabaseConfig;
use crate::core::{BridgeError, RegistryError, Result};

/// Everything the dispatcher needs for one alias
pub struct AliasEntry {
    pub config: DatabaseConfig,
    pub adapter: Arc<dyn BackendAdapter>,
    pub cache: Option<Arc<CacheEngine>>,
}

impl AliasEntry {
    pub fn alias(&self) -> &str {
        &self.config.alias
    }
}

/// Registry of configured databases
pub struct Registry {
    connector: Arc<dyn BackendConnector>,
    entries: RwLock<HashMap<String, Arc<AliasEntry>>>,
    /// Aliases with an `add` in progress
    pending: Mutex<HashSet<String>>,
    default_alias: RwLock<Option<String>>,
}

/// Claim on an alias for the duration of one `add`
struct Reservation<'a> {
    pending: &'a Mutex<HashSet<String>>,
    alias: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.alias);
    }
}

impl Registry {
    pub fn new(connector: Arc<dyn BackendConnector>) -> Self {
        Self {
            connector,
            entries: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            default_alias: RwLock::new(None),
        }
    }

    /// Alias used by requests that name none
    pub fn set_default_alias(&self, alias: Option<String>) {
        *self.default_alias.write() = alias;
    }

    pub fn default_alias(&self) -> Option<String> {
        self.default_alias.read().clone()
    }

    /// Connect and register a database. Registering an alias twice is an
    /// error; remove it first to reconfigure. The alias is reserved before
    /// connecting, so a concurrent duplicate never touches the backend or
    /// the cache directory.
    pub async fn add(&self, config: DatabaseConfig) -> Result<()> {
        config.validate()?;
        let _reservation = self.reserve(&config.alias)?;

        let timeout = config.pool.connect_timeout();
        let adapter = match tokio::time::timeout(timeout, self.connector.connect(&config)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(BridgeError::Timeout(format!(
                    "connecting '{}' exceeded {:?}",
                    config.alias, timeout
                )));
            }
        };

        let cache = match config.active_cache() {
            Some(cache_config) => match CacheEngine::new(&config.alias, cache_config.clone()) {
                Ok(engine) => {
                    let engine = Arc::new(engine);
                    engine.start_sweep();
                    Some(engine)
                }
                Err(e) => {
                    if let Err(close_err) = adapter.close().await {
                        warn!("Closing '{}' failed: {}", config.alias, close_err);
                    }
                    return Err(e.into());
                }
            },
            None => None,
        };

        let alias = config.alias.clone();
        let entry = Arc::new(AliasEntry {
            config,
            adapter,
            cache,
        });
        self.entries.write().insert(alias.clone(), entry.clone());
        info!(
            "Database '{}' added ({}, cache {})",
            alias,
            entry.config.kind,
            if entry.cache.is_some() { "on" } else { "off" }
        );
        Ok(())
    }

    fn reserve(&self, alias: &str) -> std::result::Result<Reservation<'_>, RegistryError> {
        let mut pending = self.pending.lock();
        if pending.contains(alias) || self.entries.read().contains_key(alias) {
            return Err(RegistryError::DuplicateAlias(alias.to_string()));
        }
        pending.insert(alias.to_string());
        Ok(Reservation {
            pending: &self.pending,
            alias: alias.to_string(),
        })
    }

    /// Entry for an alias, if registered
    pub fn get(&self, alias: &str) -> Option<Arc<AliasEntry>> {
        self.entries.read().get(alias).cloned()
    }

    /// Entry for `alias`, or for the default alias when `None`
    pub fn resolve(&self, alias: Option<&str>) -> std::result::Result<Arc<AliasEntry>, RegistryError> {
        let alias = match alias {
            Some(alias) => alias.to_string(),
            None => self.default_alias().ok_or(RegistryError::NoDefaultAlias)?,
        };
        self.get(&alias).ok_or(RegistryError::UnknownAlias(alias))
    }

    /// Unregister an alias, stopping its cache and closing its adapter
    pub async fn remove(&self, alias: &str) -> std::result::Result<(), RegistryError> {
        let entry = self
            .entries
            .write()
            .remove(alias)
            .ok_or_else(|| RegistryError::UnknownAlias(alias.to_string()))?;
        release(&entry).await;
        info!("Database '{}' removed", alias);
        Ok(())
    }

    /// Registered aliases, sorted
    pub fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.entries.read().keys().cloned().collect();
        aliases.sort();
        aliases
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Health of one alias
    pub async fn health_check(&self, alias: &str) -> Result<()> {
        let entry = self.resolve(Some(alias))?;
        entry.adapter.health_check().await?;
        Ok(())
    }

    /// Remove every alias
    pub async fn shutdown(&self) {
        let entries: Vec<Arc<AliasEntry>> = {
            let mut map = self.entries.write();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            release(entry).await;
        }
        info!("Registry shut down ({} databases released)", entries.len());
    }
}

async fn release(entry: &AliasEntry) {
    if let Some(cache) = &entry.cache {
        cache.shutdown();
    }
    if let Err(e) = entry.adapter.close().await {
        warn!("Closing '{}' failed: {}", entry.alias(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryConnector;
    use crate::cache::CacheConfig;
    use crate::core::BackendError;
    use async_trait::async_trait;
    use std::time::Duration;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryConnector::new()))
    }

    #[tokio::test]
    async fn test_add_resolve_remove() {
        let registry = registry();
        registry
            .add(DatabaseConfig::sqlite("db1", "/tmp/db1.sqlite"))
            .await
            .unwrap();
        assert_eq!(registry.aliases(), vec!["db1"]);

        let entry = registry.resolve(Some("db1")).unwrap();
        assert!(entry.cache.is_none());
        assert!(registry.health_check("db1").await.is_ok());

        registry.remove("db1").await.unwrap();
        assert!(registry.is_empty());
        assert_eq!(
            registry.resolve(Some("db1")).err(),
            Some(RegistryError::UnknownAlias("db1".into()))
        );
        assert!(registry.remove("db1").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_alias_rejected() {
        let registry = registry();
        registry
            .add(DatabaseConfig::sqlite("db1", "/tmp/a.sqlite"))
            .await
            .unwrap();
        let err = registry
            .add(DatabaseConfig::sqlite("db1", "/tmp/b.sqlite"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Registry(RegistryError::DuplicateAlias(_))
        ));
    }

    struct CountingConnector {
        inner: MemoryConnector,
        connects: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl BackendConnector for CountingConnector {
        async fn connect(
            &self,
            config: &DatabaseConfig,
        ) -> std::result::Result<Arc<dyn BackendAdapter>, BackendError> {
            self.connects.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.connect(config).await
        }
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_add_connects_once() {
        let connector = Arc::new(CountingConnector {
            inner: MemoryConnector::new(),
            connects: std::sync::atomic::AtomicUsize::new(0),
        });
        let registry = Registry::new(connector.clone());
        let config = DatabaseConfig::sqlite("db1", "/tmp/race.sqlite").with_cache(CacheConfig::default());

        let (first, second) = tokio::join!(registry.add(config.clone()), registry.add(config));
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.iter().any(|r| matches!(
            r,
            Err(BridgeError::Registry(RegistryError::DuplicateAlias(_)))
        )));
        assert_eq!(connector.connects.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(registry.aliases(), vec!["db1"]);
    }

    #[tokio::test]
    async fn test_cache_engine_per_alias() {
        let registry = registry();
        let cached = DatabaseConfig::sqlite("a", "/tmp/same.sqlite").with_cache(CacheConfig::default());
        let also_cached = DatabaseConfig::sqlite("b", "/tmp/same.sqlite").with_cache(CacheConfig::default());
        let disabled = DatabaseConfig::sqlite("c", "/tmp/same.sqlite").with_cache(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        registry.add(cached).await.unwrap();
        registry.add(also_cached).await.unwrap();
        registry.add(disabled).await.unwrap();

        let a = registry.get("a").unwrap().cache.clone().unwrap();
        let b = registry.get("b").unwrap().cache.clone().unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "a");
        assert!(registry.get("c").unwrap().cache.is_none());

        registry.shutdown().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_default_alias() {
        let registry = registry();
        assert_eq!(registry.resolve(None).err(), Some(RegistryError::NoDefaultAlias));
        registry
            .add(DatabaseConfig::sqlite("main", "/tmp/main.sqlite"))
            .await
            .unwrap();
        registry.set_default_alias(Some("main".into()));
        assert_eq!(registry.resolve(None).unwrap().alias(), "main");
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let registry = registry();
        let mut config = DatabaseConfig::sqlite("db1", "/tmp/x.sqlite");
        config.pool.max_connections = 0;
        let err = registry.add(config).await.unwrap_err();
        assert_eq!(err.kind(), "config");
        assert!(registry.is_empty());
    }

    struct StalledConnector;

    #[async_trait]
    impl BackendConnector for StalledConnector {
        async fn connect(
            &self,
            _config: &DatabaseConfig,
        ) -> std::result::Result<Arc<dyn BackendAdapter>, BackendError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(BackendError::Connection("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let registry = Registry::new(Arc::new(StalledConnector));
        let mut config = DatabaseConfig::sqlite("slow", "/tmp/slow.sqlite");
        config.pool.connection_timeout = 1;
        let err = registry.add(config.clone()).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");

        // The failed add gave its alias back
        let err = registry.add(config).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(registry.is_empty());
    }
}
