//! Response cache for read actions
//!
//! Keys have the shape `api:table:{table}:params:{digest}` with optional
//! `:key:{..}` / `:user:{..}` variance suffixes, so every entry of a table
//! can be dropped with one prefix match after a write.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use tabula_auth::sha256_hex;
use tabula_common::config::{CacheConfig, CacheDriver};
use tabula_common::error::Result;

/// Stored cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Unix timestamp (seconds) after which the entry is stale
    pub expires_at: i64,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Storage driver behind the cache manager
pub trait CacheStore: Send + Sync {
    /// # Errors
    /// Returns an error if the storage cannot be read.
    fn get(&self, key: &str, now: i64) -> Result<Option<Value>>;

    /// # Errors
    /// Returns an error if the storage cannot be written.
    fn set(&self, entry: CacheEntry) -> Result<()>;

    /// Remove all entries whose key starts with `prefix`
    ///
    /// # Errors
    /// Returns an error if the storage cannot be swept.
    fn delete_prefix(&self, prefix: &str) -> Result<usize>;

    /// Remove expired entries
    ///
    /// # Errors
    /// Returns an error if the storage cannot be swept.
    fn purge_expired(&self, now: i64) -> Result<usize>;
}

#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str, now: i64) -> Result<Option<Value>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, entry: CacheEntry) -> Result<()> {
        self.entries.lock().insert(entry.key.clone(), entry);
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok(before - entries.len())
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        Ok(before - entries.len())
    }
}

/// One JSON file per entry, named by the SHA-256 of the key
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sha256_hex(key)))
    }

    fn sweep(&self, mut remove: impl FnMut(&CacheEntry) -> bool) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(cached) = fs::read(&path)
                .ok()
                .and_then(|b| serde_json::from_slice::<CacheEntry>(&b).ok())
            else {
                continue;
            };
            if remove(&cached) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }
}

impl CacheStore for FileCacheStore {
    fn get(&self, key: &str, now: i64) -> Result<Option<Value>> {
        let path = self.path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_slice(&bytes)?;
        if entry.is_expired(now) || entry.key != key {
            let _ = fs::remove_file(&path);
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    fn set(&self, entry: CacheEntry) -> Result<()> {
        let path = self.path(&entry.key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        self.sweep(|entry| entry.key.starts_with(prefix))
    }

    fn purge_expired(&self, now: i64) -> Result<usize> {
        self.sweep(|entry| entry.is_expired(now))
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub invalidations: u64,
    pub hit_rate: f64,
}

pub struct CacheManager {
    config: CacheConfig,
    store: Box<dyn CacheStore>,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheManager {
    #[must_use]
    pub fn new(config: CacheConfig, store: Box<dyn CacheStore>) -> Self {
        Self {
            config,
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Cache using the configured driver
    ///
    /// # Errors
    /// Returns an error if the file driver's directory cannot be created.
    pub fn from_config(config: CacheConfig) -> Result<Self> {
        let store: Box<dyn CacheStore> = match config.driver {
            CacheDriver::File if config.enabled => Box::new(FileCacheStore::new(&config.dir)?),
            _ => Box::new(MemoryCacheStore::new()),
        };
        Ok(Self::new(config, store))
    }

    #[must_use]
    pub fn should_cache(&self, table: &str) -> bool {
        self.config.enabled && !self.config.exclude_tables.iter().any(|t| t == table)
    }

    /// Deterministic key for a table read
    ///
    /// Parameters are sorted by name before hashing, so insertion order never
    /// changes the key.
    #[must_use]
    pub fn generate_key(
        &self,
        table: &str,
        params: &HashMap<String, String>,
        api_key: Option<&str>,
        user: Option<&str>,
    ) -> String {
        let sorted: BTreeMap<&str, &str> = params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let canonical = serde_json::to_string(&sorted).unwrap_or_default();
        let mut key = format!("{}params:{}", table_prefix(table), sha256_hex(&canonical));

        if self.config.vary_by_api_key {
            if let Some(api_key) = api_key {
                key.push_str(":key:");
                key.push_str(&sha256_hex(api_key)[..16]);
            }
        }
        if self.config.vary_by_user {
            if let Some(user) = user {
                key.push_str(":user:");
                key.push_str(&sha256_hex(user)[..16]);
            }
        }
        key
    }

    /// Cached value for `key`; storage failures count as misses
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let value = self.store.get(key, Utc::now().timestamp()).unwrap_or_else(|e| {
            warn!("cache read failed: {}", e);
            None
        });
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Store `value` with the table's TTL (falling back to the default)
    pub fn set(&self, key: &str, value: &Value, table: &str) {
        if !self.should_cache(table) {
            return;
        }
        let ttl = self
            .config
            .table_ttl
            .get(table)
            .copied()
            .unwrap_or(self.config.default_ttl);
        let entry = CacheEntry {
            key: key.to_string(),
            value: value.clone(),
            expires_at: Utc::now().timestamp() + i64::try_from(ttl).unwrap_or(i64::MAX / 2),
        };
        match self.store.set(entry) {
            Ok(()) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => warn!(table, "cache write failed: {}", e),
        }
    }

    /// Drop every entry cached for `table`
    pub fn invalidate_table(&self, table: &str) -> usize {
        match self.store.delete_prefix(&table_prefix(table)) {
            Ok(removed) => {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
                debug!(table, removed, "cache invalidated");
                removed
            }
            Err(e) => {
                warn!(table, "cache invalidation failed: {}", e);
                0
            }
        }
    }

    /// Remove expired entries
    ///
    /// # Errors
    /// Returns an error if the store cannot be swept.
    pub fn cleanup(&self) -> Result<usize> {
        self.store.purge_expired(Utc::now().timestamp())
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

fn table_prefix(table: &str) -> String {
    format!("api:table:{table}:")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn manager(config: CacheConfig) -> CacheManager {
        CacheManager::new(config, Box::new(MemoryCacheStore::new()))
    }

    #[test]
    fn test_key_is_order_independent() {
        let cache = manager(CacheConfig::default());
        let mut a = HashMap::new();
        a.insert("page".to_string(), "2".to_string());
        a.insert("filter".to_string(), "age:gt:18".to_string());
        let mut b = HashMap::new();
        b.insert("filter".to_string(), "age:gt:18".to_string());
        b.insert("page".to_string(), "2".to_string());

        let key = cache.generate_key("users", &a, None, None);
        assert_eq!(key, cache.generate_key("users", &b, None, None));
        assert!(key.starts_with("api:table:users:params:"));
        assert_ne!(key, cache.generate_key("posts", &a, None, None));
    }

    #[test]
    fn test_variance_suffixes() {
        let cache = manager(CacheConfig {
            vary_by_api_key: true,
            vary_by_user: true,
            ..CacheConfig::default()
        });
        let p = params(&[("page", "1")]);
        let k1 = cache.generate_key("users", &p, Some("key-a"), None);
        let k2 = cache.generate_key("users", &p, Some("key-b"), None);
        assert_ne!(k1, k2);
        assert!(k1.contains(":key:"));
        assert!(cache
            .generate_key("users", &p, None, Some("7"))
            .contains(":user:"));

        let plain = manager(CacheConfig::default());
        assert_eq!(
            plain.generate_key("users", &p, Some("key-a"), Some("7")),
            plain.generate_key("users", &p, None, None)
        );
    }

    #[test]
    fn test_invalidate_table() {
        let cache = manager(CacheConfig::default());
        let users = cache.generate_key("users", &params(&[("page", "1")]), None, None);
        let posts = cache.generate_key("posts", &params(&[("page", "1")]), None, None);
        cache.set(&users, &json!({"data": []}), "users");
        cache.set(&posts, &json!({"data": []}), "posts");

        assert!(cache.get(&users).is_some());
        assert_eq!(cache.invalidate_table("users"), 1);
        assert!(cache.get(&users).is_none());
        assert!(cache.get(&posts).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.invalidations, 1);
    }

    #[test]
    fn test_excluded_and_disabled() {
        let cache = manager(CacheConfig {
            exclude_tables: vec!["audit".to_string()],
            ..CacheConfig::default()
        });
        assert!(!cache.should_cache("audit"));
        cache.set("api:table:audit:params:x", &json!(1), "audit");
        assert!(cache.get("api:table:audit:params:x").is_none());

        let disabled = manager(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        assert!(!disabled.should_cache("users"));
    }

    #[test]
    fn test_expiry() {
        let store = MemoryCacheStore::new();
        store
            .set(CacheEntry {
                key: "k".into(),
                value: json!(1),
                expires_at: 100,
            })
            .unwrap();
        assert_eq!(store.get("k", 99).unwrap(), Some(json!(1)));
        assert_eq!(store.get("k", 100).unwrap(), None);
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CacheManager::from_config(CacheConfig {
            driver: CacheDriver::File,
            dir: dir.path().to_path_buf(),
            table_ttl: HashMap::from([("users".to_string(), 60)]),
            ..CacheConfig::default()
        })
        .unwrap();

        let key = cache.generate_key("users", &params(&[("action", "list")]), None, None);
        cache.set(&key, &json!({"data": [1]}), "users");
        assert_eq!(cache.get(&key), Some(json!({"data": [1]})));
        assert_eq!(cache.invalidate_table("users"), 1);
        assert_eq!(cache.get(&key), None);
        assert_eq!(cache.cleanup().unwrap(), 0);
    }
}
