//! Sliding-window rate limiting
//!
//! Each identifier (user, API-key hash or client IP) owns a list of request
//! timestamps. Every check prunes timestamps that fell out of the trailing
//! window, then either records the new request or denies it. Records are
//! persisted through a [`RateLimitStore`] so limits survive restarts when the
//! file store is used.

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use tabula_common::config::RateLimitConfig;
use tabula_common::error::{Error, Result};

/// Persisted request history for one identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub identifier: String,
    /// Unix timestamps (seconds) of requests inside the window
    pub timestamps: Vec<i64>,
    pub updated_at: i64,
}

/// Durable storage for rate-limit records
pub trait RateLimitStore: Send + Sync {
    /// # Errors
    /// Returns an error if the backing storage cannot be read.
    fn load(&self, identifier: &str) -> Result<Option<RateLimitRecord>>;

    /// # Errors
    /// Returns an error if the backing storage cannot be written.
    fn save(&self, record: &RateLimitRecord) -> Result<()>;

    /// # Errors
    /// Returns an error if the backing storage cannot be written.
    fn remove(&self, identifier: &str) -> Result<()>;

    /// Remove records not updated within `older_than_seconds` of `now`
    ///
    /// # Errors
    /// Returns an error if the backing storage cannot be read.
    fn cleanup(&self, older_than_seconds: u64, now: i64) -> Result<usize>;
}

// ============================================================================
// Stores
// ============================================================================

/// Process-local store
#[derive(Default)]
pub struct MemoryRateLimitStore {
    records: Mutex<HashMap<String, RateLimitRecord>>,
}

impl MemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn load(&self, identifier: &str) -> Result<Option<RateLimitRecord>> {
        Ok(self.records.lock().get(identifier).cloned())
    }

    fn save(&self, record: &RateLimitRecord) -> Result<()> {
        self.records
            .lock()
            .insert(record.identifier.clone(), record.clone());
        Ok(())
    }

    fn remove(&self, identifier: &str) -> Result<()> {
        self.records.lock().remove(identifier);
        Ok(())
    }

    fn cleanup(&self, older_than_seconds: u64, now: i64) -> Result<usize> {
        let cutoff = now - seconds(older_than_seconds);
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| r.updated_at >= cutoff);
        Ok(before - records.len())
    }
}

/// One JSON file per identifier, named by the SHA-256 of the identifier
pub struct FileRateLimitStore {
    dir: PathBuf,
}

impl FileRateLimitStore {
    /// # Errors
    /// Returns an error if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, identifier: &str) -> PathBuf {
        self.dir
            .join(format!("{}.json", tabula_auth::sha256_hex(identifier)))
    }
}

impl RateLimitStore for FileRateLimitStore {
    fn load(&self, identifier: &str) -> Result<Option<RateLimitRecord>> {
        let path = self.path(identifier);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, record: &RateLimitRecord) -> Result<()> {
        let path = self.path(&record.identifier);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(record)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, identifier: &str) -> Result<()> {
        match fs::remove_file(self.path(identifier)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn cleanup(&self, older_than_seconds: u64, now: i64) -> Result<usize> {
        let cutoff = now - seconds(older_than_seconds);
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stale = match fs::read(&path)
                .ok()
                .and_then(|b| serde_json::from_slice::<RateLimitRecord>(&b).ok())
            {
                Some(record) => record.updated_at < cutoff,
                None => true,
            };
            if stale {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

// ============================================================================
// Limiter
// ============================================================================

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request recorded and allowed
    Allowed {
        /// Remaining requests in window
        remaining: u32,
        /// Total limit
        limit: u32,
    },
    /// Request denied, nothing recorded
    Limited {
        limit: u32,
        /// Seconds until the oldest request leaves the window
        reset: u64,
        window: u64,
    },
}

impl RateLimitResult {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// The 429 error carrying the limit metadata, if denied
    #[must_use]
    pub fn to_error(&self) -> Option<Error> {
        match *self {
            Self::Allowed { .. } => None,
            Self::Limited { limit, reset, window } => Some(Error::RateLimitExceeded {
                limit,
                remaining: 0,
                reset,
                window,
            }),
        }
    }
}

/// Read-only view of an identifier's current window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub reset: u64,
    pub window: u64,
}

pub struct RateLimiter {
    enabled: bool,
    max_requests: u32,
    window_seconds: u64,
    store: Box<dyn RateLimitStore>,
    /// Serializes load-modify-save per identifier
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimitConfig, store: Box<dyn RateLimitStore>) -> Self {
        Self {
            enabled: config.enabled,
            max_requests: config.max_requests,
            window_seconds: config.window_seconds,
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter backed by the configured storage directory, or memory when unset
    ///
    /// # Errors
    /// Returns an error if the storage directory cannot be created.
    pub fn from_config(config: &RateLimitConfig) -> Result<Self> {
        let store: Box<dyn RateLimitStore> = match (&config.storage_dir, config.enabled) {
            (Some(dir), true) => Box::new(FileRateLimitStore::new(dir)?),
            _ => Box::new(MemoryRateLimitStore::new()),
        };
        Ok(Self::new(config, store))
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    #[must_use]
    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Record a request for `identifier` if it is under the limit
    #[must_use]
    pub fn check_limit(&self, identifier: &str) -> bool {
        self.check(identifier).is_allowed()
    }

    /// Like [`check_limit`](Self::check_limit) with per-call limits
    #[must_use]
    pub fn check_limit_with(&self, identifier: &str, max_requests: u32, window_seconds: u64) -> bool {
        self.check_at(identifier, max_requests, window_seconds, Utc::now().timestamp())
            .is_allowed()
    }

    /// Check with the configured limits, returning header metadata
    #[must_use]
    pub fn check(&self, identifier: &str) -> RateLimitResult {
        self.check_at(
            identifier,
            self.max_requests,
            self.window_seconds,
            Utc::now().timestamp(),
        )
    }

    fn check_at(&self, identifier: &str, max_requests: u32, window_seconds: u64, now: i64) -> RateLimitResult {
        if !self.enabled {
            return RateLimitResult::Allowed {
                remaining: max_requests,
                limit: max_requests,
            };
        }

        let lock = self.identifier_lock(identifier);
        let _guard = lock.lock();
        let mut timestamps = match self.store.load(identifier) {
            Ok(record) => record.map(|r| r.timestamps).unwrap_or_default(),
            Err(e) => {
                warn!(identifier, "rate limit storage unavailable, allowing request: {}", e);
                return RateLimitResult::Allowed {
                    remaining: max_requests,
                    limit: max_requests,
                };
            }
        };
        prune(&mut timestamps, window_seconds, now);

        let count = u32::try_from(timestamps.len()).unwrap_or(u32::MAX);
        let result = if count >= max_requests {
            debug!(identifier, count, "rate limit exceeded");
            RateLimitResult::Limited {
                limit: max_requests,
                reset: reset_after(&timestamps, window_seconds, now),
                window: window_seconds,
            }
        } else {
            timestamps.push(now);
            RateLimitResult::Allowed {
                remaining: max_requests - count - 1,
                limit: max_requests,
            }
        };

        let record = RateLimitRecord {
            identifier: identifier.to_string(),
            timestamps,
            updated_at: now,
        };
        if let Err(e) = self.store.save(&record) {
            warn!(identifier, "failed to persist rate limit record: {}", e);
        }
        result
    }

    /// Requests currently inside the window
    #[must_use]
    pub fn get_request_count(&self, identifier: &str) -> u32 {
        self.count_at(identifier, Utc::now().timestamp())
    }

    fn count_at(&self, identifier: &str, now: i64) -> u32 {
        u32::try_from(self.window_at(identifier, now).len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn get_remaining_requests(&self, identifier: &str) -> u32 {
        self.max_requests
            .saturating_sub(self.get_request_count(identifier))
    }

    /// Seconds until the oldest request in the window expires (0 when empty)
    #[must_use]
    pub fn get_reset_time(&self, identifier: &str) -> u64 {
        let now = Utc::now().timestamp();
        reset_after(&self.window_at(identifier, now), self.window_seconds, now)
    }

    #[must_use]
    pub fn status(&self, identifier: &str) -> RateLimitStatus {
        let now = Utc::now().timestamp();
        let window = self.window_at(identifier, now);
        let count = u32::try_from(window.len()).unwrap_or(u32::MAX);
        RateLimitStatus {
            limit: self.max_requests,
            remaining: self.max_requests.saturating_sub(count),
            reset: reset_after(&window, self.window_seconds, now),
            window: self.window_seconds,
        }
    }

    /// Pruned timestamps without mutating stored state
    fn window_at(&self, identifier: &str, now: i64) -> Vec<i64> {
        if !self.enabled {
            return vec![];
        }
        let mut timestamps = match self.store.load(identifier) {
            Ok(record) => record.map(|r| r.timestamps).unwrap_or_default(),
            Err(e) => {
                warn!(identifier, "rate limit storage unavailable: {}", e);
                vec![]
            }
        };
        prune(&mut timestamps, self.window_seconds, now);
        timestamps
    }

    /// Forget all history for `identifier`
    ///
    /// # Errors
    /// Returns an error if the record cannot be removed.
    pub fn reset(&self, identifier: &str) -> Result<()> {
        let lock = self.identifier_lock(identifier);
        let _guard = lock.lock();
        self.store.remove(identifier)
    }

    /// Delete records untouched for `older_than_seconds`
    ///
    /// # Errors
    /// Returns an error if the storage cannot be swept.
    pub fn cleanup(&self, older_than_seconds: u64) -> Result<usize> {
        // locks held only by the map belong to no in-flight request
        self.locks.lock().retain(|_, lock| Arc::strong_count(lock) > 1);
        self.store.cleanup(older_than_seconds, Utc::now().timestamp())
    }

    fn identifier_lock(&self, identifier: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(identifier.to_string())
                .or_default(),
        )
    }
}

fn seconds(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn prune(timestamps: &mut Vec<i64>, window_seconds: u64, now: i64) {
    let cutoff = now.saturating_sub(seconds(window_seconds));
    timestamps.retain(|&ts| ts > cutoff);
}

fn reset_after(timestamps: &[i64], window_seconds: u64, now: i64) -> u64 {
    timestamps.iter().min().map_or(0, |&oldest| {
        let reset = oldest.saturating_add(seconds(window_seconds)) - now;
        u64::try_from(reset).unwrap_or(0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_requests: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            max_requests,
            window_seconds: 60,
            storage_dir: None,
        }
    }

    fn limiter(max_requests: u32) -> RateLimiter {
        RateLimiter::new(&config(max_requests), Box::new(MemoryRateLimitStore::new()))
    }

    #[test]
    fn test_limit_enforced() {
        let limiter = limiter(3);
        for _ in 0..3 {
            assert!(limiter.check_limit("ip:1.2.3.4"));
        }
        assert!(!limiter.check_limit("ip:1.2.3.4"));
        assert!(limiter.check_limit("ip:5.6.7.8"));
        assert_eq!(limiter.get_request_count("ip:1.2.3.4"), 3);
        assert_eq!(limiter.get_remaining_requests("ip:1.2.3.4"), 0);
    }

    #[test]
    fn test_denied_requests_not_recorded() {
        let limiter = limiter(1);
        let now = 1_000;
        assert!(limiter.check_at("u", 1, 60, now).is_allowed());
        let denied = limiter.check_at("u", 1, 60, now + 10);
        assert_eq!(
            denied,
            RateLimitResult::Limited {
                limit: 1,
                reset: 50,
                window: 60
            }
        );
        assert_eq!(limiter.count_at("u", now + 10), 1);
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(2);
        let now = 10_000;
        assert!(limiter.check_at("u", 2, 60, now).is_allowed());
        assert!(limiter.check_at("u", 2, 60, now + 30).is_allowed());
        assert!(!limiter.check_at("u", 2, 60, now + 59).is_allowed());
        // first request has left the window
        assert!(limiter.check_at("u", 2, 60, now + 61).is_allowed());
    }

    #[test]
    fn test_reset() {
        let limiter = limiter(1);
        assert!(limiter.check_limit("k"));
        assert!(!limiter.check_limit("k"));
        limiter.reset("k").unwrap();
        assert!(limiter.check_limit("k"));
    }

    #[test]
    fn test_reads_do_not_mutate() {
        let limiter = limiter(5);
        assert!(limiter.check_limit("k"));
        for _ in 0..10 {
            let _ = limiter.get_request_count("k");
            let _ = limiter.get_reset_time("k");
        }
        let status = limiter.status("k");
        assert_eq!(status.remaining, 4);
        assert!(status.reset <= 60);
    }

    #[test]
    fn test_disabled_short_circuits() {
        struct PanickingStore;
        impl RateLimitStore for PanickingStore {
            fn load(&self, _: &str) -> Result<Option<RateLimitRecord>> {
                panic!("storage touched")
            }
            fn save(&self, _: &RateLimitRecord) -> Result<()> {
                panic!("storage touched")
            }
            fn remove(&self, _: &str) -> Result<()> {
                Ok(())
            }
            fn cleanup(&self, _: u64, _: i64) -> Result<usize> {
                Ok(0)
            }
        }

        let mut cfg = config(1);
        cfg.enabled = false;
        let limiter = RateLimiter::new(&cfg, Box::new(PanickingStore));
        for _ in 0..5 {
            assert!(limiter.check_limit("k"));
        }
        assert_eq!(limiter.get_request_count("k"), 0);
    }

    #[test]
    fn test_file_store_persists_and_cleans() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRateLimitStore::new(dir.path()).unwrap();
        let record = RateLimitRecord {
            identifier: "user:42".into(),
            timestamps: vec![100, 110],
            updated_at: 110,
        };
        store.save(&record).unwrap();
        assert_eq!(store.load("user:42").unwrap(), Some(record));
        assert_eq!(store.load("user:43").unwrap(), None);

        let name = format!("{}.json", tabula_auth::sha256_hex("user:42"));
        assert!(dir.path().join(name).exists());

        assert_eq!(store.cleanup(3600, 200).unwrap(), 0);
        assert_eq!(store.cleanup(60, 200).unwrap(), 1);
        assert_eq!(store.load("user:42").unwrap(), None);
    }

    #[test]
    fn test_file_backed_limiter_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RateLimitConfig {
            storage_dir: Some(dir.path().to_path_buf()),
            ..config(1)
        };
        assert!(RateLimiter::from_config(&cfg).unwrap().check_limit("ip:9.9.9.9"));
        assert!(!RateLimiter::from_config(&cfg).unwrap().check_limit("ip:9.9.9.9"));
    }

    #[test]
    fn test_per_call_limits_override_config() {
        let limiter = limiter(100);
        assert!(limiter.check_limit_with("login:alice", 2, 300));
        assert!(limiter.check_limit_with("login:alice", 2, 300));
        assert!(!limiter.check_limit_with("login:alice", 2, 300));

        // the configured limit still applies to the same history
        assert!(limiter.check_limit("login:alice"));
        assert_eq!(limiter.get_request_count("login:alice"), 3);

        let now = 10_000;
        assert!(limiter.check_at("short", 1, 5, now).is_allowed());
        assert!(!limiter.check_at("short", 1, 5, now + 4).is_allowed());
        assert!(limiter.check_at("short", 1, 5, now + 6).is_allowed());
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let dir = tempfile::tempdir().unwrap();
        let limiter = RateLimiter::new(&config(5), Box::new(FileRateLimitStore::new(dir.path()).unwrap()));

        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| scope.spawn(|| limiter.check_limit("ip:10.0.0.1")))
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(allowed, 5);
        assert_eq!(limiter.get_request_count("ip:10.0.0.1"), 5);
    }

    #[test]
    fn test_cleanup_drops_idle_identifier_locks() {
        let limiter = limiter(10);
        for i in 0..4 {
            assert!(limiter.check_limit(&format!("ip:10.0.0.{i}")));
        }
        assert_eq!(limiter.locks.lock().len(), 4);
        limiter.cleanup(3600).unwrap();
        assert!(limiter.locks.lock().is_empty());
    }
}
