//! Cache storage backends.
//!
//! [`CacheStore`] is the seam between the cache core and wherever entries
//! live. The core never assumes a store is reachable: every method returns
//! `Result`, and the caller degrades to computing without the cache.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;

use super::keys::CacheKey;
use super::lock;
use super::metrics::METRIC_EVICT;
use super::scope::ScopeSet;

const SOURCE: &str = "cache::store";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("cache store `{store}` is unavailable: {message}")]
    Unavailable {
        store: &'static str,
        message: String,
    },
    #[error("cache entry could not be (de)serialized: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn unavailable(store: &'static str, message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            store,
            message: message.into(),
        }
    }
}

/// A stored value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub payload: Bytes,
    pub created_at: SystemTime,
    /// `None` keeps the entry until it is invalidated or evicted.
    pub ttl: Option<Duration>,
    pub scopes: ScopeSet,
}

impl StoredEntry {
    pub fn new(payload: Bytes, ttl: Option<Duration>, scopes: ScopeSet) -> Self {
        Self {
            payload,
            created_at: SystemTime::now(),
            ttl,
            scopes,
        }
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.ttl.and_then(|ttl| self.created_at.checked_add(ttl))
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expires_at().is_some_and(|expiry| now >= expiry)
    }
}

/// Result of a batched delete. Keys in `failed` are still present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDelete {
    pub removed: usize,
    pub failed: Vec<CacheKey>,
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether entries survive a restart of this process. Such stores may
    /// hold keys the in-process index has never seen.
    fn outlives_process(&self) -> bool {
        false
    }

    /// Whether a successful `put` can be read back. Stores that discard
    /// writes are never indexed.
    fn retains_entries(&self) -> bool {
        true
    }

    /// Expired entries must never be returned.
    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, StoreError>;

    /// Stores `entry`, returning a different key the store evicted to make
    /// room, if any.
    async fn put(&self, key: &CacheKey, entry: StoredEntry) -> Result<Option<CacheKey>, StoreError>;

    /// Returns whether the key was present.
    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError>;

    async fn delete_many(&self, keys: &[CacheKey]) -> Result<BatchDelete, StoreError> {
        let mut outcome = BatchDelete::default();
        for key in keys {
            match self.delete(key).await {
                Ok(_) => outcome.removed += 1,
                Err(_) => outcome.failed.push(key.clone()),
            }
        }
        Ok(outcome)
    }

    async fn flush(&self) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, or `None` when the store cannot scan.
    async fn scan_prefix(&self, _prefix: &str) -> Result<Option<Vec<CacheKey>>, StoreError> {
        Ok(None)
    }

    /// Number of live entries, when cheaply known.
    fn len(&self) -> Option<usize> {
        None
    }
}

/// In-process LRU store with per-entry expiry.
pub struct MemoryStore {
    entries: RwLock<LruCache<CacheKey, StoredEntry>>,
}

impl MemoryStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, StoreError> {
        let mut entries = lock::write(&self.entries, SOURCE, "memory_get");
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.is_expired_at(SystemTime::now()) => true,
            Some(entry) => return Ok(Some(entry.clone())),
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &CacheKey,
        entry: StoredEntry,
    ) -> Result<Option<CacheKey>, StoreError> {
        let evicted = lock::write(&self.entries, SOURCE, "memory_put")
            .push(key.clone(), entry)
            .map(|(evicted, _)| evicted)
            .filter(|evicted| evicted != key);
        if evicted.is_some() {
            counter!(METRIC_EVICT).increment(1);
        }
        Ok(evicted)
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        Ok(lock::write(&self.entries, SOURCE, "memory_delete")
            .pop(key)
            .is_some())
    }

    async fn delete_many(&self, keys: &[CacheKey]) -> Result<BatchDelete, StoreError> {
        let mut entries = lock::write(&self.entries, SOURCE, "memory_delete_many");
        for key in keys {
            entries.pop(key);
        }
        Ok(BatchDelete {
            removed: keys.len(),
            failed: Vec::new(),
        })
    }

    async fn flush(&self) -> Result<(), StoreError> {
        lock::write(&self.entries, SOURCE, "memory_flush").clear();
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Option<Vec<CacheKey>>, StoreError> {
        let entries = lock::read(&self.entries, SOURCE, "memory_scan");
        Ok(Some(
            entries
                .iter()
                .filter(|(key, _)| key.as_str().starts_with(prefix))
                .map(|(key, _)| key.clone())
                .collect(),
        ))
    }

    fn len(&self) -> Option<usize> {
        Some(lock::read(&self.entries, SOURCE, "memory_len").len())
    }
}

/// Store that keeps nothing; every lookup misses.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl CacheStore for NullStore {
    fn name(&self) -> &'static str {
        "null"
    }

    fn retains_entries(&self) -> bool {
        false
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<StoredEntry>, StoreError> {
        Ok(None)
    }

    async fn put(
        &self,
        _key: &CacheKey,
        _entry: StoredEntry,
    ) -> Result<Option<CacheKey>, StoreError> {
        Ok(None)
    }

    async fn delete(&self, _key: &CacheKey) -> Result<bool, StoreError> {
        Ok(false)
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn scan_prefix(&self, _prefix: &str) -> Result<Option<Vec<CacheKey>>, StoreError> {
        Ok(Some(Vec::new()))
    }

    fn len(&self) -> Option<usize> {
        Some(0)
    }
}
