//! Failure-injecting store for unit tests.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use super::keys::CacheKey;
use super::store::{CacheStore, MemoryStore, StoreError, StoredEntry};

/// Wraps a [`MemoryStore`] and fails on demand.
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    persistent: bool,
    scannable: bool,
    unavailable: AtomicBool,
    delete_failures: Mutex<HashMap<CacheKey, u32>>,
    pub(crate) gets: AtomicUsize,
    pub(crate) puts: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            inner: MemoryStore::new(NonZeroUsize::new(capacity).unwrap()),
            persistent: false,
            scannable: true,
            unavailable: AtomicBool::new(false),
            delete_failures: Mutex::new(HashMap::new()),
            gets: AtomicUsize::new(0),
            puts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub(crate) fn scannable(mut self, scannable: bool) -> Self {
        self.scannable = scannable;
        self
    }

    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `times` deletes of `key` fail.
    pub(crate) fn fail_deletes(&self, key: &CacheKey, times: u32) {
        self.delete_failures
            .lock()
            .unwrap()
            .insert(key.clone(), times);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("flaky", "injected outage"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn outlives_process(&self) -> bool {
        self.persistent
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<StoredEntry>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(
        &self,
        key: &CacheKey,
        entry: StoredEntry,
    ) -> Result<Option<CacheKey>, StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.inner.put(key, entry).await
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool, StoreError> {
        self.check()?;
        {
            let mut failures = self.delete_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(key).filter(|remaining| **remaining > 0) {
                *remaining -= 1;
                return Err(StoreError::unavailable("flaky", "injected delete failure"));
            }
        }
        self.inner.delete(key).await
    }

    async fn flush(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.flush().await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Option<Vec<CacheKey>>, StoreError> {
        self.check()?;
        if self.scannable {
            self.inner.scan_prefix(prefix).await
        } else {
            Ok(None)
        }
    }

    fn len(&self) -> Option<usize> {
        self.inner.len()
    }
}
