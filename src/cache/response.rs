//! Read-through cache with single-flight population.
//!
//! [`ResponseCache::get_or_compute`] serves fresh entries from the store and
//! otherwise runs the computation once per key, however many callers ask at
//! the same time. Cache trouble never fails the caller: a store that errors is
//! logged, counted, and bypassed.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use metrics::counter;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use super::config::{CacheConfig, StoreKind};
use super::flight::{Role, SingleFlight};
use super::index::{InvalidationIndex, RegisterError};
use super::keys::{CacheKey, Namespace, Variant};
use super::metrics::{
    METRIC_COALESCED, METRIC_HIT, METRIC_MISS, METRIC_REJECTED, METRIC_STORE_ERROR,
};
use super::operation::CacheableOperation;
use super::payload::CachePayload;
use super::policy::{CachePolicy, Expiry, PolicyError};
use super::scope::{self, ScopeSet, ScopeTag};
use super::store::{CacheStore, MemoryStore, NullStore, StoreError, StoredEntry};

/// Failure of a wrapped computation. Cheap to clone so that every waiter of a
/// shared computation receives the same error.
#[derive(Clone)]
pub struct ComputeError {
    inner: Arc<dyn StdError + Send + Sync + 'static>,
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

#[derive(Debug, Error)]
#[error("computation panicked: {0}")]
struct Panicked(String);

impl ComputeError {
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = Box::new(err);
        match boxed.downcast::<ComputeError>() {
            Ok(already) => *already,
            Err(other) => Self {
                inner: Arc::from(other),
            },
        }
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    pub(crate) fn panicked(message: impl Into<String>) -> Self {
        Self::new(Panicked(message.into()))
    }

    pub fn is_panic(&self) -> bool {
        self.downcast_ref::<Panicked>().is_some()
    }

    /// The error returned by the computation, if it has type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.inner.downcast_ref::<E>()
    }
}

impl fmt::Debug for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.inner, f)
    }
}

impl StdError for ComputeError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source()
    }
}

/// A value and whether it was served from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<V> {
    pub value: V,
    pub hit: bool,
}

#[derive(Clone)]
struct Computed<V> {
    value: V,
    scopes: ScopeSet,
    from_store: bool,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    store_errors: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub store: &'static str,
    pub entries: Option<usize>,
    pub indexed_keys: usize,
    pub scopes: usize,
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub store_errors: u64,
    pub rejected: u64,
}

/// Shared cache state: one store, one index, one policy.
#[derive(Clone)]
pub struct CacheCore {
    store: Arc<dyn CacheStore>,
    index: Arc<InvalidationIndex>,
    policy: Arc<CachePolicy>,
    counters: Arc<Counters>,
}

impl CacheCore {
    pub fn new(config: CacheConfig, store: Arc<dyn CacheStore>) -> Result<Self, PolicyError> {
        let index = InvalidationIndex::new(
            Arc::clone(&store),
            config.index_max_keys,
            config.invalidation_retry_attempts,
        );
        Ok(Self {
            store,
            index: Arc::new(index),
            policy: Arc::new(CachePolicy::new(config)?),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Builds the store named by `config.store`.
    pub fn from_config(config: CacheConfig) -> Result<Self, PolicyError> {
        let store: Arc<dyn CacheStore> = match config.store {
            StoreKind::Memory => Arc::new(MemoryStore::new(config.max_entries_non_zero())),
            StoreKind::Null => Arc::new(NullStore),
        };
        Self::new(config, store)
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<InvalidationIndex> {
        &self.index
    }

    pub fn policy(&self) -> &Arc<CachePolicy> {
        &self.policy
    }

    /// A cache for values of type `V` sharing this core.
    pub fn responses<V: CachePayload>(&self) -> ResponseCache<V> {
        ResponseCache {
            core: self.clone(),
            flights: Arc::new(SingleFlight::new()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let counters = &self.counters;
        CacheStats {
            enabled: self.policy.config().enabled,
            store: self.store.name(),
            entries: self.store.len(),
            indexed_keys: self.index.key_count(),
            scopes: self.index.scope_count(),
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            store_errors: counters.store_errors.load(Ordering::Relaxed),
            rejected: counters.rejected.load(Ordering::Relaxed),
        }
    }

    fn store_error(&self, op: &'static str, key: &CacheKey, err: &StoreError) {
        self.counters.store_errors.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_STORE_ERROR, "op" => op).increment(1);
        warn!(
            cache = "store",
            op,
            key = %key,
            store = self.store.name(),
            error = %err,
            "Cache store failed; serving without the cache"
        );
    }

    /// Store lookup. `Err` means the store is unusable for this call.
    async fn lookup<V: CachePayload>(
        &self,
        key: &CacheKey,
    ) -> Result<Option<(V, ScopeSet)>, StoreError> {
        let entry = match self.store.get(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(err) => {
                self.store_error("get", key, &err);
                return Err(err);
            }
        };
        match V::from_entry(&entry) {
            Ok(value) => Ok(Some((value, entry.scopes))),
            Err(err) => {
                // Unreadable entries are dropped and recomputed.
                self.store_error("decode", key, &err);
                if let Err(err) = self.store.delete(key).await {
                    self.store_error("delete", key, &err);
                }
                self.index.unregister(key);
                Ok(None)
            }
        }
    }

    /// Leader path, run on its own task.
    async fn populate<V, F, Fut>(
        self,
        key: CacheKey,
        expiry: Expiry,
        mut scopes: ScopeSet,
        compute: F,
    ) -> Result<Computed<V>, ComputeError>
    where
        V: CachePayload,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        let epoch = self.index.epoch();
        if let Ok(Some((value, stored_scopes))) = self.lookup::<V>(&key).await {
            return Ok(Computed {
                value,
                scopes: stored_scopes,
                from_store: true,
            });
        }

        let (value, recorded) = scope::with_collector(compute()).await;
        let value = value?;
        scopes.extend(recorded);
        let namespace = key.namespace().unwrap_or(Namespace::Value);
        scopes.insert(ScopeTag::namespace(namespace));
        let computed = |value| Computed {
            value,
            scopes: scopes.clone(),
            from_store: false,
        };

        let payload = match value.encode() {
            Ok(payload) => payload,
            Err(err) => {
                self.store_error("encode", &key, &err);
                return Ok(computed(value));
            }
        };
        if let Some(rejection) = self.policy.rejection(namespace, &value, payload.len()) {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_REJECTED, "reason" => rejection.as_str()).increment(1);
            debug!(cache = "response", key = %key, reason = rejection.as_str(), "Value not stored");
            return Ok(computed(value));
        }
        if !self.store.retains_entries() {
            return Ok(computed(value));
        }

        let entry = StoredEntry::new(payload, expiry.ttl(), scopes.clone());
        let expires_at = entry.expires_at();
        let registered = self
            .index
            .register(key.clone(), scopes.clone(), expires_at, epoch);
        let registration = match registered {
            Ok(registration) => registration,
            Err(RegisterError::Full) => {
                warn!(cache = "index", key = %key, "Invalidation index full; value not stored");
                return Ok(computed(value));
            }
            Err(RegisterError::Superseded) => {
                debug!(
                    cache = "index",
                    key = %key,
                    "Invalidated while computing; value not stored"
                );
                return Ok(computed(value));
            }
        };

        match self.store.put(&key, entry).await {
            Ok(Some(evicted)) => self.index.unregister(&evicted),
            Ok(None) => {}
            Err(err) => {
                self.store_error("put", &key, &err);
                self.index.unregister(&key);
                return Ok(computed(value));
            }
        }

        // An invalidation that detached the key before the put leaves a
        // stored but unindexed entry; drop it here.
        if !self.index.is_current(&key, registration) {
            if let Err(err) = self.store.delete(&key).await {
                self.store_error("delete", &key, &err);
            }
        }
        Ok(computed(value))
    }
}

pub struct ResponseCache<V: CachePayload> {
    core: CacheCore,
    flights: Arc<SingleFlight<Computed<V>>>,
}

impl<V: CachePayload> Clone for ResponseCache<V> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<V: CachePayload> ResponseCache<V> {
    pub fn core(&self) -> &CacheCore {
        &self.core
    }

    /// Returns the cached value for `key`, or computes, stores and returns it.
    ///
    /// Errors from `compute` are returned to every waiter and never cached.
    /// The scopes of the returned entry are recorded into the caller's scope
    /// collector, so an enclosing cached computation inherits them.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        expiry: Expiry,
        scopes: ScopeSet,
        compute: F,
    ) -> Result<Fetched<V>, ComputeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        let counters = &self.core.counters;
        match self.core.lookup::<V>(&key).await {
            Ok(Some((value, stored_scopes))) => {
                counters.hits.fetch_add(1, Ordering::Relaxed);
                counter!(METRIC_HIT).increment(1);
                debug!(cache = "response", outcome = "hit", key = %key);
                stored_scopes.into_iter().for_each(scope::record);
                return Ok(Fetched { value, hit: true });
            }
            Ok(None) => {}
            Err(_) => {
                let value = compute().await?;
                return Ok(Fetched { value, hit: false });
            }
        }

        counters.misses.fetch_add(1, Ordering::Relaxed);
        counter!(METRIC_MISS).increment(1);
        debug!(cache = "response", outcome = "miss", key = %key);

        let core = self.core.clone();
        let leader_key = key.clone();
        let (result, role) = self
            .flights
            .run(key, move || {
                core.populate(leader_key, expiry, scopes, compute).boxed()
            })
            .await;
        if role == Role::Follower {
            counters.coalesced.fetch_add(1, Ordering::Relaxed);
            counter!(METRIC_COALESCED).increment(1);
        }

        let computed = result?;
        computed.scopes.into_iter().for_each(scope::record);
        Ok(Fetched {
            value: computed.value,
            hit: role == Role::Leader && computed.from_store,
        })
    }

    /// Runs the whole read path for an operation: pre-check, key derivation,
    /// then [`get_or_compute`](Self::get_or_compute). Anything that rules out
    /// caching falls back to running `compute` directly.
    pub async fn fetch<F, Fut>(
        &self,
        operation: &CacheableOperation,
        explicit_ttl: Option<Expiry>,
        compute: F,
    ) -> Result<Fetched<V>, ComputeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        let decision = self
            .core
            .policy
            .should_cache(&operation.metadata(), explicit_ttl);
        let expiry = match decision.expiry {
            Some(expiry) if decision.cacheable => expiry,
            _ => {
                debug!(
                    cache = "response",
                    outcome = "bypass",
                    namespace = %operation.namespace(),
                    reason = decision.reason.as_str()
                );
                let value = compute().await?;
                return Ok(Fetched { value, hit: false });
            }
        };

        let key = match operation.key() {
            Ok(key) => key,
            Err(err) => {
                warn!(
                    cache = "response",
                    namespace = %operation.namespace(),
                    error = %err,
                    "Cache key could not be derived; computing uncached"
                );
                let value = compute().await?;
                return Ok(Fetched { value, hit: false });
            }
        };

        self.get_or_compute(key, expiry, operation.scopes(), compute)
            .await
    }

    /// Caches a named value for `ttl`. Values are partitioned by `variant`
    /// like every other operation.
    pub async fn remember<F, Fut>(
        &self,
        name: &str,
        variant: Variant,
        ttl: Duration,
        compute: F,
    ) -> Result<Fetched<V>, ComputeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        self.fetch(
            &CacheableOperation::value(name, variant),
            Some(Expiry::After(ttl)),
            compute,
        )
        .await
    }

    /// Caches a named value until it is invalidated or evicted.
    pub async fn remember_forever<F, Fut>(
        &self,
        name: &str,
        variant: Variant,
        compute: F,
    ) -> Result<Fetched<V>, ComputeError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ComputeError>> + Send + 'static,
    {
        self.fetch(
            &CacheableOperation::value(name, variant),
            Some(Expiry::Never),
            compute,
        )
        .await
    }

    /// Drops a named value. Returns whether it was present.
    pub async fn forget(&self, name: &str, variant: Variant) -> Result<bool, StoreError> {
        let key = CacheableOperation::value(name, variant)
            .key()
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.core.index.unregister(&key);
        self.core.store.delete(&key).await
    }
}
