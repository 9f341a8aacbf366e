//! Scope → key reverse index.
//!
//! Every stored entry is registered here with its scopes before it is written
//! to the store, so invalidating a scope touches exactly the keys that carry
//! it. Keys also remember their expiry, which lets [`InvalidationIndex::compact`]
//! drop bookkeeping for entries the store has already expired.
//!
//! Registration is guarded by an epoch. Every invalidation advances it and
//! stamps the invalidated scope; a computation observed under an older epoch
//! is refused only when one of its own scopes was stamped since, so a value
//! read before an invalidation can never be stored after it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use metrics::{counter, gauge};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::keys::{CacheKey, Namespace};
use super::lock;
use super::metrics::{METRIC_INDEX_KEYS, METRIC_INVALIDATED};
use super::scope::{ScopeSet, ScopeTag};
use super::store::{CacheStore, StoreError};

const SOURCE: &str = "cache::index";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidationError {
    #[error(
        "invalidation of `{scope}` removed {removed} keys but left {} in place",
        .residual.len()
    )]
    Partial {
        scope: String,
        removed: usize,
        residual: Vec<CacheKey>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("invalidation index is full")]
    Full,
    #[error("an invalidation ran while the value was being computed")]
    Superseded,
}

/// Handle proving a registration; see [`InvalidationIndex::is_current`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration(u64);

/// Opaque invalidation epoch observed before a computation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Epoch(u64);

#[derive(Debug, Clone)]
struct KeyEntry {
    scopes: ScopeSet,
    expires_at: Option<SystemTime>,
    token: u64,
}

#[derive(Default)]
struct IndexState {
    by_scope: HashMap<ScopeTag, HashSet<CacheKey>>,
    by_key: HashMap<CacheKey, KeyEntry>,
    epoch: u64,
    /// Epoch of the last invalidation of each scope, newer than `horizon`.
    invalidated_at: HashMap<ScopeTag, u64>,
    /// Observations older than this are refused whatever their scopes.
    horizon: u64,
    next_token: u64,
}

impl IndexState {
    fn insert(&mut self, key: CacheKey, entry: KeyEntry) {
        self.remove(&key);
        for scope in &entry.scopes {
            self.by_scope
                .entry(scope.clone())
                .or_default()
                .insert(key.clone());
        }
        self.by_key.insert(key, entry);
    }

    fn remove(&mut self, key: &CacheKey) -> Option<KeyEntry> {
        let entry = self.by_key.remove(key)?;
        for scope in &entry.scopes {
            if let Some(keys) = self.by_scope.get_mut(scope) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_scope.remove(scope);
                }
            }
        }
        Some(entry)
    }

    /// Advances the epoch and stamps `scope` with it. Past `max_stamps`
    /// scopes the stamps collapse into the horizon.
    fn stamp(&mut self, scope: &ScopeTag, max_stamps: usize) {
        self.epoch += 1;
        if self.invalidated_at.len() >= max_stamps && !self.invalidated_at.contains_key(scope) {
            self.invalidated_at.clear();
            self.horizon = self.epoch;
            return;
        }
        self.invalidated_at.insert(scope.clone(), self.epoch);
    }

    fn superseded(&self, scopes: &ScopeSet, observed: u64) -> bool {
        observed < self.horizon
            || scopes.iter().any(|scope| {
                self.invalidated_at
                    .get(scope)
                    .is_some_and(|&stamped| stamped > observed)
            })
    }

    fn prune_expired(&mut self, now: SystemTime) -> usize {
        let expired: Vec<CacheKey> = self
            .by_key
            .iter()
            .filter(|(_, entry)| entry.expires_at.is_some_and(|expiry| now >= expiry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

pub struct InvalidationIndex {
    state: RwLock<IndexState>,
    store: Arc<dyn CacheStore>,
    max_keys: usize,
    retry_attempts: u32,
}

impl InvalidationIndex {
    pub fn new(store: Arc<dyn CacheStore>, max_keys: usize, retry_attempts: u32) -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            store,
            max_keys,
            retry_attempts,
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn epoch(&self) -> Epoch {
        Epoch(lock::read(&self.state, SOURCE, "epoch").epoch)
    }

    /// Records `key` under `scopes`. Re-registering a key replaces its scopes.
    pub fn register(
        &self,
        key: CacheKey,
        scopes: ScopeSet,
        expires_at: Option<SystemTime>,
        observed: Epoch,
    ) -> Result<Registration, RegisterError> {
        let mut state = lock::write(&self.state, SOURCE, "register");
        if state.superseded(&scopes, observed.0) {
            return Err(RegisterError::Superseded);
        }
        if !state.by_key.contains_key(&key) && state.by_key.len() >= self.max_keys {
            let pruned = state.prune_expired(SystemTime::now());
            if pruned > 0 {
                debug!(cache = "index", pruned, "Pruned expired keys to make room");
            }
            if state.by_key.len() >= self.max_keys {
                return Err(RegisterError::Full);
            }
        }
        state.next_token += 1;
        let token = state.next_token;
        state.insert(
            key,
            KeyEntry {
                scopes,
                expires_at,
                token,
            },
        );
        gauge!(METRIC_INDEX_KEYS).set(state.by_key.len() as f64);
        Ok(Registration(token))
    }

    /// Whether the registration is still the live one for `key`. False once
    /// the key was invalidated or registered again.
    pub fn is_current(&self, key: &CacheKey, registration: Registration) -> bool {
        lock::read(&self.state, SOURCE, "is_current")
            .by_key
            .get(key)
            .is_some_and(|entry| entry.token == registration.0)
    }

    pub fn unregister(&self, key: &CacheKey) {
        lock::write(&self.state, SOURCE, "unregister").remove(key);
    }

    /// Keys currently registered under `scope`.
    pub fn keys_for(&self, scope: &ScopeTag) -> HashSet<CacheKey> {
        lock::read(&self.state, SOURCE, "keys_for")
            .by_scope
            .get(scope)
            .cloned()
            .unwrap_or_default()
    }

    pub fn scopes_for(&self, key: &CacheKey) -> Option<ScopeSet> {
        lock::read(&self.state, SOURCE, "scopes_for")
            .by_key
            .get(key)
            .map(|entry| entry.scopes.clone())
    }

    pub fn key_count(&self) -> usize {
        lock::read(&self.state, SOURCE, "key_count").by_key.len()
    }

    pub fn scope_count(&self) -> usize {
        lock::read(&self.state, SOURCE, "scope_count").by_scope.len()
    }

    /// Removes every entry carrying `scope` and returns how many were removed.
    pub async fn invalidate(&self, scope: &ScopeTag) -> Result<usize, InvalidationError> {
        let mut keys: HashSet<CacheKey> = {
            let mut state = lock::write(&self.state, SOURCE, "invalidate_collect");
            state.stamp(scope, self.max_keys);
            state.by_scope.get(scope).cloned().unwrap_or_default()
        };

        match scope {
            ScopeTag::Namespace(namespace) if self.store.outlives_process() => {
                match self.store.scan_prefix(&namespace.key_prefix()).await? {
                    Some(scanned) => keys.extend(scanned),
                    None => return self.flush_for(*namespace).await,
                }
            }
            _ => {}
        }

        let keys: Vec<CacheKey> = keys.into_iter().collect();
        let detached = self.detach(&keys);
        let residual = self.delete_with_retry(&keys).await;
        self.reattach(detached, &residual);

        let removed = keys.len() - residual.len();
        counter!(METRIC_INVALIDATED).increment(removed as u64);
        if residual.is_empty() {
            info!(cache = "index", scope = %scope, removed, "Invalidated scope");
            Ok(removed)
        } else {
            warn!(
                cache = "index",
                scope = %scope,
                removed,
                residual = residual.len(),
                "Invalidation left keys in the store"
            );
            Err(InvalidationError::Partial {
                scope: scope.to_string(),
                removed,
                residual,
            })
        }
    }

    pub async fn invalidate_user(&self, actor: &str) -> Result<usize, InvalidationError> {
        self.invalidate(&ScopeTag::user(actor)).await
    }

    /// Invalidates the entity's own scope and the scope of its kind.
    pub async fn invalidate_entity(
        &self,
        kind: &str,
        id: Option<&str>,
    ) -> Result<usize, InvalidationError> {
        let mut scopes = Vec::with_capacity(2);
        if let Some(id) = id {
            scopes.push(ScopeTag::entity(kind, id));
        }
        scopes.push(ScopeTag::entity_kind(kind));
        self.invalidate_each(&scopes).await
    }

    /// Invalidates every scope even after one fails, summing the removed
    /// keys. Partial failures merge into one error naming all failed scopes;
    /// a store error is returned once every scope was attempted.
    pub async fn invalidate_each(&self, scopes: &[ScopeTag]) -> Result<usize, InvalidationError> {
        let mut removed = 0;
        let mut failed = Vec::new();
        let mut residual = Vec::new();
        let mut store_error = None;
        for scope in scopes {
            match self.invalidate(scope).await {
                Ok(count) => removed += count,
                Err(InvalidationError::Partial {
                    scope,
                    removed: count,
                    residual: left,
                }) => {
                    removed += count;
                    failed.push(scope);
                    residual.extend(left);
                }
                Err(InvalidationError::Store(err)) => {
                    store_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = store_error {
            return Err(InvalidationError::Store(err));
        }
        if failed.is_empty() {
            Ok(removed)
        } else {
            Err(InvalidationError::Partial {
                scope: failed.join(", "),
                removed,
                residual,
            })
        }
    }

    /// Drops every entry in the store and in the index.
    pub async fn invalidate_all(&self) -> Result<usize, InvalidationError> {
        let taken = {
            let mut state = lock::write(&self.state, SOURCE, "invalidate_all");
            let epoch = state.epoch + 1;
            let next_token = state.next_token;
            std::mem::replace(
                &mut *state,
                IndexState {
                    epoch,
                    horizon: epoch,
                    next_token,
                    ..IndexState::default()
                },
            )
        };

        if let Err(err) = self.store.flush().await {
            let mut state = lock::write(&self.state, SOURCE, "invalidate_all_restore");
            for (key, entry) in taken.by_key {
                if !state.by_key.contains_key(&key) {
                    state.insert(key, entry);
                }
            }
            warn!(cache = "index", error = %err, "Flush failed; index restored");
            return Err(err.into());
        }

        let removed = taken.by_key.len();
        counter!(METRIC_INVALIDATED).increment(removed as u64);
        gauge!(METRIC_INDEX_KEYS).set(self.key_count() as f64);
        info!(cache = "index", removed, "Invalidated all entries");
        Ok(removed)
    }

    /// Forgets keys whose expiry has passed. Returns how many were dropped.
    pub fn compact(&self, now: SystemTime) -> usize {
        let mut state = lock::write(&self.state, SOURCE, "compact");
        let pruned = state.prune_expired(now);
        gauge!(METRIC_INDEX_KEYS).set(state.by_key.len() as f64);
        pruned
    }

    pub fn spawn_compaction(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let index = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pruned = index.compact(SystemTime::now());
                if pruned > 0 {
                    debug!(cache = "index", pruned, "Compacted invalidation index");
                }
            }
        })
    }

    /// The store cannot enumerate a namespace it holds keys for, so the only
    /// correct invalidation is a full flush.
    async fn flush_for(&self, namespace: Namespace) -> Result<usize, InvalidationError> {
        warn!(
            cache = "index",
            namespace = %namespace,
            store = self.store.name(),
            "Store cannot scan by prefix; flushing everything to invalidate one namespace"
        );
        self.invalidate_all().await
    }

    fn detach(&self, keys: &[CacheKey]) -> Vec<(CacheKey, KeyEntry)> {
        let mut state = lock::write(&self.state, SOURCE, "detach");
        let detached = keys
            .iter()
            .filter_map(|key| state.remove(key).map(|entry| (key.clone(), entry)))
            .collect();
        gauge!(METRIC_INDEX_KEYS).set(state.by_key.len() as f64);
        detached
    }

    /// Residual keys are still in the store, so they go back into the index
    /// unless something registered them again in the meantime.
    fn reattach(&self, detached: Vec<(CacheKey, KeyEntry)>, residual: &[CacheKey]) {
        if residual.is_empty() {
            return;
        }
        let residual: HashSet<&CacheKey> = residual.iter().collect();
        let mut state = lock::write(&self.state, SOURCE, "reattach");
        for (key, entry) in detached {
            if residual.contains(&key) && !state.by_key.contains_key(&key) {
                state.insert(key, entry);
            }
        }
    }

    /// Returns the keys that could not be deleted.
    async fn delete_with_retry(&self, keys: &[CacheKey]) -> Vec<CacheKey> {
        if keys.is_empty() {
            return Vec::new();
        }
        let mut failed = match self.store.delete_many(keys).await {
            Ok(outcome) => outcome.failed,
            Err(err) => {
                warn!(cache = "index", error = %err, keys = keys.len(), "Batch delete failed");
                keys.to_vec()
            }
        };

        let mut attempt = 0;
        while !failed.is_empty() && attempt < self.retry_attempts {
            attempt += 1;
            let mut still_failed = Vec::new();
            for key in failed {
                if let Err(err) = self.store.delete(&key).await {
                    debug!(
                        cache = "index",
                        key = %key,
                        attempt,
                        error = %err,
                        "Delete retry failed"
                    );
                    still_failed.push(key);
                }
            }
            failed = still_failed;
        }
        failed
    }
}
