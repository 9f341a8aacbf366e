//! Single-flight coordination.
//!
//! At most one computation runs per key inside this process. The first caller
//! (the leader) spawns the work onto its own task and publishes a shared
//! future; every caller arriving while it runs awaits a clone of that future.
//! A caller that gives up only drops its clone: the spawned work keeps going
//! and the others still receive its result.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use super::keys::CacheKey;
use super::response::ComputeError;

type SharedOutput<T> = Shared<BoxFuture<'static, Result<T, ComputeError>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Leader,
    Follower,
}

struct Flight<T: Clone> {
    id: u64,
    output: SharedOutput<T>,
}

pub(crate) struct SingleFlight<T: Clone> {
    inflight: Arc<DashMap<CacheKey, Flight<T>>>,
    next_id: AtomicU64,
}

/// Removes the leader's own map entry however its task ends, panics included.
struct Departure<T: Clone> {
    inflight: Arc<DashMap<CacheKey, Flight<T>>>,
    key: CacheKey,
    id: u64,
}

impl<T: Clone> Drop for Departure<T> {
    fn drop(&mut self) {
        self.inflight.remove_if(&self.key, |_, flight| flight.id == self.id);
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Joins the flight for `key`, starting it with `start` if none is running.
    pub(crate) async fn run<F>(&self, key: CacheKey, start: F) -> (Result<T, ComputeError>, Role)
    where
        F: FnOnce() -> BoxFuture<'static, Result<T, ComputeError>>,
    {
        let (output, role) = match self.inflight.entry(key.clone()) {
            Entry::Occupied(existing) => (existing.get().output.clone(), Role::Follower),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let departure = Departure {
                    inflight: Arc::clone(&self.inflight),
                    key,
                    id,
                };
                let work = start();
                let handle = tokio::spawn(async move {
                    let _departure = departure;
                    work.await
                });
                let output = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(join_error) => Err(ComputeError::panicked(join_error.to_string())),
                    }
                }
                .boxed()
                .shared();
                slot.insert(Flight {
                    id,
                    output: output.clone(),
                });
                (output, Role::Leader)
            }
        };
        (output.await, role)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inflight.len()
    }
}
