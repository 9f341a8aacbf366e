//! Response and query cache.
//!
//! Keys are derived deterministically from a namespace, an identity and a
//! variant ([`KeyCodec`]). [`ResponseCache`] reads through a pluggable
//! [`CacheStore`], runs each missing computation once per key, and registers
//! the stored entry under its scopes in the [`InvalidationIndex`] so that a
//! write can drop exactly the entries it affects.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! enabled = true
//! store = "memory"
//! default_ttl_seconds = 300
//! # ... see config.rs for all options
//! ```

mod clear;
mod config;
mod flight;
mod index;
mod keys;
mod lock;
pub mod metrics;
mod middleware;
mod operation;
mod payload;
mod policy;
mod response;
pub mod scope;
mod store;
#[cfg(test)]
mod testing;

pub use clear::{ClearTarget, UnknownClearTarget};
pub use config::{CacheConfig, StoreKind};
pub use index::{Epoch, InvalidationError, InvalidationIndex, RegisterError, Registration};
pub use keys::{
    CacheKey, DEFAULT_LOCALE, GUEST_ACTOR, Identity, KeyCodec, KeyError, Namespace,
    UnknownNamespace, Variant,
};
pub use middleware::{
    CACHE_STATUS_HEADER, CacheLayerState, invalidate_on_write, response_cache_layer,
};
pub use operation::{CacheableOperation, ComponentKind, PageRequest};
pub use payload::{CachePayload, CachedResponse, Json};
pub use policy::{
    CachePolicy, DecisionReason, Expiry, OpMetadata, PolicyDecision, PolicyError, Rejection,
};
pub use response::{CacheCore, CacheStats, ComputeError, Fetched, ResponseCache};
pub use scope::{ScopeParseError, ScopeSet, ScopeTag};
pub use store::{BatchDelete, CacheStore, MemoryStore, NullStore, StoreError, StoredEntry};
