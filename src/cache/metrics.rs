//! Metric names emitted by the cache core.

pub const METRIC_HIT: &str = "panelcache_hit_total";
pub const METRIC_MISS: &str = "panelcache_miss_total";
pub const METRIC_COALESCED: &str = "panelcache_coalesced_total";
pub const METRIC_STORE_ERROR: &str = "panelcache_store_error_total";
pub const METRIC_REJECTED: &str = "panelcache_rejected_total";
pub const METRIC_INVALIDATED: &str = "panelcache_invalidated_total";
pub const METRIC_EVICT: &str = "panelcache_evict_total";
pub const METRIC_INDEX_KEYS: &str = "panelcache_index_keys";
