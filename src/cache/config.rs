//! Cache configuration.
//!
//! Controls what is cached, for how long, and how the index behaves. Loaded
//! from the `[cache]` section of `panelcache.toml`.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use super::keys::Namespace;

const DEFAULT_TTL_SECONDS: u64 = 300;
const DEFAULT_MAX_ENTRIES: usize = 10_000;
const DEFAULT_MIN_CACHE_SIZE: usize = 100;
const DEFAULT_MAX_CACHE_SIZE: usize = 1024 * 1024;
const DEFAULT_AGGRESSIVE_MULTIPLIER: u32 = 4;
const DEFAULT_INDEX_MAX_KEYS: usize = 50_000;
const DEFAULT_COMPACTION_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_INVALIDATION_RETRY_ATTEMPTS: u32 = 2;
const DEFAULT_ACTOR_HEADER: &str = "x-panel-user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Null,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Master switch; when off every operation runs uncached.
    pub enabled: bool,
    pub store: StoreKind,
    /// Capacity of the in-memory store.
    pub max_entries: usize,
    pub default_ttl_seconds: u64,
    /// Per-namespace TTL overriding `default_ttl_seconds`.
    pub ttl_seconds: BTreeMap<Namespace, u64>,
    pub cache_pages: bool,
    pub cache_navigation: bool,
    pub cache_queries: bool,
    /// Forms, tables and widgets.
    pub cache_components: bool,
    pub cache_permissions: bool,
    /// Route names never cached (exact match).
    pub excluded_routes: Vec<String>,
    /// Path globs (leading `/`) or whole path/route-name segments.
    pub excluded_patterns: Vec<String>,
    /// Query parameters whose presence disables caching.
    pub volatile_params: Vec<String>,
    /// Smallest page body worth storing. Other namespaces may store values
    /// of any size.
    pub min_cache_size: usize,
    /// Largest body stored in any namespace.
    pub max_cache_size: usize,
    /// Case-insensitive markers of an error page rendered with a 2xx status.
    /// Only page bodies are checked.
    pub error_signatures: Vec<String>,
    pub aggressive_mode: bool,
    pub aggressive_multiplier: u32,
    pub index_max_keys: usize,
    pub compaction_interval_seconds: u64,
    pub invalidation_retry_attempts: u32,
    /// Request header carrying the authenticated actor id.
    pub actor_header: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: StoreKind::Memory,
            max_entries: DEFAULT_MAX_ENTRIES,
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            ttl_seconds: default_namespace_ttls(),
            cache_pages: true,
            cache_navigation: true,
            cache_queries: true,
            cache_components: true,
            cache_permissions: true,
            excluded_routes: strings(&[
                "filament.admin.auth.login",
                "filament.admin.auth.logout",
                "filament.admin.auth.register",
                "filament.admin.auth.password.request",
                "filament.admin.auth.password.reset",
                "filament.admin.auth.email-verification.prompt",
                "filament.admin.auth.email-verification.verify",
            ]),
            excluded_patterns: strings(&[
                "livewire",
                "login",
                "logout",
                "password",
                "register",
                "verify",
                "two-factor",
                "profile",
            ]),
            volatile_params: strings(&[
                "search",
                "filter",
                "sort",
                "page",
                "action",
                "component",
                "livewire",
                "_token",
            ]),
            min_cache_size: DEFAULT_MIN_CACHE_SIZE,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            error_signatures: strings(&["exception", "stack trace"]),
            aggressive_mode: false,
            aggressive_multiplier: DEFAULT_AGGRESSIVE_MULTIPLIER,
            index_max_keys: DEFAULT_INDEX_MAX_KEYS,
            compaction_interval_seconds: DEFAULT_COMPACTION_INTERVAL_SECONDS,
            invalidation_retry_attempts: DEFAULT_INVALIDATION_RETRY_ATTEMPTS,
            actor_header: DEFAULT_ACTOR_HEADER.to_string(),
        }
    }
}

fn default_namespace_ttls() -> BTreeMap<Namespace, u64> {
    BTreeMap::from([
        (Namespace::Query, 60),
        (Namespace::Navigation, 3600),
        (Namespace::Form, 1800),
        (Namespace::Table, 1800),
        (Namespace::Value, 3600),
    ])
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_string()).collect()
}

impl CacheConfig {
    /// Whether the namespace is switched on by its toggle.
    pub fn namespace_enabled(&self, namespace: Namespace) -> bool {
        match namespace {
            Namespace::Page => self.cache_pages,
            Namespace::Navigation => self.cache_navigation,
            Namespace::Query | Namespace::Count => self.cache_queries,
            Namespace::Form | Namespace::Table | Namespace::Widget => self.cache_components,
            Namespace::Permission => self.cache_permissions,
            Namespace::Value => true,
        }
    }

    pub fn namespace_ttl(&self, namespace: Namespace) -> Duration {
        Duration::from_secs(
            self.ttl_seconds
                .get(&namespace)
                .copied()
                .unwrap_or(self.default_ttl_seconds),
        )
    }

    /// Returns the store capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn max_entries_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_seconds.max(1))
    }
}
