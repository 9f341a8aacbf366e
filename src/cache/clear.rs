//! `--type` selectors for clearing the cache.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::index::{InvalidationError, InvalidationIndex};
use super::keys::Namespace;
use super::scope::ScopeTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ClearTarget {
    All,
    Pages,
    Queries,
    Navigation,
    Forms,
    Tables,
    Widgets,
    Permissions,
}

impl ClearTarget {
    pub const ALL: [ClearTarget; 8] = [
        ClearTarget::All,
        ClearTarget::Pages,
        ClearTarget::Queries,
        ClearTarget::Navigation,
        ClearTarget::Forms,
        ClearTarget::Tables,
        ClearTarget::Widgets,
        ClearTarget::Permissions,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ClearTarget::All => "all",
            ClearTarget::Pages => "pages",
            ClearTarget::Queries => "queries",
            ClearTarget::Navigation => "navigation",
            ClearTarget::Forms => "forms",
            ClearTarget::Tables => "tables",
            ClearTarget::Widgets => "widgets",
            ClearTarget::Permissions => "permissions",
        }
    }

    /// Namespace scopes covered by the selector; empty for [`ClearTarget::All`],
    /// which flushes instead.
    pub fn scopes(self) -> Vec<ScopeTag> {
        let namespaces: &[Namespace] = match self {
            ClearTarget::All => &[],
            ClearTarget::Pages => &[Namespace::Page],
            ClearTarget::Queries => &[Namespace::Query, Namespace::Count],
            ClearTarget::Navigation => &[Namespace::Navigation],
            ClearTarget::Forms => &[Namespace::Form],
            ClearTarget::Tables => &[Namespace::Table],
            ClearTarget::Widgets => &[Namespace::Widget],
            ClearTarget::Permissions => &[Namespace::Permission],
        };
        namespaces.iter().copied().map(ScopeTag::namespace).collect()
    }

    /// Applies the selector and returns the number of entries removed.
    pub async fn apply(self, index: &InvalidationIndex) -> Result<usize, InvalidationError> {
        if self == ClearTarget::All {
            return index.invalidate_all().await;
        }
        index.invalidate_each(&self.scopes()).await
    }
}

impl fmt::Display for ClearTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "unknown cache type `{0}` (expected one of all, pages, queries, navigation, forms, tables, \
     widgets, permissions)"
)]
pub struct UnknownClearTarget(pub String);

impl FromStr for ClearTarget {
    type Err = UnknownClearTarget;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClearTarget::ALL
            .into_iter()
            .find(|target| target.as_str() == s)
            .ok_or_else(|| UnknownClearTarget(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::cache::keys::{Identity, KeyCodec, Variant};
    use crate::cache::scope::ScopeSet;
    use crate::cache::keys::CacheKey;
    use crate::cache::store::{CacheStore, MemoryStore, StoredEntry};
    use crate::cache::testing::FlakyStore;

    async fn seed(index: &InvalidationIndex, namespace: Namespace, name: &str) -> CacheKey {
        let key = KeyCodec::derive_key(namespace, &Identity::named(name), &Variant::guest())
            .unwrap();
        let scopes = ScopeSet::from([ScopeTag::namespace(namespace)]);
        index
            .register(key.clone(), scopes.clone(), None, index.epoch())
            .unwrap();
        index
            .store()
            .put(&key, StoredEntry::new(Bytes::from_static(b"v"), None, scopes))
            .await
            .unwrap();
        key
    }

    fn index() -> InvalidationIndex {
        InvalidationIndex::new(
            Arc::new(MemoryStore::new(NonZeroUsize::new(32).unwrap())),
            32,
            1,
        )
    }

    #[test]
    fn selectors_parse_from_their_names() {
        for target in ClearTarget::ALL {
            assert_eq!(target.as_str().parse::<ClearTarget>(), Ok(target));
        }
        assert!("everything".parse::<ClearTarget>().is_err());
    }

    #[tokio::test]
    async fn queries_selector_clears_queries_and_counts_only() {
        let index = index();
        seed(&index, Namespace::Query, "rows").await;
        seed(&index, Namespace::Count, "total").await;
        seed(&index, Namespace::Page, "home").await;

        assert_eq!(ClearTarget::Queries.apply(&index).await, Ok(2));
        assert_eq!(index.key_count(), 1);
    }

    #[tokio::test]
    async fn selector_clears_remaining_namespaces_after_a_failure() {
        let store = Arc::new(FlakyStore::new(32));
        let index = InvalidationIndex::new(store.clone(), 32, 0);
        let rows = seed(&index, Namespace::Query, "rows").await;
        let total = seed(&index, Namespace::Count, "total").await;
        store.fail_deletes(&rows, u32::MAX);

        match ClearTarget::Queries.apply(&index).await {
            Err(InvalidationError::Partial {
                scope,
                removed,
                residual,
            }) => {
                assert_eq!(scope, "namespace:query");
                assert_eq!(removed, 1);
                assert_eq!(residual, vec![rows]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(store.get(&total).await.unwrap().is_none());
        assert_eq!(index.key_count(), 1);
    }

    #[tokio::test]
    async fn all_selector_flushes() {
        let index = index();
        seed(&index, Namespace::Form, "f").await;
        seed(&index, Namespace::Widget, "w").await;

        assert_eq!(ClearTarget::All.apply(&index).await, Ok(2));
        assert_eq!(index.store().len(), Some(0));
    }
}
