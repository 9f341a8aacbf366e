//! Invalidation scopes and the task-local scope collector.
//!
//! A [`ScopeTag`] names a set of entries that must be dropped together. Tags
//! are attached when an entry is stored; computations may add tags of their
//! own through [`record`] while they run inside [`with_collector`].

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::keys::Namespace;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScopeTag {
    /// Every entry of a namespace.
    Namespace(Namespace),
    /// Every entry rendered for one actor.
    User(String),
    /// Entries derived from an entity kind, or from one entity of that kind.
    Entity { kind: String, id: Option<String> },
    /// Free-form grouping chosen by the caller.
    Tag(String),
}

pub type ScopeSet = BTreeSet<ScopeTag>;

impl ScopeTag {
    pub fn namespace(namespace: Namespace) -> Self {
        ScopeTag::Namespace(namespace)
    }

    pub fn user(actor: impl Into<String>) -> Self {
        ScopeTag::User(actor.into())
    }

    pub fn entity(kind: impl Into<String>, id: impl Into<String>) -> Self {
        ScopeTag::Entity {
            kind: kind.into(),
            id: Some(id.into()),
        }
    }

    pub fn entity_kind(kind: impl Into<String>) -> Self {
        ScopeTag::Entity {
            kind: kind.into(),
            id: None,
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        ScopeTag::Tag(tag.into())
    }
}

impl fmt::Display for ScopeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeTag::Namespace(ns) => write!(f, "namespace:{ns}"),
            ScopeTag::User(actor) => write!(f, "user:{actor}"),
            ScopeTag::Entity { kind, id: None } => write!(f, "entity:{kind}"),
            ScopeTag::Entity { kind, id: Some(id) } => write!(f, "entity:{kind}:{id}"),
            ScopeTag::Tag(tag) => write!(f, "tag:{tag}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeParseError {
    #[error("scope `{0}` has no `<kind>:<value>` form")]
    Malformed(String),
    #[error("scope kind `{0}` is not one of namespace, user, entity, tag")]
    UnknownKind(String),
    #[error(transparent)]
    Namespace(#[from] super::keys::UnknownNamespace),
}

impl FromStr for ScopeTag {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .filter(|(_, rest)| !rest.is_empty())
            .ok_or_else(|| ScopeParseError::Malformed(s.to_string()))?;

        match kind {
            "namespace" => Ok(ScopeTag::Namespace(rest.parse()?)),
            "user" => Ok(ScopeTag::user(rest)),
            "tag" => Ok(ScopeTag::tag(rest)),
            "entity" => match rest.split_once(':') {
                Some((entity, id)) if !entity.is_empty() && !id.is_empty() => {
                    Ok(ScopeTag::entity(entity, id))
                }
                Some(_) => Err(ScopeParseError::Malformed(s.to_string())),
                None => Ok(ScopeTag::entity_kind(rest)),
            },
            other => Err(ScopeParseError::UnknownKind(other.to_string())),
        }
    }
}

impl TryFrom<String> for ScopeTag {
    type Error = ScopeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ScopeTag> for String {
    fn from(value: ScopeTag) -> Self {
        value.to_string()
    }
}

tokio::task_local! {
    static COLLECTED: RefCell<ScopeSet>;
}

/// Attach a scope to the entry currently being computed.
///
/// Outside a collector the call is ignored.
pub fn record(scope: ScopeTag) {
    let _ = COLLECTED.try_with(|collected| {
        collected.borrow_mut().insert(scope);
    });
}

/// Run `fut` with a fresh collector and return its output together with every
/// scope recorded while it ran.
pub async fn with_collector<F>(fut: F) -> (F::Output, ScopeSet)
where
    F: Future,
{
    COLLECTED
        .scope(RefCell::new(ScopeSet::new()), async move {
            let output = fut.await;
            let collected = COLLECTED
                .try_with(|collected| std::mem::take(&mut *collected.borrow_mut()))
                .unwrap_or_default();
            (output, collected)
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_agree() {
        for raw in [
            "namespace:page",
            "user:42",
            "entity:User",
            "entity:User:42",
            "tag:dashboard",
        ] {
            let parsed: ScopeTag = raw.parse().expect("valid scope");
            assert_eq!(parsed.to_string(), raw);
        }
    }

    #[test]
    fn malformed_scopes_are_rejected() {
        assert!(matches!(
            "user".parse::<ScopeTag>(),
            Err(ScopeParseError::Malformed(_))
        ));
        assert!(matches!(
            "user:".parse::<ScopeTag>(),
            Err(ScopeParseError::Malformed(_))
        ));
        assert!(matches!(
            "entity:User:".parse::<ScopeTag>(),
            Err(ScopeParseError::Malformed(_))
        ));
        assert!(matches!(
            "team:1".parse::<ScopeTag>(),
            Err(ScopeParseError::UnknownKind(_))
        ));
        assert!(matches!(
            "namespace:pages".parse::<ScopeTag>(),
            Err(ScopeParseError::Namespace(_))
        ));
    }

    #[test]
    fn serde_uses_the_string_form() {
        let json = serde_json::to_string(&ScopeTag::entity("Order", "7")).unwrap();
        assert_eq!(json, "\"entity:Order:7\"");
        let back: ScopeTag = serde_json::from_str("\"namespace:query\"").unwrap();
        assert_eq!(back, ScopeTag::namespace(Namespace::Query));
    }

    #[tokio::test]
    async fn record_without_collector_is_ignored() {
        record(ScopeTag::tag("orphan"));
    }

    #[tokio::test]
    async fn collector_captures_and_deduplicates() {
        let (value, scopes) = with_collector(async {
            record(ScopeTag::entity_kind("User"));
            tokio::task::yield_now().await;
            record(ScopeTag::entity_kind("User"));
            record(ScopeTag::user("7"));
            5
        })
        .await;

        assert_eq!(value, 5);
        assert_eq!(scopes.len(), 2);
        assert!(scopes.contains(&ScopeTag::user("7")));
    }

    #[tokio::test]
    async fn nested_collectors_are_independent() {
        let (inner, outer) = with_collector(async {
            record(ScopeTag::tag("outer"));
            let (_, inner) = with_collector(async {
                record(ScopeTag::tag("inner"));
            })
            .await;
            inner
        })
        .await;

        assert_eq!(inner.into_iter().collect::<Vec<_>>(), vec![ScopeTag::tag("inner")]);
        assert_eq!(outer.into_iter().collect::<Vec<_>>(), vec![ScopeTag::tag("outer")]);
    }
}
