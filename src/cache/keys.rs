//! Cache key derivation.
//!
//! A [`CacheKey`] is `"<namespace>:<hex sha-256>"`. The digest covers the
//! namespace, the canonical identity and the canonical variant. Every field is
//! written with a tag byte and a length prefix, so two different field
//! sequences never produce the same byte stream. Derivation is a pure
//! function of its inputs: no clock, no randomness, no per-process seed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Actor value used for every unauthenticated request.
pub const GUEST_ACTOR: &str = "guest";
/// Locale value used when none was resolved.
pub const DEFAULT_LOCALE: &str = "default";

/// Partition of the key space. Kept in clear text as the key prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Page,
    Query,
    Count,
    Navigation,
    Form,
    Table,
    Widget,
    Permission,
    Value,
}

impl Namespace {
    pub const ALL: [Namespace; 9] = [
        Namespace::Page,
        Namespace::Query,
        Namespace::Count,
        Namespace::Navigation,
        Namespace::Form,
        Namespace::Table,
        Namespace::Widget,
        Namespace::Permission,
        Namespace::Value,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Page => "page",
            Namespace::Query => "query",
            Namespace::Count => "count",
            Namespace::Navigation => "navigation",
            Namespace::Form => "form",
            Namespace::Table => "table",
            Namespace::Widget => "widget",
            Namespace::Permission => "permission",
            Namespace::Value => "value",
        }
    }

    /// Key prefix shared by every key of this namespace.
    pub fn key_prefix(self) -> String {
        format!("{}:", self.as_str())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown cache namespace `{0}`")]
pub struct UnknownNamespace(pub String);

impl FromStr for Namespace {
    type Err = UnknownNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Namespace::ALL
            .into_iter()
            .find(|ns| ns.as_str() == s)
            .ok_or_else(|| UnknownNamespace(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("cache identity could not be encoded: {0}")]
    Encoding(String),
}

/// Opaque, deterministic cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace encoded in the key prefix, if the key was produced by
    /// [`KeyCodec::derive_key`].
    pub fn namespace(&self) -> Option<Namespace> {
        self.0
            .split_once(':')
            .and_then(|(prefix, _)| prefix.parse().ok())
    }

    /// Wraps a raw key reported by a store scan.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What is being cached.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    /// An HTTP render: path plus query pairs sorted by name, then value.
    Request {
        path: String,
        query: Vec<(String, String)>,
    },
    /// A data query: statement text plus its bindings in order.
    Query {
        sql: String,
        bindings: Vec<serde_json::Value>,
    },
    /// A UI component definition.
    Component {
        kind: String,
        name: String,
        context: String,
    },
    /// A caller-chosen key.
    Named(String),
}

impl Identity {
    pub fn request(path: impl Into<String>, raw_query: Option<&str>) -> Self {
        Identity::Request {
            path: path.into(),
            query: KeyCodec::canonical_query(raw_query.unwrap_or_default()),
        }
    }

    /// Builds a query identity. `bindings` must serialize to a JSON array (or a
    /// single value, treated as a one-element list).
    pub fn query<B>(sql: &str, bindings: &B) -> Result<Self, KeyError>
    where
        B: Serialize + ?Sized,
    {
        let value =
            serde_json::to_value(bindings).map_err(|err| KeyError::Encoding(err.to_string()))?;
        let bindings = match value {
            serde_json::Value::Array(items) => items,
            serde_json::Value::Null => Vec::new(),
            other => vec![other],
        };
        Ok(Identity::Query {
            sql: sql.trim().to_string(),
            bindings,
        })
    }

    pub fn component(
        kind: impl Into<String>,
        name: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Identity::Component {
            kind: kind.into(),
            name: name.into(),
            context: context.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        Identity::Named(name.into())
    }

    fn write_canonical(&self, out: &mut Canonical) -> Result<(), KeyError> {
        match self {
            Identity::Request { path, query } => {
                out.field(b'R', path.as_bytes());
                for (name, value) in query {
                    out.field(b'k', name.as_bytes());
                    out.field(b'v', value.as_bytes());
                }
            }
            Identity::Query { sql, bindings } => {
                out.field(b'Q', sql.as_bytes());
                for binding in bindings {
                    let encoded = serde_json::to_vec(binding)
                        .map_err(|err| KeyError::Encoding(err.to_string()))?;
                    out.field(b'b', &encoded);
                }
            }
            Identity::Component {
                kind,
                name,
                context,
            } => {
                out.field(b'C', kind.as_bytes());
                out.field(b'c', name.as_bytes());
                out.field(b'x', context.as_bytes());
            }
            Identity::Named(name) => out.field(b'N', name.as_bytes()),
        }
        Ok(())
    }
}

/// Dimensions along which the same identity renders differently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variant {
    actor: Option<String>,
    locale: Option<String>,
    extra: BTreeMap<String, String>,
}

impl Variant {
    pub fn guest() -> Self {
        Self::default()
    }

    /// Blank actor ids are treated as unauthenticated.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = non_blank(actor.into());
        self
    }

    pub fn with_optional_actor(self, actor: Option<&str>) -> Self {
        match actor {
            Some(actor) => self.with_actor(actor),
            None => self,
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = non_blank(locale.into());
        self
    }

    pub fn with_optional_locale(self, locale: Option<&str>) -> Self {
        match locale {
            Some(locale) => self.with_locale(locale),
            None => self,
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    pub fn actor(&self) -> &str {
        self.actor.as_deref().unwrap_or(GUEST_ACTOR)
    }

    pub fn locale(&self) -> &str {
        self.locale.as_deref().unwrap_or(DEFAULT_LOCALE)
    }

    pub fn is_guest(&self) -> bool {
        self.actor.is_none()
    }

    fn write_canonical(&self, out: &mut Canonical) {
        out.field(b'a', self.actor().as_bytes());
        out.field(b'l', self.locale().as_bytes());
        for (name, value) in &self.extra {
            out.field(b'e', name.as_bytes());
            out.field(b'f', value.as_bytes());
        }
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

struct Canonical(Sha256);

impl Canonical {
    fn new() -> Self {
        Self(Sha256::new())
    }

    fn field(&mut self, tag: u8, bytes: &[u8]) {
        self.0.update([tag]);
        self.0.update((bytes.len() as u64).to_be_bytes());
        self.0.update(bytes);
    }

    fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

pub struct KeyCodec;

impl KeyCodec {
    pub fn derive_key(
        namespace: Namespace,
        identity: &Identity,
        variant: &Variant,
    ) -> Result<CacheKey, KeyError> {
        let mut canonical = Canonical::new();
        canonical.field(b'n', namespace.as_str().as_bytes());
        identity.write_canonical(&mut canonical)?;
        variant.write_canonical(&mut canonical);
        Ok(CacheKey(format!("{}:{}", namespace.as_str(), canonical.finish())))
    }

    /// Digest of a request's credential headers, `None` when there are none.
    /// Each header contributes its name and value in the given order.
    pub fn credential_digest<'a>(
        headers: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    ) -> Option<String> {
        let mut canonical = Canonical::new();
        let mut any = false;
        for (name, value) in headers {
            canonical.field(b'h', name.as_bytes());
            canonical.field(b'v', value);
            any = true;
        }
        any.then(|| canonical.finish())
    }

    /// Parses `a=1&b=2` into percent-decoded pairs sorted by name, then value.
    /// Pairs with an empty name are dropped.
    pub fn canonical_query(raw: &str) -> Vec<(String, String)> {
        let raw = raw.strip_prefix('?').unwrap_or(raw);
        let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(raw.as_bytes())
            .filter(|(name, _)| !name.is_empty())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        pairs.sort();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_key(path: &str, query: Option<&str>, variant: &Variant) -> CacheKey {
        KeyCodec::derive_key(Namespace::Page, &Identity::request(path, query), variant)
            .expect("request identities always encode")
    }

    #[test]
    fn derivation_is_stable_across_calls() {
        let variant = Variant::guest().with_actor("42").with_locale("de");
        let first = page_key("/admin/users", Some("page=2"), &variant);
        let second = page_key("/admin/users", Some("page=2"), &variant);
        assert_eq!(first, second);
        assert_eq!(first.namespace(), Some(Namespace::Page));
        assert_eq!(first.as_str().len(), "page:".len() + 64);
    }

    #[test]
    fn known_vector_is_fixed() {
        // Pinned so that any change to the canonical form is noticed.
        let key = KeyCodec::derive_key(Namespace::Value, &Identity::named("x"), &Variant::guest())
            .expect("named identities always encode");
        assert_eq!(key.as_str(), KNOWN_VALUE_X_GUEST);
    }

    const KNOWN_VALUE_X_GUEST: &str =
        "value:d1ffaf8d69a62f8ac6c4fede06d60764f1d3c7126142985fc0bae0900d8b2254";

    #[test]
    fn query_parameter_order_does_not_matter() {
        let variant = Variant::guest();
        assert_eq!(
            page_key("/admin/users", Some("b=2&a=1"), &variant),
            page_key("/admin/users", Some("a=1&b=2"), &variant)
        );
        assert_eq!(
            page_key("/admin/users", Some("a=1%20x"), &variant),
            page_key("/admin/users", Some("a=1+x"), &variant)
        );
    }

    #[test]
    fn each_variant_dimension_changes_the_key() {
        let base = Variant::guest().with_actor("1").with_locale("en");
        let reference = page_key("/admin", None, &base);

        assert_ne!(reference, page_key("/admin", None, &base.clone().with_actor("2")));
        assert_ne!(reference, page_key("/admin", None, &base.clone().with_locale("fr")));
        assert_ne!(
            reference,
            page_key("/admin", None, &base.clone().with("tenant", "acme"))
        );
        assert_ne!(reference, page_key("/admin", Some("page=2"), &base));
        assert_ne!(reference, page_key("/admin/other", None, &base));
    }

    #[test]
    fn unauthenticated_actor_is_guest_never_empty() {
        let blank = Variant::guest().with_actor("  ");
        assert!(blank.is_guest());
        assert_eq!(blank.actor(), GUEST_ACTOR);
        assert_eq!(
            page_key("/admin", None, &blank),
            page_key("/admin", None, &Variant::guest())
        );
        assert_eq!(Variant::guest().locale(), DEFAULT_LOCALE);
    }

    #[test]
    fn guest_literal_and_missing_actor_coincide() {
        // A real actor literally named `guest` shares the guest partition;
        // actor ids come from the auth layer and never use that literal.
        assert_eq!(
            page_key("/admin", None, &Variant::guest().with_actor(GUEST_ACTOR)),
            page_key("/admin", None, &Variant::guest())
        );
    }

    #[test]
    fn field_boundaries_cannot_shift() {
        let left = Identity::component("ab", "c", "");
        let right = Identity::component("a", "bc", "");
        let variant = Variant::guest();
        assert_ne!(
            KeyCodec::derive_key(Namespace::Form, &left, &variant).unwrap(),
            KeyCodec::derive_key(Namespace::Form, &right, &variant).unwrap()
        );

        let joined = Identity::request("/a", Some("b=c"));
        let split = Identity::request("/a?b=c", None);
        assert_ne!(
            KeyCodec::derive_key(Namespace::Page, &joined, &variant).unwrap(),
            KeyCodec::derive_key(Namespace::Page, &split, &variant).unwrap()
        );
    }

    #[test]
    fn namespaces_partition_identical_identities() {
        let identity = Identity::named("users");
        let variant = Variant::guest();
        let query = KeyCodec::derive_key(Namespace::Query, &identity, &variant).unwrap();
        let count = KeyCodec::derive_key(Namespace::Count, &identity, &variant).unwrap();
        assert_ne!(query, count);
        assert!(query.as_str().starts_with("query:"));
        assert!(count.as_str().starts_with("count:"));
    }

    #[test]
    fn query_bindings_are_ordered_and_typed() {
        let variant = Variant::guest();
        let sql = "select * from users where id = ? and role = ?";
        let a = Identity::query(sql, &(1, "admin")).unwrap();
        let b = Identity::query(sql, &("admin", 1)).unwrap();
        let c = Identity::query(sql, &("1", "admin")).unwrap();
        let a_key = KeyCodec::derive_key(Namespace::Query, &a, &variant).unwrap();
        assert_ne!(a_key, KeyCodec::derive_key(Namespace::Query, &b, &variant).unwrap());
        assert_ne!(a_key, KeyCodec::derive_key(Namespace::Query, &c, &variant).unwrap());
    }

    #[test]
    fn unserializable_bindings_fail_with_encoding_error() {
        let mut bad = std::collections::HashMap::new();
        bad.insert((1u8, 2u8), "tuple keys are not valid JSON object keys");
        let err = Identity::query("select 1", &bad).unwrap_err();
        assert!(matches!(err, KeyError::Encoding(_)));
    }

    #[test]
    fn canonical_query_sorts_and_drops_empty_names() {
        assert_eq!(
            KeyCodec::canonical_query("?z=1&=skip&a=2&a=1"),
            vec![
                ("a".to_string(), "1".to_string()),
                ("a".to_string(), "2".to_string()),
                ("z".to_string(), "1".to_string()),
            ]
        );
        assert!(KeyCodec::canonical_query("").is_empty());
    }

    #[test]
    fn namespace_round_trips_through_its_name() {
        for ns in Namespace::ALL {
            assert_eq!(ns.as_str().parse::<Namespace>(), Ok(ns));
        }
        assert!("pages".parse::<Namespace>().is_err());
    }
}
