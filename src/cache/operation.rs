//! The kinds of work the cache wraps.
//!
//! Each [`CacheableOperation`] knows its namespace, how its identity and
//! variant are built, which scopes it belongs to, and what the pre-check
//! sees of it. One [`ResponseCache`](super::ResponseCache) serves them all.

use axum::http::Method;
use serde::Serialize;

use super::keys::{CacheKey, Identity, KeyCodec, KeyError, Namespace, Variant};
use super::policy::OpMetadata;
use super::scope::{ScopeSet, ScopeTag};

/// An HTTP page render as seen by the invoking layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub method: Method,
    pub path: String,
    /// Matched route name or template, when the router knows one.
    pub route: Option<String>,
    pub raw_query: Option<String>,
    pub actor: Option<String>,
    pub locale: Option<String>,
    pub has_credentials: bool,
    /// Digest of the cookie and authorization headers.
    pub credential: Option<String>,
}

impl PageRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            route: None,
            raw_query: None,
            actor: None,
            locale: None,
            has_credentials: false,
            credential: None,
        }
    }

    fn variant(&self) -> Variant {
        let variant = Variant::guest()
            .with_optional_actor(self.actor.as_deref())
            .with_optional_locale(self.locale.as_deref());
        match &self.credential {
            Some(digest) => variant.with("credential", digest.as_str()),
            None => variant,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Form,
    Table,
    Widget,
}

impl ComponentKind {
    pub fn namespace(self) -> Namespace {
        match self {
            ComponentKind::Form => Namespace::Form,
            ComponentKind::Table => Namespace::Table,
            ComponentKind::Widget => Namespace::Widget,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheableOperation {
    PageRender(PageRequest),
    QueryExecution {
        sql: String,
        bindings: Vec<serde_json::Value>,
        variant: Variant,
        scopes: ScopeSet,
    },
    QueryCount {
        sql: String,
        bindings: Vec<serde_json::Value>,
        variant: Variant,
        scopes: ScopeSet,
    },
    ComponentSchema {
        kind: ComponentKind,
        /// Owning resource or widget name.
        name: String,
        /// e.g. `create`, `edit`, `columns`, `filters`.
        context: String,
        variant: Variant,
    },
    Navigation {
        panel: String,
        variant: Variant,
    },
    PermissionCheck {
        resource: String,
        actor: Option<String>,
    },
    Value {
        name: String,
        variant: Variant,
        scopes: ScopeSet,
    },
}

impl CacheableOperation {
    /// A query whose bindings are serialized now, so an unencodable binding
    /// fails here rather than silently dropping out of the key.
    pub fn query<B>(sql: &str, bindings: &B, variant: Variant) -> Result<Self, KeyError>
    where
        B: Serialize + ?Sized,
    {
        match Identity::query(sql, bindings)? {
            Identity::Query { sql, bindings } => Ok(CacheableOperation::QueryExecution {
                sql,
                bindings,
                variant,
                scopes: ScopeSet::new(),
            }),
            _ => Err(KeyError::Encoding("query identity expected".into())),
        }
    }

    pub fn count<B>(sql: &str, bindings: &B, variant: Variant) -> Result<Self, KeyError>
    where
        B: Serialize + ?Sized,
    {
        match Self::query(sql, bindings, variant)? {
            CacheableOperation::QueryExecution {
                sql,
                bindings,
                variant,
                scopes,
            } => Ok(CacheableOperation::QueryCount {
                sql,
                bindings,
                variant,
                scopes,
            }),
            other => Ok(other),
        }
    }

    pub fn value(name: impl Into<String>, variant: Variant) -> Self {
        CacheableOperation::Value {
            name: name.into(),
            variant,
            scopes: ScopeSet::new(),
        }
    }

    /// Adds a scope to operations that accept caller-chosen scopes; the
    /// others derive theirs and ignore it.
    pub fn with_scope(mut self, scope: ScopeTag) -> Self {
        match &mut self {
            CacheableOperation::QueryExecution { scopes, .. }
            | CacheableOperation::QueryCount { scopes, .. }
            | CacheableOperation::Value { scopes, .. } => {
                scopes.insert(scope);
            }
            _ => {}
        }
        self
    }

    pub fn namespace(&self) -> Namespace {
        match self {
            CacheableOperation::PageRender(_) => Namespace::Page,
            CacheableOperation::QueryExecution { .. } => Namespace::Query,
            CacheableOperation::QueryCount { .. } => Namespace::Count,
            CacheableOperation::ComponentSchema { kind, .. } => kind.namespace(),
            CacheableOperation::Navigation { .. } => Namespace::Navigation,
            CacheableOperation::PermissionCheck { .. } => Namespace::Permission,
            CacheableOperation::Value { .. } => Namespace::Value,
        }
    }

    fn identity(&self) -> Identity {
        match self {
            CacheableOperation::PageRender(request) => {
                Identity::request(request.path.clone(), request.raw_query.as_deref())
            }
            CacheableOperation::QueryExecution { sql, bindings, .. }
            | CacheableOperation::QueryCount { sql, bindings, .. } => Identity::Query {
                sql: sql.clone(),
                bindings: bindings.clone(),
            },
            CacheableOperation::ComponentSchema {
                kind,
                name,
                context,
                ..
            } => Identity::component(kind.namespace().as_str(), name.clone(), context.clone()),
            CacheableOperation::Navigation { panel, .. } => {
                Identity::component("navigation", panel.clone(), "")
            }
            CacheableOperation::PermissionCheck { resource, .. } => {
                Identity::component("permission", resource.clone(), "")
            }
            CacheableOperation::Value { name, .. } => Identity::named(name.clone()),
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            CacheableOperation::PageRender(request) => request.variant(),
            CacheableOperation::PermissionCheck { actor, .. } => {
                Variant::guest().with_optional_actor(actor.as_deref())
            }
            CacheableOperation::QueryExecution { variant, .. }
            | CacheableOperation::QueryCount { variant, .. }
            | CacheableOperation::ComponentSchema { variant, .. }
            | CacheableOperation::Navigation { variant, .. }
            | CacheableOperation::Value { variant, .. } => variant.clone(),
        }
    }

    pub fn key(&self) -> Result<CacheKey, KeyError> {
        KeyCodec::derive_key(self.namespace(), &self.identity(), &self.variant())
    }

    /// Scopes the entry is registered under, before any recorded during the
    /// computation.
    pub fn scopes(&self) -> ScopeSet {
        let mut scopes = ScopeSet::new();
        scopes.insert(ScopeTag::namespace(self.namespace()));
        let variant = self.variant();
        if !variant.is_guest() {
            scopes.insert(ScopeTag::user(variant.actor()));
        }
        match self {
            CacheableOperation::QueryExecution { scopes: extra, .. }
            | CacheableOperation::QueryCount { scopes: extra, .. }
            | CacheableOperation::Value { scopes: extra, .. } => {
                scopes.extend(extra.iter().cloned());
            }
            CacheableOperation::PermissionCheck { resource, .. } => {
                scopes.insert(ScopeTag::entity_kind(resource.clone()));
            }
            _ => {}
        }
        scopes
    }

    pub fn metadata(&self) -> OpMetadata {
        let variant = self.variant();
        let actor = (!variant.is_guest()).then(|| variant.actor().to_string());
        match self {
            CacheableOperation::PageRender(request) => OpMetadata {
                namespace: Namespace::Page,
                method: Some(request.method.clone()),
                route: request.route.clone(),
                path: Some(request.path.clone()),
                query: KeyCodec::canonical_query(request.raw_query.as_deref().unwrap_or_default()),
                has_credentials: request.has_credentials,
                actor,
            },
            _ => OpMetadata {
                actor,
                ..OpMetadata::new(self.namespace())
            },
        }
    }
}
