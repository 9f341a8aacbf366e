//! Cacheability decisions.
//!
//! The pre-check ([`CachePolicy::should_cache`]) runs before any lookup and
//! decides from request metadata alone. The post-check
//! ([`CachePolicy::rejection`]) runs on a freshly computed value before it is
//! stored. TTL resolution lives here as well.

use std::fmt;
use std::time::Duration;

use axum::http::Method;
use regex::Regex;
use thiserror::Error;

use super::config::CacheConfig;
use super::keys::Namespace;
use super::payload::CachePayload;

/// How long a stored entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    After(Duration),
    Never,
}

impl Expiry {
    pub fn ttl(self) -> Option<Duration> {
        match self {
            Expiry::After(ttl) => Some(ttl),
            Expiry::Never => None,
        }
    }
}

/// What the pre-check knows about an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpMetadata {
    pub namespace: Namespace,
    /// `None` for operations that are not HTTP requests.
    pub method: Option<Method>,
    pub route: Option<String>,
    pub path: Option<String>,
    /// Canonical query pairs.
    pub query: Vec<(String, String)>,
    /// The request carried a cookie or an authorization header.
    pub has_credentials: bool,
    pub actor: Option<String>,
}

impl OpMetadata {
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            method: None,
            route: None,
            path: None,
            query: Vec::new(),
            has_credentials: false,
            actor: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    Cacheable,
    Disabled,
    NamespaceDisabled,
    NonReadMethod,
    ExcludedRoute,
    ExcludedPattern,
    VolatileParam,
    UnresolvedCredentials,
    ZeroTtl,
}

impl DecisionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionReason::Cacheable => "cacheable",
            DecisionReason::Disabled => "disabled",
            DecisionReason::NamespaceDisabled => "namespace_disabled",
            DecisionReason::NonReadMethod => "non_read_method",
            DecisionReason::ExcludedRoute => "excluded_route",
            DecisionReason::ExcludedPattern => "excluded_pattern",
            DecisionReason::VolatileParam => "volatile_param",
            DecisionReason::UnresolvedCredentials => "unresolved_credentials",
            DecisionReason::ZeroTtl => "zero_ttl",
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyDecision {
    pub cacheable: bool,
    /// Resolved expiry; `None` when the operation is not cacheable.
    pub expiry: Option<Expiry>,
    pub reason: DecisionReason,
}

impl PolicyDecision {
    fn veto(reason: DecisionReason) -> Self {
        Self {
            cacheable: false,
            expiry: None,
            reason,
        }
    }

    fn allow(expiry: Expiry) -> Self {
        Self {
            cacheable: true,
            expiry: Some(expiry),
            reason: DecisionReason::Cacheable,
        }
    }
}

/// Why a computed value was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NotSuccess,
    Private,
    TooSmall,
    TooLarge,
    ErrorSignature,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Rejection::NotSuccess => "not_success",
            Rejection::Private => "private",
            Rejection::TooSmall => "too_small",
            Rejection::TooLarge => "too_large",
            Rejection::ErrorSignature => "error_signature",
        }
    }
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid exclusion pattern `{pattern}`: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid error signature list: {0}")]
    Signatures(#[source] regex::Error),
}

#[derive(Debug)]
enum Exclusion {
    /// Leading `/`: anchored glob over the whole path.
    PathGlob(Regex),
    /// Anything else: equal to one path segment or one route-name segment.
    Segment(String),
}

impl Exclusion {
    fn compile(pattern: &str) -> Result<Self, PolicyError> {
        if !pattern.starts_with('/') {
            return Ok(Exclusion::Segment(pattern.to_string()));
        }
        let mut source = String::from("^");
        let mut rest = pattern;
        while let Some(star) = rest.find('*') {
            source.push_str(&regex::escape(&rest[..star]));
            if rest[star..].starts_with("**") {
                source.push_str(".*");
                rest = &rest[star + 2..];
            } else {
                source.push_str("[^/]*");
                rest = &rest[star + 1..];
            }
        }
        source.push_str(&regex::escape(rest));
        source.push('$');
        Regex::new(&source)
            .map(Exclusion::PathGlob)
            .map_err(|source| PolicyError::Pattern {
                pattern: pattern.to_string(),
                source,
            })
    }

    fn matches(&self, path: Option<&str>, route: Option<&str>) -> bool {
        match self {
            Exclusion::PathGlob(regex) => path.is_some_and(|path| regex.is_match(path)),
            Exclusion::Segment(segment) => {
                path.is_some_and(|path| path.split('/').any(|part| part == segment))
                    || route.is_some_and(|route| route.split('.').any(|part| part == segment))
            }
        }
    }
}

#[derive(Debug)]
pub struct CachePolicy {
    config: CacheConfig,
    exclusions: Vec<Exclusion>,
    signatures: Option<Regex>,
}

impl CachePolicy {
    pub fn new(config: CacheConfig) -> Result<Self, PolicyError> {
        let exclusions = config
            .excluded_patterns
            .iter()
            .filter(|pattern| !pattern.is_empty())
            .map(|pattern| Exclusion::compile(pattern))
            .collect::<Result<Vec<_>, _>>()?;

        let alternatives: Vec<String> = config
            .error_signatures
            .iter()
            .filter(|signature| !signature.is_empty())
            .map(|signature| regex::escape(signature))
            .collect();
        let signatures = if alternatives.is_empty() {
            None
        } else {
            Some(
                Regex::new(&format!("(?i){}", alternatives.join("|")))
                    .map_err(PolicyError::Signatures)?,
            )
        };

        Ok(Self {
            config,
            exclusions,
            signatures,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Pre-check. Vetoes are evaluated in a fixed order and the first one
    /// wins.
    pub fn should_cache(&self, meta: &OpMetadata, explicit_ttl: Option<Expiry>) -> PolicyDecision {
        if let Some(reason) = self.veto(meta) {
            return PolicyDecision::veto(reason);
        }
        match self.resolve_expiry(meta.namespace, explicit_ttl) {
            Some(expiry) => PolicyDecision::allow(expiry),
            None => PolicyDecision::veto(DecisionReason::ZeroTtl),
        }
    }

    fn veto(&self, meta: &OpMetadata) -> Option<DecisionReason> {
        if !self.config.enabled {
            return Some(DecisionReason::Disabled);
        }
        if !self.config.namespace_enabled(meta.namespace) {
            return Some(DecisionReason::NamespaceDisabled);
        }
        if meta
            .method
            .as_ref()
            .is_some_and(|method| *method != Method::GET && *method != Method::HEAD)
        {
            return Some(DecisionReason::NonReadMethod);
        }
        let (path, route) = (meta.path.as_deref(), meta.route.as_deref());
        let excluded_route =
            |route: &str| self.config.excluded_routes.iter().any(|excluded| excluded == route);
        if route.is_some_and(excluded_route) {
            return Some(DecisionReason::ExcludedRoute);
        }
        if self.exclusions.iter().any(|rule| rule.matches(path, route)) {
            return Some(DecisionReason::ExcludedPattern);
        }
        if meta.query.iter().any(|(name, _)| self.is_volatile(name)) {
            return Some(DecisionReason::VolatileParam);
        }
        if meta.has_credentials && meta.actor.is_none() {
            return Some(DecisionReason::UnresolvedCredentials);
        }
        None
    }

    fn is_volatile(&self, name: &str) -> bool {
        let base = name.split('[').next().unwrap_or(name);
        self.config
            .volatile_params
            .iter()
            .any(|volatile| volatile == base)
    }

    /// Explicit TTL, then the namespace TTL, then the default, scaled in
    /// aggressive mode. A zero result means "do not cache".
    pub fn resolve_expiry(&self, namespace: Namespace, explicit: Option<Expiry>) -> Option<Expiry> {
        let ttl = match explicit {
            Some(Expiry::Never) => return Some(Expiry::Never),
            Some(Expiry::After(ttl)) => ttl,
            None => self.config.namespace_ttl(namespace),
        };
        let ttl = if self.config.aggressive_mode {
            ttl.saturating_mul(self.config.aggressive_multiplier.max(1))
        } else {
            ttl
        };
        (!ttl.is_zero()).then_some(Expiry::After(ttl))
    }

    /// Post-check. Size bounds below and error signatures only apply to page
    /// renders; the upper bound applies everywhere.
    pub fn rejection<V: CachePayload>(
        &self,
        namespace: Namespace,
        value: &V,
        encoded_len: usize,
    ) -> Option<Rejection> {
        if !value.is_success() {
            return Some(Rejection::NotSuccess);
        }
        if value.is_private() {
            return Some(Rejection::Private);
        }
        let size = value.body_len().unwrap_or(encoded_len);
        if size > self.config.max_cache_size {
            return Some(Rejection::TooLarge);
        }
        if namespace != Namespace::Page {
            return None;
        }
        if size < self.config.min_cache_size {
            return Some(Rejection::TooSmall);
        }
        match (&self.signatures, value.text()) {
            (Some(signatures), Some(text)) if signatures.is_match(&text) => {
                Some(Rejection::ErrorSignature)
            }
            _ => None,
        }
    }

    pub fn is_cacheable<V: CachePayload>(
        &self,
        namespace: Namespace,
        value: &V,
        encoded_len: usize,
    ) -> bool {
        self.rejection(namespace, value, encoded_len).is_none()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::payload::CachedResponse;

    fn policy(config: CacheConfig) -> CachePolicy {
        CachePolicy::new(config).expect("valid policy")
    }

    fn page(path: &str, route: Option<&str>, query: &[(&str, &str)]) -> OpMetadata {
        OpMetadata {
            method: Some(Method::GET),
            route: route.map(str::to_string),
            path: Some(path.to_string()),
            query: query
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
            ..OpMetadata::new(Namespace::Page)
        }
    }

    fn reason(policy: &CachePolicy, meta: &OpMetadata) -> DecisionReason {
        policy.should_cache(meta, None).reason
    }

    #[test]
    fn plain_page_is_cacheable_with_default_ttl() {
        let policy = policy(CacheConfig::default());
        let meta = page("/admin/users", Some("filament.admin.users"), &[]);
        let decision = policy.should_cache(&meta, None);
        assert!(decision.cacheable);
        assert_eq!(decision.expiry, Some(Expiry::After(Duration::from_secs(300))));
    }

    #[test]
    fn vetoes_apply_in_order() {
        let disabled = policy(CacheConfig {
            enabled: false,
            ..Default::default()
        });
        let mut meta = page("/admin/login", None, &[("page", "2")]);
        meta.method = Some(Method::POST);
        assert_eq!(reason(&disabled, &meta), DecisionReason::Disabled);

        let no_pages = policy(CacheConfig {
            cache_pages: false,
            ..Default::default()
        });
        assert_eq!(reason(&no_pages, &meta), DecisionReason::NamespaceDisabled);

        let policy = policy(CacheConfig::default());
        assert_eq!(reason(&policy, &meta), DecisionReason::NonReadMethod);
        meta.method = Some(Method::HEAD);
        assert_eq!(reason(&policy, &meta), DecisionReason::ExcludedPattern);
        meta.path = Some("/admin/users".to_string());
        assert_eq!(reason(&policy, &meta), DecisionReason::VolatileParam);
        meta.query.clear();
        meta.has_credentials = true;
        assert_eq!(reason(&policy, &meta), DecisionReason::UnresolvedCredentials);
        meta.actor = Some("7".to_string());
        assert_eq!(reason(&policy, &meta), DecisionReason::Cacheable);
    }

    #[test]
    fn excluded_route_is_exact() {
        let policy = policy(CacheConfig {
            excluded_patterns: Vec::new(),
            ..Default::default()
        });
        let meta = page("/admin/x", Some("filament.admin.auth.login"), &[]);
        assert_eq!(reason(&policy, &meta), DecisionReason::ExcludedRoute);
        let meta = page("/admin/x", Some("filament.admin.auth.login.extra"), &[]);
        assert_eq!(reason(&policy, &meta), DecisionReason::Cacheable);
    }

    #[test]
    fn segment_patterns_do_not_match_substrings() {
        let policy = policy(CacheConfig::default());
        assert_eq!(
            reason(&policy, &page("/admin/profile/edit", None, &[])),
            DecisionReason::ExcludedPattern
        );
        assert_eq!(
            reason(&policy, &page("/admin/settings", Some("filament.admin.profile"), &[])),
            DecisionReason::ExcludedPattern
        );
        assert_eq!(
            reason(&policy, &page("/admin/profile-settings-export", None, &[])),
            DecisionReason::Cacheable
        );
    }

    #[test]
    fn path_globs_distinguish_single_and_double_star() {
        let policy = policy(CacheConfig {
            excluded_patterns: vec!["/admin/*/export".to_string(), "/api/**".to_string()],
            ..Default::default()
        });
        assert_eq!(
            reason(&policy, &page("/admin/orders/export", None, &[])),
            DecisionReason::ExcludedPattern
        );
        assert_eq!(
            reason(&policy, &page("/admin/orders/2024/export", None, &[])),
            DecisionReason::Cacheable
        );
        assert_eq!(
            reason(&policy, &page("/api/v1/orders/7", None, &[])),
            DecisionReason::ExcludedPattern
        );
        assert_eq!(
            reason(&policy, &page("/admin/orders/export.csv", None, &[])),
            DecisionReason::Cacheable
        );
    }

    #[test]
    fn volatile_params_match_on_base_name() {
        let policy = policy(CacheConfig::default());
        assert_eq!(
            reason(&policy, &page("/admin/users", None, &[("filter[status]", "active")])),
            DecisionReason::VolatileParam
        );
        assert_eq!(
            reason(&policy, &page("/admin/users", None, &[("filtered", "1")])),
            DecisionReason::Cacheable
        );
    }

    #[test]
    fn ttl_precedence_and_aggressive_mode() {
        let mut config = CacheConfig::default();
        config.ttl_seconds.insert(Namespace::Page, 120);
        let normal = policy(config.clone());
        assert_eq!(
            normal.resolve_expiry(Namespace::Page, None),
            Some(Expiry::After(Duration::from_secs(120)))
        );
        assert_eq!(
            normal.resolve_expiry(Namespace::Page, Some(Expiry::After(Duration::from_secs(5)))),
            Some(Expiry::After(Duration::from_secs(5)))
        );
        assert_eq!(
            normal.resolve_expiry(Namespace::Widget, None),
            Some(Expiry::After(Duration::from_secs(300)))
        );

        config.aggressive_mode = true;
        config.aggressive_multiplier = 3;
        let aggressive = policy(config);
        assert_eq!(
            aggressive.resolve_expiry(Namespace::Page, None),
            Some(Expiry::After(Duration::from_secs(360)))
        );
        assert_eq!(
            aggressive.resolve_expiry(Namespace::Page, Some(Expiry::Never)),
            Some(Expiry::Never)
        );
    }

    #[test]
    fn zero_ttl_means_do_not_cache() {
        let policy = policy(CacheConfig::default());
        let decision = policy.should_cache(
            &OpMetadata::new(Namespace::Query),
            Some(Expiry::After(Duration::ZERO)),
        );
        assert!(!decision.cacheable);
        assert_eq!(decision.reason, DecisionReason::ZeroTtl);
    }

    #[test]
    fn post_check_rejections() {
        let policy = policy(CacheConfig::default());
        let small = Bytes::from(vec![b'a'; 50]);
        let fine = Bytes::from(vec![b'a'; 500]);
        let huge = Bytes::from(vec![b'a'; 2 * 1024 * 1024]);

        assert_eq!(
            policy.rejection(Namespace::Page, &small, small.len()),
            Some(Rejection::TooSmall)
        );
        assert_eq!(policy.rejection(Namespace::Page, &fine, fine.len()), None);
        assert_eq!(
            policy.rejection(Namespace::Query, &huge, huge.len()),
            Some(Rejection::TooLarge)
        );
        assert_eq!(policy.rejection(Namespace::Query, &small, small.len()), None);

        let failing = CachedResponse {
            status: 500,
            headers: Vec::new(),
            body: fine.clone(),
        };
        assert_eq!(policy.rejection(Namespace::Page, &failing, 0), Some(Rejection::NotSuccess));

        let mut error_page = String::from("<h1>Whoops</h1> Stack Trace follows");
        error_page.push_str(&"x".repeat(200));
        let error_page = Bytes::from(error_page);
        assert_eq!(
            policy.rejection(Namespace::Page, &error_page, error_page.len()),
            Some(Rejection::ErrorSignature)
        );
    }
}
