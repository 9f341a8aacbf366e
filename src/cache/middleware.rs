//! Page render caching for axum routers.
//!
//! [`response_cache_layer`] turns each request into a
//! [`CacheableOperation::PageRender`] and serves it through the shared
//! [`ResponseCache`]. [`invalidate_on_write`] drops page entries after a
//! successful write so the next read sees fresh data.

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use tracing::{debug, instrument, warn};

use super::keys::{KeyCodec, Namespace};
use super::operation::{CacheableOperation, PageRequest};
use super::payload::CachedResponse;
use super::response::{CacheCore, ComputeError, ResponseCache};
use super::scope::ScopeTag;

/// Response header reporting whether the body came from the cache.
pub const CACHE_STATUS_HEADER: &str = "x-panelcache";

/// Shared state for both middlewares.
#[derive(Clone)]
pub struct CacheLayerState {
    pub pages: ResponseCache<CachedResponse>,
    pub actor_header: String,
}

impl CacheLayerState {
    pub fn new(core: &CacheCore) -> Self {
        Self {
            pages: core.responses(),
            actor_header: core.policy().config().actor_header.clone(),
        }
    }

    fn actor(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.actor_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|actor| !actor.is_empty())
            .map(str::to_string)
    }

    fn page_request(&self, request: &Request<Body>) -> PageRequest {
        let headers = request.headers();
        let credential = credential_digest(headers);
        PageRequest {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            route: request
                .extensions()
                .get::<MatchedPath>()
                .map(|matched| matched.as_str().to_string()),
            raw_query: request.uri().query().map(str::to_string),
            actor: self.actor(headers),
            locale: preferred_locale(headers),
            has_credentials: credential.is_some(),
            credential,
        }
    }
}

/// Sessions are keyed by what was presented, not by the actor header alone.
fn credential_digest(headers: &HeaderMap) -> Option<String> {
    let names = [header::COOKIE, header::AUTHORIZATION];
    let presented = names.iter().flat_map(|name| {
        headers
            .get_all(name)
            .into_iter()
            .map(move |value| (name.as_str(), value.as_bytes()))
    });
    KeyCodec::credential_digest(presented)
}

/// First language tag of `Accept-Language`, without its quality value.
fn preferred_locale(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|tag| tag.split(';').next())
        .map(str::trim)
        .filter(|tag| !tag.is_empty() && *tag != "*")
        .map(str::to_ascii_lowercase)
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

/// Serves page renders through the cache.
///
/// Only 200 responses within the configured size bounds are stored; anything
/// else is passed through unchanged. Event streams are never buffered.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn response_cache_layer(
    State(cache): State<CacheLayerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if is_event_stream(request.headers()) {
        return next.run(request).await;
    }

    let operation = CacheableOperation::PageRender(cache.page_request(&request));
    let compute = move || async move { buffer(next.run(request).await).await };

    match cache.pages.fetch(&operation, None, compute).await {
        Ok(fetched) => {
            let outcome = if fetched.hit { "hit" } else { "miss" };
            debug!(cache = "page", outcome, status = fetched.value.status);
            build_response(fetched.value, fetched.hit)
        }
        Err(err) => {
            warn!(cache = "page", error = %err, "Page render failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Invalidates page entries after a successful non-read request, together
/// with everything cached for the acting user.
#[instrument(skip_all, fields(method = %request.method(), path = %request.uri().path()))]
pub async fn invalidate_on_write(
    State(cache): State<CacheLayerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if matches!(*request.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return next.run(request).await;
    }

    let actor = cache.actor(request.headers());
    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let index = cache.pages.core().index();
    match index.invalidate(&ScopeTag::namespace(Namespace::Page)).await {
        Ok(removed) => debug!(cache = "page", outcome = "invalidated", removed),
        Err(err) => warn!(cache = "page", error = %err, "Page invalidation incomplete"),
    }
    if let Some(actor) = actor {
        if let Err(err) = index.invalidate_user(&actor).await {
            warn!(cache = "page", actor = %actor, error = %err, "User invalidation incomplete");
        }
    }
    response
}

async fn buffer(response: Response) -> Result<CachedResponse, ComputeError> {
    let (parts, body) = response.into_parts();
    let body = BodyExt::collect(body)
        .await
        .map_err(ComputeError::new)?
        .to_bytes();
    Ok(CachedResponse {
        status: parts.status.as_u16(),
        headers: parts
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect(),
        body,
    })
}

fn build_response(cached: CachedResponse, hit: bool) -> Response {
    let mut builder = Response::builder().status(cached.status);
    for (name, value) in &cached.headers {
        if let Ok(value) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), value);
        }
    }
    builder
        .header(CACHE_STATUS_HEADER, if hit { "hit" } else { "miss" })
        .body(Body::from(cached.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
