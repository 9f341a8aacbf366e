//! Admin API for cache maintenance.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::application::error::HttpError;
use crate::cache::{CacheCore, CacheStats, ClearTarget, ScopeTag};

#[derive(Clone)]
pub struct AdminState {
    pub cache: CacheCore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClearRequest {
    #[serde(rename = "type", default = "default_target")]
    pub target: ClearTarget,
}

fn default_target() -> ClearTarget {
    ClearTarget::All
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationSummary {
    /// Selector or scope that was invalidated.
    pub target: String,
    pub removed: usize,
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(admin_health))
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(clear_cache))
        .route("/cache/invalidate", post(invalidate_scope))
        .with_state(state)
}

async fn admin_health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

async fn cache_stats(State(state): State<AdminState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

async fn clear_cache(
    State(state): State<AdminState>,
    Json(request): Json<ClearRequest>,
) -> Result<Json<InvalidationSummary>, HttpError> {
    let removed = request.target.apply(state.cache.index()).await?;
    info!(
        target = "panelcache::admin",
        selector = %request.target,
        removed,
        "Cache cleared"
    );
    Ok(Json(InvalidationSummary {
        target: request.target.to_string(),
        removed,
    }))
}

async fn invalidate_scope(
    State(state): State<AdminState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidationSummary>, HttpError> {
    let scope: ScopeTag = request.scope.parse()?;
    let removed = state.cache.index().invalidate(&scope).await?;
    info!(
        target = "panelcache::admin",
        scope = %scope,
        removed,
        "Scope invalidated"
    );
    Ok(Json(InvalidationSummary {
        target: scope.to_string(),
        removed,
    }))
}
