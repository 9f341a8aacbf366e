mod admin;
mod middleware;
mod proxy;

pub use admin::{AdminState, ClearRequest, InvalidateRequest, InvalidationSummary};
pub use proxy::ProxyState;

use axum::{Router, middleware as axum_middleware};

use crate::cache::{CacheLayerState, invalidate_on_write, response_cache_layer};

use self::middleware::log_responses;

/// Public router: every request is forwarded to the origin, page reads go
/// through the cache and successful writes invalidate it.
pub fn build_proxy_router(proxy: ProxyState, cache: CacheLayerState) -> Router {
    Router::new()
        .fallback(proxy::proxy_handler)
        .with_state(proxy)
        .layer(axum_middleware::from_fn_with_state(
            cache.clone(),
            response_cache_layer,
        ))
        .layer(axum_middleware::from_fn_with_state(cache, invalidate_on_write))
        .layer(axum_middleware::from_fn(log_responses))
}

pub fn build_admin_router(state: AdminState) -> Router {
    admin::build_admin_router(state).layer(axum_middleware::from_fn(log_responses))
}
