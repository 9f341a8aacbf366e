use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use bytes::Bytes;
use metrics_util::debugging::DebuggingRecorder;
use panelcache::cache::{
    CacheConfig, CacheCore, CacheKey, CacheLayerState, CacheStore, ComputeError, Expiry,
    Identity, KeyCodec, Namespace, ScopeSet, StoreError, StoredEntry, Variant,
    invalidate_on_write, response_cache_layer,
};
use tokio::sync::Notify;
use tower::ServiceExt;

struct DownStore;

#[async_trait]
impl CacheStore for DownStore {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn get(&self, _key: &CacheKey) -> Result<Option<StoredEntry>, StoreError> {
        Err(StoreError::unavailable("down", "connection refused"))
    }

    async fn put(
        &self,
        _key: &CacheKey,
        _entry: StoredEntry,
    ) -> Result<Option<CacheKey>, StoreError> {
        Err(StoreError::unavailable("down", "connection refused"))
    }

    async fn delete(&self, _key: &CacheKey) -> Result<bool, StoreError> {
        Err(StoreError::unavailable("down", "connection refused"))
    }

    async fn flush(&self) -> Result<(), StoreError> {
        Err(StoreError::unavailable("down", "connection refused"))
    }
}

fn value_key(name: &str) -> CacheKey {
    KeyCodec::derive_key(Namespace::Value, &Identity::named(name), &Variant::guest())
        .expect("key derives")
}

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Page hit/miss/evict/reject/invalidate through the middleware path
    let config = CacheConfig {
        max_entries: 1,
        ..Default::default()
    };
    let core = CacheCore::from_config(config).expect("valid policy");
    let state = CacheLayerState::new(&core);
    let app = Router::new()
        .route(
            "/admin/orders/{id}",
            get(|| async { "<tr>order</tr>".repeat(20) }).post(|| async { StatusCode::OK }),
        )
        .route("/admin/tiny", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            response_cache_layer,
        ))
        .layer(middleware::from_fn_with_state(state, invalidate_on_write));

    let requests = [
        (Method::GET, "/admin/orders/1"),
        (Method::GET, "/admin/orders/1"),
        (Method::GET, "/admin/orders/2"),
        (Method::GET, "/admin/tiny"),
        (Method::POST, "/admin/orders/2"),
    ];
    for (method, uri) in requests {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .expect("request should build");
        let response = app
            .clone()
            .oneshot(request)
            .await
            .expect("router should respond");
        assert_eq!(response.status(), StatusCode::OK);
    }

    // Coalesced waiters
    let values = core.responses::<Bytes>();
    let gate = Arc::new(Notify::new());
    let compute = |gate: Arc<Notify>| {
        move || async move {
            gate.notified().await;
            Ok::<_, ComputeError>(Bytes::from_static(b"shared"))
        }
    };
    let ttl = Expiry::After(Duration::from_secs(60));
    let (first, second, ()) = tokio::join!(
        values.get_or_compute(value_key("shared"), ttl, ScopeSet::new(), compute(gate.clone())),
        values.get_or_compute(value_key("shared"), ttl, ScopeSet::new(), compute(gate.clone())),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            gate.notify_one();
        }
    );
    assert!(first.is_ok() && second.is_ok());

    // Store outage
    let down = CacheCore::new(CacheConfig::default(), Arc::new(DownStore)).expect("valid policy");
    let fetched = down
        .responses::<Bytes>()
        .get_or_compute(value_key("down"), ttl, ScopeSet::new(), || async {
            Ok::<_, ComputeError>(Bytes::from_static(b"direct"))
        })
        .await
        .expect("outage falls back to computing");
    assert!(!fetched.hit);

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "panelcache_hit_total",
        "panelcache_miss_total",
        "panelcache_coalesced_total",
        "panelcache_store_error_total",
        "panelcache_rejected_total",
        "panelcache_invalidated_total",
        "panelcache_evict_total",
        "panelcache_index_keys",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
