use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Registry, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metrics::{
    METRIC_COALESCED, METRIC_EVICT, METRIC_HIT, METRIC_INDEX_KEYS, METRIC_INVALIDATED,
    METRIC_MISS, METRIC_REJECTED, METRIC_STORE_ERROR,
};
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

/// Connection-level chatter from the HTTP stack, kept out of the default output.
const QUIET_TARGETS: &[&str] = &["hyper_util=warn", "reqwest=warn", "h2=warn"];

const COUNTERS: &[(&str, &str)] = &[
    (METRIC_HIT, "Cache lookups answered from the store."),
    (METRIC_MISS, "Cache lookups that had to compute."),
    (
        METRIC_COALESCED,
        "Callers that waited on another caller's computation.",
    ),
    (METRIC_STORE_ERROR, "Failed store operations, by operation."),
    (METRIC_REJECTED, "Computed values not stored, by reason."),
    (METRIC_INVALIDATED, "Entries removed by invalidation."),
    (METRIC_EVICT, "In-memory entries evicted for capacity."),
];

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Installs the global subscriber for `logging`. `RUST_LOG` directives win
/// over the configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let mut filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();
    for directive in QUIET_TARGETS {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::registry()
        .with(output_layer(logging.format))
        .with(filter)
        .with(ErrorLayer::default())
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("subscriber already installed: {err}")))
}

fn output_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    }
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        for (name, help) in COUNTERS {
            describe_counter!(*name, Unit::Count, *help);
        }
        describe_gauge!(
            METRIC_INDEX_KEYS,
            Unit::Count,
            "Keys currently tracked by the invalidation index."
        );
    });
}
