use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache records.
///
/// Safe to call more than once; only the first call registers.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tagcache_query_started_total",
            Unit::Count,
            "Total number of query requests dispatched to the transport."
        );
        describe_counter!(
            "tagcache_query_deduped_total",
            Unit::Count,
            "Total number of query starts served by an existing request or result."
        );
        describe_counter!(
            "tagcache_query_settled_total",
            Unit::Count,
            "Total number of query requests settled, labelled by outcome."
        );
        describe_counter!(
            "tagcache_mutation_settled_total",
            Unit::Count,
            "Total number of mutation requests settled, labelled by outcome."
        );
        describe_counter!(
            "tagcache_invalidation_refetch_total",
            Unit::Count,
            "Total number of queries refetched by tag invalidation."
        );
        describe_counter!(
            "tagcache_prefetch_total",
            Unit::Count,
            "Total number of prefetch decisions, labelled by decision."
        );
        describe_gauge!(
            "tagcache_entries",
            Unit::Count,
            "Current number of query entries held by the cache."
        );
        describe_histogram!(
            "tagcache_transport_ms",
            Unit::Milliseconds,
            "Transport round-trip latency in milliseconds, labelled by endpoint kind."
        );
    });
}
