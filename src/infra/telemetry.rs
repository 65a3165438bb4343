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

/// HTTP client internals stay at `warn` unless `RUST_LOG` says otherwise.
const QUIET_TARGETS: [&str; 3] = ["hyper_util=warn", "reqwest=warn", "rustls=warn"];

/// Install the global tracing subscriber for `logging`.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

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
        .with(env_filter(logging)?)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn env_filter(logging: &LoggingSettings) -> Result<EnvFilter, InfraError> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return Ok(filter);
    }

    for directive in QUIET_TARGETS {
        let parsed = directive.parse().map_err(|err| {
            InfraError::telemetry(format!("invalid log directive `{directive}`: {err}"))
        })?;
        filter = filter.add_directive(parsed);
    }
    Ok(filter)
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "fotocache_hit_total",
            Unit::Count,
            "Total number of reads served from a fresh cache entry."
        );
        describe_counter!(
            "fotocache_stale_hit_total",
            Unit::Count,
            "Total number of reads served stale while revalidating."
        );
        describe_counter!(
            "fotocache_miss_total",
            Unit::Count,
            "Total number of reads that had to wait for a fetch."
        );
        describe_counter!(
            "fotocache_evict_total",
            Unit::Count,
            "Total number of entries evicted past their retention window."
        );
        describe_counter!(
            "fotocache_fetch_failure_total",
            Unit::Count,
            "Total number of failed resource fetches."
        );
        describe_counter!(
            "fotocache_invalidation_total",
            Unit::Count,
            "Total number of executed invalidation rules."
        );
        describe_histogram!(
            "fotocache_invalidate_ms",
            Unit::Milliseconds,
            "Invalidation execution latency in milliseconds."
        );
        describe_counter!(
            "fotocache_preload_total",
            Unit::Count,
            "Total number of preload attempts by outcome."
        );
        describe_gauge!(
            "fotocache_entries",
            Unit::Count,
            "Current number of retained cache entries."
        );
    });
}
