use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_histogram!(
            "folio_cache_refresh_ms",
            Unit::Milliseconds,
            "Record cache rebuild latency in milliseconds."
        );
        describe_counter!(
            "folio_cache_refresh_coalesced_total",
            Unit::Count,
            "Refresh requests served by a rebuild started by another caller."
        );
        describe_counter!(
            "folio_cache_refresh_failed_total",
            Unit::Count,
            "Record cache rebuilds that failed and kept the previous snapshot."
        );
        describe_counter!(
            "folio_notification_soft_failure_total",
            Unit::Count,
            "Storage notifications a listener failed to handle."
        );
        describe_counter!(
            "folio_blob_leaked_total",
            Unit::Count,
            "Blobs left in the blob store after a failed delete."
        );
        describe_counter!(
            "folio_soft_failure_total",
            Unit::Count,
            "Non-fatal failures reported alongside a successful operation."
        );
    });
}
