//! Tracing subscriber and metric catalog for the render service.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing::debug;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

struct MetricSpec {
    name: &'static str,
    kind: MetricKind,
    unit: Unit,
    help: &'static str,
}

const CATALOG: &[MetricSpec] = &[
    MetricSpec {
        name: "stave_render_cache_hit_total",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        help: "Render requests served from the artifact cache.",
    },
    MetricSpec {
        name: "stave_render_cache_miss_total",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        help: "Render requests that missed the artifact cache.",
    },
    MetricSpec {
        name: "stave_render_engine_attempt_total",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        help: "Render attempts handed to the engine, retries included.",
    },
    MetricSpec {
        name: "stave_render_failed_total",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        help: "Renders that failed after exhausting retries.",
    },
    MetricSpec {
        name: "stave_render_rate_limited_total",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        help: "Render requests rejected by the rate limiter.",
    },
    MetricSpec {
        name: "stave_render_ms",
        kind: MetricKind::Histogram,
        unit: Unit::Milliseconds,
        help: "End-to-end latency of cache-miss renders.",
    },
    MetricSpec {
        name: "stave_cache_write_failed_total",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        help: "Rendered artifacts that could not be written to the cache.",
    },
    MetricSpec {
        name: "stave_engine_session_launch_total",
        kind: MetricKind::Counter,
        unit: Unit::Count,
        help: "Render sessions launched by the session pool.",
    },
    MetricSpec {
        name: "stave_engine_idle_sessions",
        kind: MetricKind::Gauge,
        unit: Unit::Count,
        help: "Render sessions parked in the idle set.",
    },
];

static DESCRIBED: Once = Once::new();

/// Names of every metric the service emits.
pub fn metric_names() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|spec| spec.name)
}

/// Install the global subscriber and describe the metric catalog.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    DESCRIBED.call_once(describe_catalog);

    let filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    // Event fields sit at the top level of each JSON line.
    let output = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(output)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("tracing subscriber already set: {err}")))?;

    debug!(
        target = "stave::infra::telemetry",
        format = ?logging.format,
        level = %logging.level,
        metrics = CATALOG.len(),
        "Telemetry installed"
    );
    Ok(())
}

fn describe_catalog() {
    for spec in CATALOG {
        match spec.kind {
            MetricKind::Counter => describe_counter!(spec.name, spec.unit, spec.help),
            MetricKind::Gauge => describe_gauge!(spec.name, spec.unit, spec.help),
            MetricKind::Histogram => describe_histogram!(spec.name, spec.unit, spec.help),
        }
    }
}
