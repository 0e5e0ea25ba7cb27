//! Telemetry: logging and metrics.
//!
//! - **Logging**: `tracing` subscriber with JSON/pretty/compact output
//! - **Metrics**: Prometheus recorder for job, store and listener metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LoggingConfig};
pub use metrics::{init_metrics, JobMetrics, ListenerMetrics};

use metrics_exporter_prometheus::PrometheusHandle;

/// Initialize logging and the metrics recorder.
///
/// Call once at startup. The returned handle renders the `/metrics` page.
pub fn init_telemetry(logging: &LoggingConfig) -> anyhow::Result<PrometheusHandle> {
    init_logging(logging)?;
    let handle = init_metrics()?;
    ::tracing::info!(format = ?logging.format, level = logging.level.as_str(), "telemetry initialized");
    Ok(handle)
}
