//! Prometheus metrics for job transitions, store conflicts and listeners.
//!
//! The recorder is installed once by the binary; the rest of the crate emits
//! through the `metrics` facade and is a no-op without a recorder.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::jobs::JobStatus;

/// Install the global Prometheus recorder and describe every metric.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metric_descriptions();
    tracing::debug!("metrics recorder installed");
    Ok(handle)
}

fn register_metric_descriptions() {
    describe_counter!(
        "stacker_job_transitions_total",
        "Job state transitions applied, by source and target status"
    );
    describe_counter!(
        "stacker_store_conflicts_total",
        "Store writes rejected because a concurrent writer won"
    );
    describe_counter!(
        "stacker_listener_unexpected_stops_total",
        "Listeners whose serve loop exited before stop was requested"
    );
    describe_counter!(
        "stacker_listener_forced_closures_total",
        "Connections closed forcibly at the shutdown deadline"
    );
    describe_gauge!(
        "stacker_listener_active_connections",
        "Connections currently open on each listener"
    );
    describe_counter!("stacker_errors_total", "Errors constructed, by code and category");
}

/// Job state machine metrics.
pub struct JobMetrics;

impl JobMetrics {
    pub fn record_transition(from: JobStatus, to: JobStatus) {
        counter!(
            "stacker_job_transitions_total",
            "from" => from.as_str(),
            "to" => to.as_str(),
        )
        .increment(1);
    }

    pub fn record_conflict(entity: &'static str) {
        counter!("stacker_store_conflicts_total", "entity" => entity).increment(1);
    }
}

/// Listener lifecycle metrics.
pub struct ListenerMetrics;

impl ListenerMetrics {
    pub fn connection_opened(listener: &str) {
        gauge!("stacker_listener_active_connections", "listener" => listener.to_string())
            .increment(1.0);
    }

    pub fn connection_closed(listener: &str) {
        gauge!("stacker_listener_active_connections", "listener" => listener.to_string())
            .decrement(1.0);
    }

    pub fn record_forced_closures(listener: &str, count: u64) {
        counter!("stacker_listener_forced_closures_total", "listener" => listener.to_string())
            .increment(count);
    }

    pub fn record_unexpected_stop(listener: &str) {
        counter!("stacker_listener_unexpected_stops_total", "listener" => listener.to_string())
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_recorder_captures_transitions() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            JobMetrics::record_transition(JobStatus::Pending, JobStatus::Downloaded);
            JobMetrics::record_transition(JobStatus::Pending, JobStatus::Downloaded);
            ListenerMetrics::record_unexpected_stop("metrics");
        });

        let rendered = handle.render();
        assert!(rendered.contains(
            r#"stacker_job_transitions_total{from="pending",to="downloaded"} 2"#
        ));
        assert!(rendered.contains(r#"stacker_listener_unexpected_stops_total{listener="metrics"} 1"#));
    }
}
