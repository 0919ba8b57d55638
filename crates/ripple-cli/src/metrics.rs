//! Metrics export for the CLI.
//!
//! Engine metrics are recorded by `ripple-core`; this module installs the
//! Prometheus exporter and adds the CLI's own counters.

use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const LINES_PUBLISHED_TOTAL: &str = "ripple_cli_lines_published_total";
    pub const PUBLISH_FAILURES_TOTAL: &str = "ripple_cli_publish_failures_total";
}

/// Describe engine and CLI metrics.
pub fn init_metrics() {
    ripple_core::metrics::describe();
    metrics::describe_counter!(
        names::LINES_PUBLISHED_TOTAL,
        "Lines read from stdin and published"
    );
    metrics::describe_counter!(names::PUBLISH_FAILURES_TOTAL, "Publishes that were not acknowledged");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics endpoint.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

pub fn record_published(channel: &str) {
    counter!(names::LINES_PUBLISHED_TOTAL, "channel" => channel.to_string()).increment(1);
}

pub fn record_publish_failure(code: u32) {
    counter!(names::PUBLISH_FAILURES_TOTAL, "code" => code.to_string()).increment(1);
}
