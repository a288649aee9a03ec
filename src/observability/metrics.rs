//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define engine metrics (finalized requests, synthetic requests, peer selection)
//! - Install a Prometheus-compatible exporter for hosts that want one
//!
//! # Metrics
//! - `engine_requests_total` (counter): finalized requests by kind, status
//! - `engine_synthetic_requests_total` (counter): fabrication attempts by outcome
//! - `engine_peer_selections_total` (counter): peer selections by source, outcome
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder the calls are no-ops
//! - Labels are static strings except the status code

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

/// A request reached its final response.
pub fn record_request(kind: &'static str, status: u16) {
    metrics::counter!("engine_requests_total", "kind" => kind, "status" => status.to_string())
        .increment(1);
}

/// A synthetic request fabrication finished.
pub fn record_synthetic_request(outcome: &'static str) {
    metrics::counter!("engine_synthetic_requests_total", "outcome" => outcome).increment(1);
}

/// An upstream peer selection finished.
pub fn record_peer_selection(source: &'static str, outcome: &'static str) {
    metrics::counter!(
        "engine_peer_selections_total",
        "source" => source,
        "outcome" => outcome
    )
    .increment(1);
}
