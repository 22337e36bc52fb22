//! Metrics collection and exposition.
//!
//! # Metrics
//! - `dispatcher_requests_total` (counter): requests by outcome
//! - `dispatcher_request_duration_seconds` (histogram): handling latency
//! - `dispatcher_routing_channels` (gauge): channels in the current table
//! - `dispatcher_routing_updates_total` (counter): table publications
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(outcome: &'static str, start: Instant) {
    counter!("dispatcher_requests_total", "outcome" => outcome).increment(1);
    histogram!("dispatcher_request_duration_seconds", "outcome" => outcome)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_routing_update(channels: usize) {
    counter!("dispatcher_routing_updates_total").increment(1);
    gauge!("dispatcher_routing_channels").set(channels as f64);
}
