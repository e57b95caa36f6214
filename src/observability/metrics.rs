//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_connections_accepted_total` (counter)
//! - `gateway_connections_open` (gauge): connections currently holding a slot
//! - `gateway_connection_closed_total` (counter): by close reason
//! - `gateway_calls_total` (counter): by method, status
//! - `gateway_call_duration_seconds` (histogram)
//!
//! Without an installed recorder every update is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| e.to_string())?;

    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_connection_opened(open: u64) {
    metrics::counter!("gateway_connections_accepted_total").increment(1);
    metrics::gauge!("gateway_connections_open").set(open as f64);
}

pub fn record_connection_closed(reason: &'static str, open: u64) {
    metrics::counter!("gateway_connection_closed_total", "reason" => reason).increment(1);
    metrics::gauge!("gateway_connections_open").set(open as f64);
}

pub fn record_call(method: &str, status: &'static str, start: Instant) {
    metrics::counter!(
        "gateway_calls_total",
        "method" => method.to_string(),
        "status" => status
    )
    .increment(1);
    metrics::histogram!("gateway_call_duration_seconds").record(start.elapsed().as_secs_f64());
}
