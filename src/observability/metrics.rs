//! Metrics collection and exposition.
//!
//! # Metrics
//! - `tunnel_active` (gauge): registered tunnel sessions
//! - `tunnel_created_total` / `tunnel_removed_total` (counter): session churn
//! - `tunnel_sockets_rejected_total` (counter): legs refused at capacity
//! - `tunnel_requests_total` (counter): proxied requests by kind (http, upgrade)
//! - `tunnel_upstream_errors_total` (counter): requests answered with 502

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Start the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start metrics exporter"),
    }
}

pub fn record_tunnel_created(active: usize) {
    metrics::counter!("tunnel_created_total").increment(1);
    metrics::gauge!("tunnel_active").set(active as f64);
}

pub fn record_tunnel_removed(active: usize) {
    metrics::counter!("tunnel_removed_total").increment(1);
    metrics::gauge!("tunnel_active").set(active as f64);
}

pub fn record_socket_rejected() {
    metrics::counter!("tunnel_sockets_rejected_total").increment(1);
}

pub fn record_request(kind: &'static str) {
    metrics::counter!("tunnel_requests_total", "kind" => kind).increment(1);
}

pub fn record_upstream_error() {
    metrics::counter!("tunnel_upstream_errors_total").increment(1);
}
