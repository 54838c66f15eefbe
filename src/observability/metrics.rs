//! # Gateway Metrics
//!
//! Counters, histograms and gauges recorded through the `metrics` facade.
//! Nothing is exported unless `install_prometheus` installs a recorder; until
//! then every call is a no-op.
//!
//! ## Metric Names
//! - `gateway_requests_total` / `gateway_request_duration_seconds`: per dispatched request
//! - `gateway_upstream_requests_total` / `gateway_upstream_request_duration_seconds`: per backend call
//! - `gateway_stream_sessions_active`: open WebSocket proxy sessions
//! - `gateway_drains_total`: drain outcomes, labelled `completed` or `force_closed`

use axum::http::{Method, StatusCode};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use tonic::Code;
use tracing::info;

use crate::core::error::{GatewayError, GatewayResult};
use crate::traffic::shutdown::DrainOutcome;

const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Install the Prometheus recorder and its scrape listener
pub fn install_prometheus(addr: SocketAddr) -> GatewayResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets_for_metric(Matcher::Suffix("duration_seconds".to_string()), LATENCY_BUCKETS)
        .map_err(|e| GatewayError::config(format!("Invalid metric buckets: {}", e)))?
        .install()
        .map_err(|e| GatewayError::config(format!("Failed to install Prometheus exporter: {}", e)))?;

    info!(addr = %addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_request(method: &Method, handler: &str, status: StatusCode, elapsed: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("handler", handler.to_string()),
        ("status", status.as_u16().to_string()),
    ];
    metrics::counter!("gateway_requests_total", &labels).increment(1);
    metrics::histogram!("gateway_request_duration_seconds", &labels).record(elapsed.as_secs_f64());
}

pub fn record_backend_call(backend: &str, rpc: &str, code: Code, elapsed: Duration) {
    let labels = [
        ("backend", backend.to_string()),
        ("rpc", rpc.to_string()),
        ("code", format!("{:?}", code)),
    ];
    metrics::counter!("gateway_upstream_requests_total", &labels).increment(1);
    metrics::histogram!("gateway_upstream_request_duration_seconds", &labels)
        .record(elapsed.as_secs_f64());
}

pub fn session_opened(backend: &str) {
    metrics::gauge!("gateway_stream_sessions_active", "backend" => backend.to_string()).increment(1.0);
}

pub fn session_closed(backend: &str) {
    metrics::gauge!("gateway_stream_sessions_active", "backend" => backend.to_string()).decrement(1.0);
}

pub fn record_drain(outcome: &DrainOutcome) {
    let outcome = match outcome {
        DrainOutcome::Completed => "completed",
        DrainOutcome::ForceClosed { .. } => "force_closed",
    };
    metrics::counter!("gateway_drains_total", "outcome" => outcome).increment(1);
}
