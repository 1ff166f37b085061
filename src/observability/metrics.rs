//! Metrics collection and exposition.
//!
//! # Metrics
//! - `rpc_client_calls_total` (counter): outbound calls by method, outcome
//! - `rpc_client_call_duration_seconds` (histogram)
//! - `rpc_pool_dials_total` (counter): dials by address, result
//! - `rpc_pool_evictions_total` (counter)
//! - `rpc_pool_connections` (gauge): open/idle/available/saturated per address
//! - `rpc_server_dispatch_total` / `rpc_server_dispatch_duration_seconds`
//! - `gateway_requests_total` / `gateway_request_duration_seconds`
//! - `gateway_ws_sessions_active` (gauge)
//!
//! # Design Decisions
//! - Labels are method, address, outcome or status; never request ids

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::client::PoolStats;

/// Start the Prometheus exporter on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus metrics server started"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to start Prometheus exporter"),
    }
}

pub fn record_rpc_call(method: &str, outcome: &str, start: Instant) {
    counter!("rpc_client_calls_total", "method" => method.to_string(), "outcome" => outcome.to_string()).increment(1);
    histogram!("rpc_client_call_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_pool_dial(addr: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    counter!("rpc_pool_dials_total", "addr" => addr.to_string(), "result" => result).increment(1);
}

pub fn record_pool_eviction(addr: &str) {
    counter!("rpc_pool_evictions_total", "addr" => addr.to_string()).increment(1);
}

pub fn record_pool_state(addr: &str, stats: &PoolStats) {
    for (state, value) in [
        ("open", stats.open),
        ("idle", stats.idle),
        ("available", stats.available),
        ("saturated", stats.saturated),
    ] {
        gauge!("rpc_pool_connections", "addr" => addr.to_string(), "state" => state).set(value as f64);
    }
}

pub fn record_dispatch(method: &str, outcome: &'static str, start: Instant) {
    counter!("rpc_server_dispatch_total", "method" => method.to_string(), "outcome" => outcome).increment(1);
    histogram!("rpc_server_dispatch_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_gateway_request(kind: &'static str, status: u16, start: Instant) {
    counter!("gateway_requests_total", "kind" => kind, "status" => status.to_string()).increment(1);
    histogram!("gateway_request_duration_seconds", "kind" => kind).record(start.elapsed().as_secs_f64());
}

pub fn record_ws_sessions(active: u64) {
    gauge!("gateway_ws_sessions_active").set(active as f64);
}
