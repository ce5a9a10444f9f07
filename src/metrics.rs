//! Server Metrics
//!
//! Prometheus counters for the remote cache protocol, registered once in the
//! default registry and exported by the binary's `/metrics` endpoint.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::{Error, Result};

/// Requests handled, by request type
pub static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "viewcache_requests_total",
        "Total number of cache protocol requests handled",
        &["request"]
    )
    .expect("viewcache_requests_total registers once")
});

/// Requests answered with a failure, by request type
pub static FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "viewcache_request_failures_total",
        "Total number of cache protocol requests that failed",
        &["request"]
    )
    .expect("viewcache_request_failures_total registers once")
});

/// Request handling latency, by request type
pub static LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "viewcache_request_duration_seconds",
        "Cache protocol request handling latency",
        &["request"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .expect("viewcache_request_duration_seconds registers once")
});

/// Currently open client connections
pub static CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "viewcache_open_connections",
        "Number of currently open client connections"
    )
    .expect("viewcache_open_connections registers once")
});

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}
