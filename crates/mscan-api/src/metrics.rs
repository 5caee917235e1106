//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Install the Prometheus recorder. Returns a handle that renders metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names recorded by this crate. Worker, queue and cache crates
/// record their own `mscan_*` series.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "mscan_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "mscan_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "mscan_http_requests_in_flight";

    // WebSocket metrics
    pub const WS_CONNECTIONS_TOTAL: &str = "mscan_ws_connections_total";
    pub const WS_CONNECTIONS_ACTIVE: &str = "mscan_ws_connections_active";
    pub const WS_MESSAGES_SENT: &str = "mscan_ws_messages_sent_total";
    pub const WS_MESSAGES_RECEIVED: &str = "mscan_ws_messages_received_total";
    pub const WS_HEARTBEAT_TIMEOUTS_TOTAL: &str = "mscan_ws_heartbeat_timeouts_total";

    // Sweeps
    pub const JOBS_PURGED_TOTAL: &str = "mscan_jobs_purged_total";
    pub const CACHE_EXPIRED_TOTAL: &str = "mscan_cache_expired_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_ws_connection() {
    counter!(names::WS_CONNECTIONS_TOTAL).increment(1);
}

pub fn set_ws_active_connections(count: i64) {
    gauge!(names::WS_CONNECTIONS_ACTIVE).set(count as f64);
}

pub fn record_ws_message_sent(message_type: &'static str) {
    counter!(names::WS_MESSAGES_SENT, "type" => message_type).increment(1);
}

pub fn record_ws_message_received() {
    counter!(names::WS_MESSAGES_RECEIVED).increment(1);
}

pub fn record_ws_heartbeat_timeout() {
    counter!(names::WS_HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
}

pub fn record_jobs_purged(count: usize) {
    counter!(names::JOBS_PURGED_TOTAL).increment(count as u64);
}

pub fn record_cache_expired(count: usize) {
    counter!(names::CACHE_EXPIRED_TOTAL).increment(count as u64);
}

/// Route template when matched, else `unmatched`.
fn label_path(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string())
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = label_path(&request);
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
    let response = next.run(request).await;
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    record_http_request(
        &method,
        &path,
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}
