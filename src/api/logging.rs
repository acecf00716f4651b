//! Request logging middleware.
//!
//! One line per request with method, path, query, status and latency.

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

const HEALTH_PATH: &str = "/health";

/// 5xx at WARN, everything else at INFO. Healthy `/health` checks are not
/// logged, a failing one is.
pub async fn request_logging(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    // snapshot bounds (since / window_secs / all) travel in the query
    let query = request.uri().query().unwrap_or_default().to_string();

    let start = Instant::now();
    let response = next.run(request).await;
    let latency_ms = start.elapsed().as_millis() as u64;
    let status = response.status();

    if status.is_server_error() {
        warn!(
            method = %method,
            path = %path,
            query = %query,
            status = status.as_u16(),
            latency_ms,
            "Request failed (5xx)"
        );
    } else if status.is_client_error() {
        info!(
            method = %method,
            path = %path,
            query = %query,
            status = status.as_u16(),
            latency_ms,
            "Request rejected (4xx)"
        );
    } else if path != HEALTH_PATH {
        info!(
            method = %method,
            path = %path,
            status = status.as_u16(),
            latency_ms,
            "Request completed"
        );
    }

    response
}
