//! Prometheus metrics endpoint and HTTP request tracking middleware.

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

// Metric names as constants for consistency
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const ANALYSES_STARTED_TOTAL: &str = "tracelens_analyses_started_total";
pub const ANALYSES_COMPLETED_TOTAL: &str = "tracelens_analyses_completed_total";
pub const ANALYSES_FAILED_TOTAL: &str = "tracelens_analyses_failed_total";
pub const ANALYSES_DELETED_TOTAL: &str = "tracelens_analyses_deleted_total";
pub const SESSIONS_EXPIRED_TOTAL: &str = "tracelens_sessions_expired_total";
pub const DELETIONS_EXECUTED_TOTAL: &str = "tracelens_deletions_executed_total";
pub const ACTIVE_ANALYSES: &str = "tracelens_active_analyses";

/// Initialize the Prometheus metrics recorder and return a handle for rendering metrics.
///
/// This should be called once during application startup.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let builder = PrometheusBuilder::new();
    let handle = builder.install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(ANALYSES_STARTED_TOTAL, "Total number of analyses started");
    describe_counter!(
        ANALYSES_COMPLETED_TOTAL,
        "Total number of analyses completed successfully"
    );
    describe_counter!(ANALYSES_FAILED_TOTAL, "Total number of analyses that failed");
    describe_counter!(
        ANALYSES_DELETED_TOTAL,
        "Total number of analysis sessions deleted by users"
    );
    describe_counter!(
        SESSIONS_EXPIRED_TOTAL,
        "Total number of analysis sessions expired by the retention sweep"
    );
    describe_counter!(
        DELETIONS_EXECUTED_TOTAL,
        "Total number of user data deletion requests executed"
    );
    describe_gauge!(ACTIVE_ANALYSES, "Number of pending or processing analyses");

    Ok(handle)
}

/// GET /metrics - Returns Prometheus-formatted metrics.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_gauge_metrics(&state).await;

    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Update gauge metrics from current state
async fn update_gauge_metrics(state: &AppState) {
    if let Ok(count) = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM analysis_sessions WHERE status IN ('pending', 'processing')",
    )
    .fetch_one(&state.db)
    .await
    {
        gauge!(ACTIVE_ANALYSES).set(count as f64);
    }
}

/// Middleware to track HTTP request metrics.
///
/// Records:
/// - `http_requests_total` counter with method, path, and status labels
/// - `http_request_duration_seconds` histogram with method and path labels
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Use the matched path so templated routes aggregate under one label
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        // Ensure metric names follow Prometheus naming conventions
        assert!(HTTP_REQUESTS_TOTAL.contains("_total"));
        assert!(ANALYSES_STARTED_TOTAL.contains("_total"));
        assert!(SESSIONS_EXPIRED_TOTAL.contains("_total"));
        assert!(HTTP_REQUEST_DURATION_SECONDS.contains("_seconds"));
    }
}
