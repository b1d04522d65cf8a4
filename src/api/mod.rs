pub mod analysis;
pub mod auth;
pub mod consent;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod rights;
pub mod validation;

use axum::{
    extract::{Query, State},
    http::{HeaderValue, Method},
    middleware,
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::error::ApiError;
use crate::db::models::audit;
use crate::db::models::user::User;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Public auth routes, stricter rate tier
    let public_routes = Router::new()
        .route("/api/register", post(auth::register))
        .route("/api/verify-email", post(auth::verify_email))
        .route("/api/login", post(auth::login))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_auth,
        ));

    // Analysis submission gets its own, tighter rate tier
    let submit_routes = Router::new()
        .route("/api/analysis/start", post(analysis::start_analysis))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_analysis,
        ));

    // Everything else behind auth, general rate tier
    let protected_routes = Router::new()
        .route("/api/logout", post(auth::logout))
        .route("/api/user/profile", get(auth::profile))
        // Analysis
        .route("/api/analysis/status/:session_id", get(analysis::get_status))
        .route("/api/analysis/results/:session_id", get(analysis::get_results))
        .route("/api/analysis/history", get(analysis::get_history))
        .route("/api/analysis/delete/:session_id", delete(analysis::delete_analysis))
        // Consent
        .route("/api/initiate-consent-process", post(consent::initiate_consent_process))
        .route("/api/process-consent-step", post(consent::process_consent_step))
        .route("/api/withdraw-consent", post(consent::withdraw_consent))
        .route("/api/consent/status", get(consent::consent_status))
        .route("/api/consent/history", get(consent::consent_history))
        .route("/api/consent/process/:process_id", get(consent::get_consent_process))
        // User rights
        .route("/api/request-immediate-deletion", post(rights::request_deletion))
        .route("/api/execute-deletion", post(rights::execute_deletion))
        .route("/api/request-opt-out", post(rights::request_opt_out))
        .route("/api/rights/requests", get(rights::list_rights_requests))
        // Audit trail
        .route("/api/audit-logs", get(get_audit_logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_api,
        ));

    Router::new()
        .route("/", get(service_info))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .merge(public_routes)
        .merge(submit_routes)
        .merge(protected_routes)
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(cors_layer(&state))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .config
        .server
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ])
}

/// Root descriptor for the API
async fn service_info() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "tracelens-api",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running"
    }))
}

/// Health check that exercises the database connection
async fn health_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .map_err(|_| ApiError::service_unavailable("Database is unreachable"))?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

#[derive(Debug, serde::Deserialize)]
struct AuditLogsQuery {
    limit: Option<i64>,
}

/// The caller's own audit trail
async fn get_audit_logs(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(query): Query<AuditLogsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let logs =
        audit::list_user_audit_logs(&state.db, &user.id, query.limit.unwrap_or(50)).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "total_count": logs.len(),
        "logs": logs
    })))
}
