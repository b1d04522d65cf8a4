//! Analysis session endpoints.
//!
//! Submission runs the full gauntlet in order: URL validation, the consent
//! gate, then the free-tier daily limit. Only after all three pass is a
//! session row created and a job queued for the worker.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use metrics::counter;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::auth::client_ip;
use crate::api::consent::missing_required_consents;
use crate::api::error::ApiError;
use crate::api::metrics::{ANALYSES_DELETED_TOTAL, ANALYSES_STARTED_TOTAL};
use crate::api::validation::{supported_platforms, validate_social_url};
use crate::db::models::analysis::{
    AnalysisResultsResponse, AnalysisSession, AnalysisStatus, AnalysisStatusResponse,
    HistoryEntry, HistoryResponse, ProcessingStep, StartAnalysisRequest, StartAnalysisResponse,
};
use crate::db::models::audit::{self, actions, resource_types};
use crate::db::models::user::User;
use crate::engine::AnalysisJob;
use crate::AppState;

const ANALYSIS_TYPES: &[&str] = &["comprehensive", "privacy_only", "sentiment", "basic"];

/// Start a new analysis
pub async fn start_analysis(
    State(state): State<Arc<AppState>>,
    user: User,
    headers: HeaderMap,
    Json(request): Json<StartAnalysisRequest>,
) -> Result<Json<StartAnalysisResponse>, ApiError> {
    if !ANALYSIS_TYPES.contains(&request.analysis_type.as_str()) {
        return Err(ApiError::validation_field(
            "analysis_type",
            format!(
                "Unknown analysis type. Supported types: {}",
                ANALYSIS_TYPES.join(", ")
            ),
        ));
    }

    let validated = validate_social_url(&request.url).map_err(|msg| {
        let mut details = HashMap::new();
        details.insert(
            "supported_platforms".to_string(),
            serde_json::json!(supported_platforms()),
        );
        ApiError::validation_field("url", msg).with_detail_map(details)
    })?;

    let now = chrono::Utc::now();
    let now_str = now.to_rfc3339();

    // Consent gate: both required consents must be granted and unexpired
    let missing = missing_required_consents(&state.db, &user.id, &now_str).await?;
    if !missing.is_empty() {
        let mut details = HashMap::new();
        details.insert("missing_consents".to_string(), serde_json::json!(missing));
        return Err(ApiError::forbidden(
            "Required consents have not been granted. Complete the consent process first.",
        )
        .with_detail_map(details));
    }

    // Daily usage limit for free-tier accounts
    if user.subscription_tier == "free" {
        let today = now.format("%Y-%m-%d").to_string();
        let used = user.usage_for_day(&today);
        let limit = state.config.limits.free_daily_analyses;
        if used >= limit {
            let mut details = HashMap::new();
            details.insert("daily_limit".to_string(), serde_json::json!(limit));
            details.insert("used_today".to_string(), serde_json::json!(used));
            return Err(ApiError::rate_limited(
                "Daily analysis limit reached for the free tier. Try again tomorrow.",
            )
            .with_detail_map(details));
        }
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    let expires_at = (now + chrono::Duration::hours(state.config.retention.analysis_ttl_hours))
        .to_rfc3339();
    let ip = client_ip(&headers);
    let user_agent = headers
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());

    sqlx::query(
        r#"
        INSERT INTO analysis_sessions (id, user_id, target_url, platform, username,
                                       analysis_type, status, progress, message, results,
                                       privacy_score, privacy_grade, error_message,
                                       ip_address, user_agent, created_at, updated_at,
                                       completed_at, expires_at)
        VALUES (?, ?, ?, ?, ?, ?, 'pending', 0, 'Queued for analysis', NULL,
                NULL, NULL, NULL, ?, ?, ?, ?, NULL, ?)
        "#,
    )
    .bind(&session_id)
    .bind(&user.id)
    .bind(&validated.cleaned_url)
    .bind(&validated.platform)
    .bind(&validated.username)
    .bind(&request.analysis_type)
    .bind(&ip)
    .bind(&user_agent)
    .bind(&now_str)
    .bind(&now_str)
    .bind(&expires_at)
    .execute(&state.db)
    .await?;

    audit::log_audit(
        &state.db,
        actions::ANALYSIS_STARTED,
        resource_types::ANALYSIS_SESSION,
        Some(&session_id),
        Some(&user.id),
        Some(&ip),
        Some(serde_json::json!({
            "platform": validated.platform,
            "analysis_type": request.analysis_type
        })),
    )
    .await?;

    counter!(ANALYSES_STARTED_TOTAL).increment(1);

    let job = AnalysisJob {
        session_id: session_id.clone(),
    };
    if state.analysis_tx.send(job).await.is_err() {
        // Worker channel is down; fail the session so the client isn't left polling
        sqlx::query(
            "UPDATE analysis_sessions SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind("Analysis worker unavailable")
        .bind(&now_str)
        .bind(&session_id)
        .execute(&state.db)
        .await?;
        return Err(ApiError::service_unavailable(
            "Analysis service is temporarily unavailable",
        ));
    }

    let estimated_completion = (now + chrono::Duration::seconds(30)).to_rfc3339();

    Ok(Json(StartAnalysisResponse {
        success: true,
        session_id,
        status: AnalysisStatus::Pending,
        message: "Analysis queued".to_string(),
        estimated_completion,
    }))
}

/// Fetch a session owned by the caller, mapping missing and foreign rows
async fn fetch_owned_session(
    db: &sqlx::SqlitePool,
    session_id: &str,
    user: &User,
) -> Result<AnalysisSession, ApiError> {
    let session: Option<AnalysisSession> =
        sqlx::query_as("SELECT * FROM analysis_sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(db)
            .await?;
    let session = session.ok_or_else(|| ApiError::not_found("Analysis session not found"))?;
    if session.user_id != user.id {
        return Err(ApiError::forbidden("Analysis session belongs to another user"));
    }
    Ok(session)
}

/// Poll the status of a running analysis
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(session_id): Path<String>,
) -> Result<Json<AnalysisStatusResponse>, ApiError> {
    let session = fetch_owned_session(&state.db, &session_id, &user).await?;

    let now = chrono::Utc::now().to_rfc3339();
    if session.is_expired_at(&now) {
        return Err(ApiError::gone("Analysis session has expired"));
    }

    let steps: Vec<ProcessingStep> = sqlx::query_as(
        "SELECT * FROM processing_steps WHERE session_id = ? ORDER BY id ASC",
    )
    .bind(&session.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(AnalysisStatusResponse {
        success: true,
        session_id: session.id.clone(),
        status: session.status_enum(),
        progress: session.progress,
        message: session.message.clone(),
        error_message: session.error_message.clone(),
        processing_steps: steps,
        created_at: session.created_at,
        expires_at: session.expires_at,
    }))
}

/// Fetch the results of a completed analysis
pub async fn get_results(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(session_id): Path<String>,
) -> Result<Json<AnalysisResultsResponse>, ApiError> {
    let session = fetch_owned_session(&state.db, &session_id, &user).await?;

    let now = chrono::Utc::now().to_rfc3339();
    if session.is_expired_at(&now) {
        return Err(ApiError::gone("Analysis results have expired"));
    }

    if session.status_enum() != AnalysisStatus::Completed {
        return Err(ApiError::bad_request(format!(
            "Analysis is not complete (status: {})",
            session.status
        )));
    }

    let results: serde_json::Value = session
        .results
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| ApiError::internal(format!("Stored results are malformed: {}", e)))?
        .unwrap_or(serde_json::Value::Null);

    Ok(Json(AnalysisResultsResponse {
        success: true,
        session_id: session.id,
        analysis_type: session.analysis_type,
        target_url: session.target_url,
        results,
        completed_at: session.completed_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

/// List the caller's past analyses, newest first
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let max = state.config.limits.history_max;
    let limit = query.limit.unwrap_or(max).clamp(1, max);

    let sessions: Vec<AnalysisSession> = sqlx::query_as(
        "SELECT * FROM analysis_sessions WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(&user.id)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;

    let history: Vec<HistoryEntry> = sessions.into_iter().map(HistoryEntry::from).collect();
    let total_count = history.len();

    Ok(Json(HistoryResponse {
        success: true,
        history,
        total_count,
    }))
}

/// Delete one analysis session and its processing steps
pub async fn delete_analysis(
    State(state): State<Arc<AppState>>,
    user: User,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = fetch_owned_session(&state.db, &session_id, &user).await?;

    sqlx::query("DELETE FROM processing_steps WHERE session_id = ?")
        .bind(&session.id)
        .execute(&state.db)
        .await?;
    sqlx::query("DELETE FROM analysis_sessions WHERE id = ?")
        .bind(&session.id)
        .execute(&state.db)
        .await?;

    let ip = client_ip(&headers);
    audit::log_audit(
        &state.db,
        actions::ANALYSIS_DELETED,
        resource_types::ANALYSIS_SESSION,
        Some(&session.id),
        Some(&user.id),
        Some(&ip),
        None,
    )
    .await?;

    counter!(ANALYSES_DELETED_TOTAL).increment(1);

    Ok(Json(serde_json::json!({
        "success": true,
        "session_id": session.id
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{self, DbPool};
    use crate::db::models::consent::CONSENT_VERSION;
    use crate::engine;
    use axum::extract::State;
    use tokio::sync::mpsc;

    async fn test_state() -> (Arc<AppState>, mpsc::Receiver<AnalysisJob>) {
        let pool = db::init_in_memory().await.unwrap();
        let (tx, rx) = mpsc::channel(10);
        (Arc::new(AppState::new(Config::default(), pool, tx)), rx)
    }

    async fn seed_user(pool: &DbPool, id: &str) -> User {
        let now = chrono::Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, name, verified, created_at, updated_at) VALUES (?, ?, 'x', 'Test', 1, ?, ?)",
        )
        .bind(id)
        .bind(format!("{}@example.com", id))
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await
        .unwrap();

        User {
            id: id.to_string(),
            email: format!("{}@example.com", id),
            password_hash: "x".to_string(),
            name: "Test".to_string(),
            verified: 1,
            verification_code: None,
            is_active: 1,
            subscription_tier: "free".to_string(),
            privacy_level: "standard".to_string(),
            daily_usage_count: 0,
            usage_day: None,
            total_analyses: 0,
            last_analysis_at: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    async fn grant_required_consents(pool: &DbPool, user_id: &str) {
        let now = chrono::Utc::now().to_rfc3339();
        for consent_type in ["data_collection", "data_processing"] {
            sqlx::query(
                r#"
                INSERT INTO consent_records (id, user_id, consent_type, status, consent_version,
                                             granted_at, created_at)
                VALUES (?, ?, ?, 'granted', ?, ?, ?)
                "#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(user_id)
            .bind(consent_type)
            .bind(CONSENT_VERSION)
            .bind(&now)
            .bind(&now)
            .execute(pool)
            .await
            .unwrap();
        }
    }

    fn start_request(analysis_type: &str) -> StartAnalysisRequest {
        StartAnalysisRequest {
            url: "https://github.com/janedoe".to_string(),
            analysis_type: analysis_type.to_string(),
        }
    }

    #[tokio::test]
    async fn test_start_blocked_without_required_consents() {
        let (state, mut rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;

        let err = start_analysis(
            State(state.clone()),
            user.clone(),
            HeaderMap::new(),
            Json(start_request("comprehensive")),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("consent"));

        // A blocked start leaves no session behind and queues nothing
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM analysis_sessions WHERE user_id = 'u1'")
                .fetch_one(&state.db)
                .await
                .unwrap();
        assert_eq!(count.0, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_unblocked_after_consents_granted() {
        let (state, mut rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;
        grant_required_consents(&state.db, &user.id).await;

        let Json(response) = start_analysis(
            State(state.clone()),
            user.clone(),
            HeaderMap::new(),
            Json(start_request("comprehensive")),
        )
        .await
        .unwrap();
        assert!(response.success);
        assert_eq!(response.status, AnalysisStatus::Pending);

        let job = rx.try_recv().unwrap();
        assert_eq!(job.session_id, response.session_id);

        let (status, platform): (String, String) =
            sqlx::query_as("SELECT status, platform FROM analysis_sessions WHERE id = ?")
                .bind(&response.session_id)
                .fetch_one(&state.db)
                .await
                .unwrap();
        assert_eq!(status, "pending");
        assert_eq!(platform, "github");
    }

    #[tokio::test]
    async fn test_privacy_score_unchanged_from_engine_to_results() {
        let (state, mut rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;
        grant_required_consents(&state.db, &user.id).await;

        let Json(started) = start_analysis(
            State(state.clone()),
            user.clone(),
            HeaderMap::new(),
            Json(start_request("privacy_only")),
        )
        .await
        .unwrap();
        let job = rx.try_recv().unwrap();
        engine::process_job(&state.db, &job.session_id).await.unwrap();

        let Json(results) = get_results(
            State(state.clone()),
            user.clone(),
            Path(started.session_id.clone()),
        )
        .await
        .unwrap();

        let expected = crate::engine::analyzer::build_results(
            "privacy_only",
            "https://github.com/janedoe",
            "github",
            Some("janedoe"),
        );
        let returned = results.results["privacy"]["privacy_score"].as_f64();
        assert_eq!(returned, expected.privacy_score);

        let stored: (Option<f64>,) =
            sqlx::query_as("SELECT privacy_score FROM analysis_sessions WHERE id = ?")
                .bind(&started.session_id)
                .fetch_one(&state.db)
                .await
                .unwrap();
        assert_eq!(stored.0, expected.privacy_score);
    }

    #[tokio::test]
    async fn test_unknown_analysis_type_rejected() {
        let (state, _rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;
        grant_required_consents(&state.db, &user.id).await;

        let err = start_analysis(
            State(state.clone()),
            user.clone(),
            HeaderMap::new(),
            Json(start_request("exhaustive")),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("analysis type"));
    }
}
