//! User rights endpoints: data deletion and processing opt-out.
//!
//! Deletion is a two-step flow. The request step issues a verification code
//! (delivered by email when SMTP is configured); the execute step checks the
//! code and performs the deletion for the requested scope.

use axum::{extract::State, http::HeaderMap, Json};
use metrics::counter;
use rand::Rng;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::api::auth::client_ip;
use crate::api::error::ApiError;
use crate::api::metrics::DELETIONS_EXECUTED_TOTAL;
use crate::db::models::audit::{self, actions, resource_types};
use crate::db::models::rights::{
    DeletionRequest, DeletionScope, ExecuteDeletionRequest, ExecuteDeletionResponse, OptOutRequest,
    ProcessingStage, RequestDeletionRequest, RequestDeletionResponse, RequestOptOutRequest,
    RequestOptOutResponse,
};
use crate::db::models::user::User;
use crate::AppState;

const MAX_CODE_ATTEMPTS: i64 = 5;

/// Data type names accepted for scope=partial
const PARTIAL_DATA_TYPES: &[&str] = &["analysis_data", "consent_data"];

/// Generate an 8-character uppercase alphanumeric verification code
fn generate_deletion_code() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::rng();
    (0..8)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

/// Request deletion of the caller's data
pub async fn request_deletion(
    State(state): State<Arc<AppState>>,
    user: User,
    headers: HeaderMap,
    Json(request): Json<RequestDeletionRequest>,
) -> Result<Json<RequestDeletionResponse>, ApiError> {
    let scope = DeletionScope::parse(&request.scope)
        .ok_or_else(|| ApiError::validation_field("scope", "Unknown deletion scope"))?;

    if scope == DeletionScope::Partial {
        let types = request.data_types.as_deref().unwrap_or_default();
        if types.is_empty() {
            return Err(ApiError::validation_field(
                "data_types",
                "Partial deletion requires at least one data type",
            ));
        }
        if let Some(unknown) = types.iter().find(|t| !PARTIAL_DATA_TYPES.contains(&t.as_str())) {
            return Err(ApiError::validation_field(
                "data_types",
                format!(
                    "Unknown data type \"{}\". Supported types: {}",
                    unknown,
                    PARTIAL_DATA_TYPES.join(", ")
                ),
            ));
        }
    }

    let pending: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM deletion_requests WHERE user_id = ? AND status = 'pending'",
    )
    .bind(&user.id)
    .fetch_one(&state.db)
    .await?;
    if pending.0 >= state.config.limits.max_deletion_requests {
        return Err(ApiError::rate_limited(
            "Too many pending deletion requests. Complete or wait for an existing request.",
        ));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let code = generate_deletion_code();
    let now = chrono::Utc::now().to_rfc3339();
    let data_types_json = request
        .data_types
        .as_ref()
        .map(|t| serde_json::json!(t).to_string());

    sqlx::query(
        r#"
        INSERT INTO deletion_requests (id, user_id, deletion_scope, data_types, reason,
                                       status, verification_code, retry_count,
                                       requested_at, completed_at)
        VALUES (?, ?, ?, ?, ?, 'pending', ?, 0, ?, NULL)
        "#,
    )
    .bind(&id)
    .bind(&user.id)
    .bind(scope.as_str())
    .bind(&data_types_json)
    .bind(&request.reason)
    .bind(&code)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let ip = client_ip(&headers);
    audit::log_audit(
        &state.db,
        actions::DELETION_REQUESTED,
        resource_types::DELETION_REQUEST,
        Some(&id),
        Some(&user.id),
        Some(&ip),
        Some(serde_json::json!({ "scope": scope.as_str() })),
    )
    .await?;

    let verification_code = if state.config.smtp.enabled {
        state.mailer.send_deletion_code(&user.email, &code).await;
        None
    } else {
        // No mail transport; hand the code back directly
        Some(code)
    };

    Ok(Json(RequestDeletionResponse {
        success: true,
        request_id: id,
        status: "pending".to_string(),
        verification_code,
    }))
}

/// Apply a verified deletion for its scope.
///
/// `complete` removes analysis data, withdraws consents and deactivates the
/// account; `analysis_only` touches analysis data alone; `partial` handles
/// exactly the data types named in the request.
pub(crate) async fn perform_deletion(
    db: &sqlx::SqlitePool,
    user_id: &str,
    scope: DeletionScope,
    data_types: &[String],
    now: &str,
) -> Result<Vec<String>, sqlx::Error> {
    let mut deleted_items = Vec::new();

    let delete_analysis = match scope {
        DeletionScope::Complete | DeletionScope::AnalysisOnly => true,
        DeletionScope::Partial => data_types.iter().any(|t| t == "analysis_data"),
    };
    let withdraw_consents = match scope {
        DeletionScope::Complete => true,
        DeletionScope::AnalysisOnly => false,
        DeletionScope::Partial => data_types.iter().any(|t| t == "consent_data"),
    };

    if delete_analysis {
        sqlx::query(
            "DELETE FROM processing_steps WHERE session_id IN (SELECT id FROM analysis_sessions WHERE user_id = ?)",
        )
        .bind(user_id)
        .execute(db)
        .await?;
        let sessions = sqlx::query("DELETE FROM analysis_sessions WHERE user_id = ?")
            .bind(user_id)
            .execute(db)
            .await?;
        deleted_items.push(format!("analysis_sessions ({})", sessions.rows_affected()));
    }

    if withdraw_consents {
        // Consent records stay as withdrawn rows so the consent trail survives
        let consents = sqlx::query(
            r#"
            UPDATE consent_records
            SET status = 'withdrawn', withdrawn_at = ?, withdrawal_reason = 'data_deletion'
            WHERE user_id = ? AND status = 'granted'
            "#,
        )
        .bind(now)
        .bind(user_id)
        .execute(db)
        .await?;
        sqlx::query("DELETE FROM consent_processes WHERE user_id = ?")
            .bind(user_id)
            .execute(db)
            .await?;
        deleted_items.push(format!("consents_withdrawn ({})", consents.rows_affected()));
    }

    if scope == DeletionScope::Complete {
        sqlx::query("UPDATE auth_sessions SET is_active = 0 WHERE user_id = ?")
            .bind(user_id)
            .execute(db)
            .await?;
        sqlx::query("UPDATE users SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(user_id)
            .execute(db)
            .await?;
        deleted_items.push("account (deactivated)".to_string());
    }

    Ok(deleted_items)
}

/// Execute a previously requested deletion
pub async fn execute_deletion(
    State(state): State<Arc<AppState>>,
    user: User,
    headers: HeaderMap,
    Json(request): Json<ExecuteDeletionRequest>,
) -> Result<Json<ExecuteDeletionResponse>, ApiError> {
    let deletion: Option<DeletionRequest> =
        sqlx::query_as("SELECT * FROM deletion_requests WHERE id = ?")
            .bind(&request.request_id)
            .fetch_optional(&state.db)
            .await?;
    let deletion = deletion.ok_or_else(|| ApiError::not_found("Deletion request not found"))?;

    if deletion.user_id != user.id {
        return Err(ApiError::forbidden("Deletion request belongs to another user"));
    }

    // Re-executing a completed request is a no-op, not an error
    if deletion.status == "completed" {
        return Ok(Json(ExecuteDeletionResponse {
            success: true,
            deleted_items: Vec::new(),
            completed_at: deletion
                .completed_at
                .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        }));
    }
    if deletion.status != "pending" {
        return Err(ApiError::conflict(format!(
            "Deletion request is {}",
            deletion.status
        )));
    }

    let provided = request.verification_code.trim().to_uppercase();
    let matches = deletion.verification_code.as_bytes().ct_eq(provided.as_bytes());
    if matches.unwrap_u8() == 0 {
        let retry_count = deletion.retry_count + 1;
        if retry_count >= MAX_CODE_ATTEMPTS {
            sqlx::query("UPDATE deletion_requests SET status = 'rejected', retry_count = ? WHERE id = ?")
                .bind(retry_count)
                .bind(&deletion.id)
                .execute(&state.db)
                .await?;
            return Err(ApiError::forbidden(
                "Too many invalid codes. The deletion request has been rejected.",
            ));
        }
        sqlx::query("UPDATE deletion_requests SET retry_count = ? WHERE id = ?")
            .bind(retry_count)
            .bind(&deletion.id)
            .execute(&state.db)
            .await?;
        return Err(ApiError::unauthorized("Invalid verification code"));
    }

    let scope = DeletionScope::parse(&deletion.deletion_scope)
        .ok_or_else(|| ApiError::internal("Stored deletion scope is invalid"))?;
    let data_types: Vec<String> = deletion
        .data_types
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| ApiError::internal(format!("Stored data types are malformed: {}", e)))?
        .unwrap_or_default();
    let now = chrono::Utc::now().to_rfc3339();

    let deleted_items = perform_deletion(&state.db, &user.id, scope, &data_types, &now).await?;

    sqlx::query("UPDATE deletion_requests SET status = 'completed', completed_at = ? WHERE id = ?")
        .bind(&now)
        .bind(&deletion.id)
        .execute(&state.db)
        .await?;

    let ip = client_ip(&headers);
    audit::log_audit(
        &state.db,
        actions::DELETION_EXECUTED,
        resource_types::DELETION_REQUEST,
        Some(&deletion.id),
        Some(&user.id),
        Some(&ip),
        Some(serde_json::json!({
            "scope": scope.as_str(),
            "deleted_items": deleted_items
        })),
    )
    .await?;

    counter!(DELETIONS_EXECUTED_TOTAL).increment(1);
    tracing::info!(
        user = %audit::anonymize_user_id(&user.id),
        scope = scope.as_str(),
        "User data deletion executed"
    );

    Ok(Json(ExecuteDeletionResponse {
        success: true,
        deleted_items,
        completed_at: now,
    }))
}

/// Opt out of further processing for a running analysis
pub async fn request_opt_out(
    State(state): State<Arc<AppState>>,
    user: User,
    headers: HeaderMap,
    Json(request): Json<RequestOptOutRequest>,
) -> Result<Json<RequestOptOutResponse>, ApiError> {
    let stage = ProcessingStage::parse(&request.stage)
        .ok_or_else(|| ApiError::validation_field("stage", "Unknown processing stage"))?;

    let session: Option<(String, String)> =
        sqlx::query_as("SELECT user_id, status FROM analysis_sessions WHERE id = ?")
            .bind(&request.session_id)
            .fetch_optional(&state.db)
            .await?;
    let (owner, status) =
        session.ok_or_else(|| ApiError::not_found("Analysis session not found"))?;
    if owner != user.id {
        return Err(ApiError::forbidden("Analysis session belongs to another user"));
    }

    let now = chrono::Utc::now().to_rfc3339();

    // Halt an in-flight analysis; terminal sessions keep their state
    let halted = matches!(status.as_str(), "pending" | "processing");
    if halted {
        sqlx::query(
            r#"
            UPDATE analysis_sessions
            SET status = 'failed', error_message = 'Processing halted by user opt-out',
                message = 'Opted out', updated_at = ?
            WHERE id = ? AND status IN ('pending', 'processing')
            "#,
        )
        .bind(&now)
        .bind(&request.session_id)
        .execute(&state.db)
        .await?;
    }

    // Remove step data recorded at or after the opted-out stage
    for later in stage.and_later() {
        sqlx::query("DELETE FROM processing_steps WHERE session_id = ? AND step = ?")
            .bind(&request.session_id)
            .bind(later.as_str())
            .execute(&state.db)
            .await?;
    }

    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO opt_out_requests (id, user_id, session_id, processing_stage, reason,
                                      status, requested_at, completed_at)
        VALUES (?, ?, ?, ?, ?, 'completed', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&user.id)
    .bind(&request.session_id)
    .bind(stage.as_str())
    .bind(&request.reason)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let ip = client_ip(&headers);
    audit::log_audit(
        &state.db,
        actions::OPT_OUT_REQUESTED,
        resource_types::OPT_OUT_REQUEST,
        Some(&id),
        Some(&user.id),
        Some(&ip),
        Some(serde_json::json!({
            "session_id": request.session_id,
            "stage": stage.as_str(),
            "halted": halted
        })),
    )
    .await?;

    Ok(Json(RequestOptOutResponse {
        success: true,
        request_id: id,
        status: "completed".to_string(),
    }))
}

/// List the caller's deletion and opt-out requests
pub async fn list_rights_requests(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<serde_json::Value>, ApiError> {
    let deletions: Vec<DeletionRequest> = sqlx::query_as(
        "SELECT * FROM deletion_requests WHERE user_id = ? ORDER BY requested_at DESC LIMIT 50",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;

    let opt_outs: Vec<OptOutRequest> = sqlx::query_as(
        "SELECT * FROM opt_out_requests WHERE user_id = ? ORDER BY requested_at DESC LIMIT 50",
    )
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "deletion_requests": deletions,
        "opt_out_requests": opt_outs
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, DbPool};

    async fn seed_user(pool: &DbPool, id: &str) {
        sqlx::query(
            "INSERT INTO users (id, email, password_hash, name, verified) VALUES (?, ?, 'x', 'Test', 1)",
        )
        .bind(id)
        .bind(format!("{}@example.com", id))
        .execute(pool)
        .await
        .unwrap();
    }

    async fn seed_session(pool: &DbPool, user_id: &str, id: &str) {
        sqlx::query(
            r#"
            INSERT INTO analysis_sessions (id, user_id, target_url, platform, analysis_type,
                                           status, expires_at)
            VALUES (?, ?, 'https://github.com/janedoe', 'github', 'comprehensive',
                    'completed', datetime('now', '+1 day'))
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO processing_steps (session_id, step) VALUES (?, 'data_collection')")
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
    }

    async fn seed_granted_consent(pool: &DbPool, user_id: &str, consent_type: &str) {
        sqlx::query(
            r#"
            INSERT INTO consent_records (id, user_id, consent_type, status, consent_version, granted_at)
            VALUES (?, ?, ?, 'granted', '4.3', datetime('now'))
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(consent_type)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn count(pool: &DbPool, sql: &str, user_id: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(sql)
            .bind(user_id)
            .fetch_one(pool)
            .await
            .unwrap();
        row.0
    }

    #[tokio::test]
    async fn test_partial_deletion_of_analysis_data_keeps_consents() {
        let pool = db::init_in_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        seed_session(&pool, "u1", "s1").await;
        seed_granted_consent(&pool, "u1", "data_collection").await;

        let now = chrono::Utc::now().to_rfc3339();
        let items = perform_deletion(
            &pool,
            "u1",
            DeletionScope::Partial,
            &["analysis_data".to_string()],
            &now,
        )
        .await
        .unwrap();

        assert_eq!(items, vec!["analysis_sessions (1)".to_string()]);
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM analysis_sessions WHERE user_id = ?", "u1").await,
            0
        );
        assert_eq!(
            count(
                &pool,
                "SELECT COUNT(*) FROM consent_records WHERE user_id = ? AND status = 'granted'",
                "u1"
            )
            .await,
            1
        );
        // The account itself is untouched by a partial deletion
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM users WHERE id = ? AND is_active = 1", "u1").await,
            1
        );
    }

    #[tokio::test]
    async fn test_partial_deletion_of_consent_data_keeps_analyses() {
        let pool = db::init_in_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        seed_session(&pool, "u1", "s1").await;
        seed_granted_consent(&pool, "u1", "data_collection").await;
        seed_granted_consent(&pool, "u1", "data_processing").await;

        let now = chrono::Utc::now().to_rfc3339();
        let items = perform_deletion(
            &pool,
            "u1",
            DeletionScope::Partial,
            &["consent_data".to_string()],
            &now,
        )
        .await
        .unwrap();

        assert_eq!(items, vec!["consents_withdrawn (2)".to_string()]);
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM analysis_sessions WHERE user_id = ?", "u1").await,
            1
        );
        assert_eq!(
            count(
                &pool,
                "SELECT COUNT(*) FROM consent_records WHERE user_id = ? AND status = 'granted'",
                "u1"
            )
            .await,
            0
        );
        assert_eq!(
            count(
                &pool,
                "SELECT COUNT(*) FROM consent_records WHERE user_id = ? AND status = 'withdrawn' AND withdrawal_reason = 'data_deletion'",
                "u1"
            )
            .await,
            2
        );
    }

    #[tokio::test]
    async fn test_complete_deletion_covers_everything() {
        let pool = db::init_in_memory().await.unwrap();
        seed_user(&pool, "u1").await;
        seed_session(&pool, "u1", "s1").await;
        seed_granted_consent(&pool, "u1", "data_collection").await;

        let now = chrono::Utc::now().to_rfc3339();
        let items = perform_deletion(&pool, "u1", DeletionScope::Complete, &[], &now)
            .await
            .unwrap();

        assert_eq!(items.len(), 3);
        assert!(items.contains(&"account (deactivated)".to_string()));
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM analysis_sessions WHERE user_id = ?", "u1").await,
            0
        );
        assert_eq!(
            count(&pool, "SELECT COUNT(*) FROM users WHERE id = ? AND is_active = 1", "u1").await,
            0
        );
    }

    #[test]
    fn test_deletion_code_format() {
        for _ in 0..20 {
            let code = generate_deletion_code();
            assert_eq!(code.len(), 8);
            assert!(code
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
            // Ambiguous characters are excluded from the charset
            assert!(!code.contains('O') && !code.contains('0'));
            assert!(!code.contains('I') && !code.contains('1'));
        }
    }
}
