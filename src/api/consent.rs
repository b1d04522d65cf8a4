//! Consent flow endpoints.
//!
//! A consent process walks the user through the catalog one item at a time.
//! Each decision is persisted as its own consent record before the process
//! state advances, so an interrupted flow never loses a recorded choice.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::api::auth::client_ip;
use crate::api::error::ApiError;
use crate::db::models::audit::{self, actions, resource_types};
use crate::db::models::consent::{
    consent_catalog, ConsentProcess, ConsentRecord, ConsentStatus, ConsentStepRequest,
    ConsentStepResponse, ConsentType, InitiateConsentRequest, InitiateConsentResponse,
    WithdrawConsentRequest, CONSENT_VERSION, REQUIRED_CONSENTS,
};
use crate::db::models::user::User;
use crate::AppState;

/// Consent types from the required set that the user has not actively granted.
/// Only the newest record per type counts, so a later denial or withdrawal
/// supersedes an earlier grant.
pub async fn missing_required_consents(
    db: &sqlx::SqlitePool,
    user_id: &str,
    now: &str,
) -> Result<Vec<&'static str>, sqlx::Error> {
    let mut missing = Vec::new();
    for consent_type in REQUIRED_CONSENTS {
        let latest: Option<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT status, expires_at FROM consent_records
            WHERE user_id = ? AND consent_type = ?
            ORDER BY created_at DESC, rowid DESC LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(consent_type.as_str())
        .fetch_optional(db)
        .await?;

        let active = matches!(
            &latest,
            Some((status, expires_at))
                if status == "granted"
                    && expires_at.as_deref().map_or(true, |e| e > now)
        );
        if !active {
            missing.push(consent_type.as_str());
        }
    }
    Ok(missing)
}

/// Start a new consent process
pub async fn initiate_consent_process(
    State(state): State<Arc<AppState>>,
    user: User,
    headers: HeaderMap,
    Json(request): Json<InitiateConsentRequest>,
) -> Result<Json<InitiateConsentResponse>, ApiError> {
    let catalog = consent_catalog();
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();

    sqlx::query(
        r#"
        INSERT INTO consent_processes (id, user_id, session_id, current_step, total_steps,
                                       is_complete, can_proceed, started_at)
        VALUES (?, ?, ?, 0, ?, 0, 0, ?)
        "#,
    )
    .bind(&id)
    .bind(&user.id)
    .bind(&request.session_id)
    .bind(catalog.len() as i64)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let ip = client_ip(&headers);
    audit::log_audit(
        &state.db,
        actions::CONSENT_PROCESS_STARTED,
        resource_types::CONSENT_PROCESS,
        Some(&id),
        Some(&user.id),
        Some(&ip),
        None,
    )
    .await?;

    Ok(Json(InitiateConsentResponse {
        success: true,
        process_id: id,
        current_step: 0,
        total_steps: catalog.len() as i64,
        consent_items: catalog.to_vec(),
        next_item: catalog.first().cloned(),
    }))
}

/// Record one consent decision and advance the process
pub async fn process_consent_step(
    State(state): State<Arc<AppState>>,
    user: User,
    headers: HeaderMap,
    Json(request): Json<ConsentStepRequest>,
) -> Result<Json<ConsentStepResponse>, ApiError> {
    let catalog = consent_catalog();

    let process: Option<ConsentProcess> =
        sqlx::query_as("SELECT * FROM consent_processes WHERE id = ?")
            .bind(&request.process_id)
            .fetch_optional(&state.db)
            .await?;
    let process = process.ok_or_else(|| ApiError::not_found("Consent process not found"))?;

    if process.user_id != user.id {
        return Err(ApiError::forbidden("Consent process belongs to another user"));
    }
    if process.is_complete != 0 {
        return Err(ApiError::conflict("Consent process is already complete"));
    }

    let consent_type = ConsentType::parse(&request.consent_type)
        .ok_or_else(|| ApiError::validation_field("consent_type", "Unknown consent type"))?;

    let step_index = process.current_step as usize;
    let expected = catalog
        .get(step_index)
        .ok_or_else(|| ApiError::conflict("Consent process has no remaining steps"))?;
    if expected.consent_type != consent_type {
        return Err(ApiError::bad_request(format!(
            "Expected consent decision for \"{}\" at this step",
            expected.consent_type.as_str()
        )));
    }

    let ip = client_ip(&headers);
    let user_agent = headers
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string());
    let now = chrono::Utc::now();
    let now_str = now.to_rfc3339();

    let status = if request.granted {
        ConsentStatus::Granted
    } else {
        ConsentStatus::Denied
    };
    let granted_at = request.granted.then(|| now_str.clone());
    let expires_at = request.granted.then(|| {
        (now + chrono::Duration::days(state.config.retention.consent_expiry_days)).to_rfc3339()
    });

    // The record is written before the process row moves forward
    let record_id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO consent_records (id, process_id, user_id, consent_type, status,
                                     consent_version, granted_at, withdrawn_at, expires_at,
                                     withdrawal_reason, ip_address, user_agent, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, NULL, ?, ?, ?)
        "#,
    )
    .bind(&record_id)
    .bind(&process.id)
    .bind(&user.id)
    .bind(consent_type.as_str())
    .bind(status.as_str())
    .bind(CONSENT_VERSION)
    .bind(&granted_at)
    .bind(&expires_at)
    .bind(&ip)
    .bind(&user_agent)
    .bind(&now_str)
    .execute(&state.db)
    .await?;

    let required_denied = expected.required && !request.granted;
    if required_denied {
        audit::log_audit(
            &state.db,
            actions::CONSENT_REQUIRED_DENIED,
            resource_types::CONSENT_RECORD,
            Some(&record_id),
            Some(&user.id),
            Some(&ip),
            Some(serde_json::json!({ "consent_type": consent_type.as_str() })),
        )
        .await?;
    } else {
        audit::log_audit(
            &state.db,
            actions::CONSENT_STEP_RECORDED,
            resource_types::CONSENT_RECORD,
            Some(&record_id),
            Some(&user.id),
            Some(&ip),
            Some(serde_json::json!({
                "consent_type": consent_type.as_str(),
                "granted": request.granted
            })),
        )
        .await?;
    }

    let next_step = process.current_step + 1;
    let process_complete = next_step as usize >= catalog.len();
    let can_proceed = missing_required_consents(&state.db, &user.id, &now_str)
        .await?
        .is_empty();

    let completed_at = process_complete.then(|| now_str.clone());
    sqlx::query(
        r#"
        UPDATE consent_processes
        SET current_step = ?, is_complete = ?, can_proceed = ?, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(next_step)
    .bind(process_complete as i64)
    .bind(can_proceed as i64)
    .bind(&completed_at)
    .bind(&process.id)
    .execute(&state.db)
    .await?;

    if process_complete {
        audit::log_audit(
            &state.db,
            actions::CONSENT_PROCESS_COMPLETED,
            resource_types::CONSENT_PROCESS,
            Some(&process.id),
            Some(&user.id),
            Some(&ip),
            Some(serde_json::json!({ "can_proceed": can_proceed })),
        )
        .await?;
    }

    Ok(Json(ConsentStepResponse {
        success: true,
        process_complete,
        can_proceed,
        required_consent_denied: required_denied,
        current_step: next_step,
        total_steps: catalog.len() as i64,
        next_item: catalog.get(next_step as usize).cloned(),
    }))
}

/// Withdraw one consent, or all active consents
pub async fn withdraw_consent(
    State(state): State<Arc<AppState>>,
    user: User,
    headers: HeaderMap,
    Json(request): Json<WithdrawConsentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let consent_type = match &request.consent_type {
        Some(s) => Some(
            ConsentType::parse(s)
                .ok_or_else(|| ApiError::validation_field("consent_type", "Unknown consent type"))?,
        ),
        None => None,
    };

    let now = chrono::Utc::now().to_rfc3339();
    let result = match consent_type {
        Some(ct) => {
            sqlx::query(
                r#"
                UPDATE consent_records
                SET status = 'withdrawn', withdrawn_at = ?, withdrawal_reason = ?
                WHERE user_id = ? AND consent_type = ? AND status = 'granted'
                "#,
            )
            .bind(&now)
            .bind(&request.reason)
            .bind(&user.id)
            .bind(ct.as_str())
            .execute(&state.db)
            .await?
        }
        None => {
            sqlx::query(
                r#"
                UPDATE consent_records
                SET status = 'withdrawn', withdrawn_at = ?, withdrawal_reason = ?
                WHERE user_id = ? AND status = 'granted'
                "#,
            )
            .bind(&now)
            .bind(&request.reason)
            .bind(&user.id)
            .execute(&state.db)
            .await?
        }
    };

    let ip = client_ip(&headers);
    audit::log_audit(
        &state.db,
        actions::CONSENT_WITHDRAWN,
        resource_types::CONSENT_RECORD,
        None,
        Some(&user.id),
        Some(&ip),
        Some(serde_json::json!({
            "consent_type": consent_type.map(|ct| ct.as_str()),
            "withdrawn_count": result.rows_affected()
        })),
    )
    .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "withdrawn_count": result.rows_affected(),
        "withdrawn_at": now
    })))
}

/// Current consent standing: the latest record per catalog item
pub async fn consent_status(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = chrono::Utc::now().to_rfc3339();
    let mut items = Vec::new();
    for item in consent_catalog() {
        let record: Option<ConsentRecord> = sqlx::query_as(
            r#"
            SELECT * FROM consent_records
            WHERE user_id = ? AND consent_type = ?
            ORDER BY created_at DESC LIMIT 1
            "#,
        )
        .bind(&user.id)
        .bind(item.consent_type.as_str())
        .fetch_optional(&state.db)
        .await?;

        let status = match &record {
            Some(r) if r.status == "granted" => {
                // Granted consents lapse once their expiry passes
                match &r.expires_at {
                    Some(exp) if exp.as_str() <= now.as_str() => "expired",
                    _ => "granted",
                }
            }
            Some(r) => r.status.as_str(),
            None => "not_recorded",
        };

        items.push(serde_json::json!({
            "consent_type": item.consent_type.as_str(),
            "title": item.title,
            "required": item.required,
            "status": status,
            "granted_at": record.as_ref().and_then(|r| r.granted_at.clone()),
            "expires_at": record.as_ref().and_then(|r| r.expires_at.clone()),
        }));
    }

    let missing = missing_required_consents(&state.db, &user.id, &now).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "consent_version": CONSENT_VERSION,
        "can_proceed": missing.is_empty(),
        "missing_required": missing,
        "consents": items
    })))
}

#[derive(Debug, Deserialize)]
pub struct ConsentHistoryQuery {
    pub limit: Option<i64>,
}

/// Full consent record history, newest first
pub async fn consent_history(
    State(state): State<Arc<AppState>>,
    user: User,
    Query(query): Query<ConsentHistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let records: Vec<ConsentRecord> = sqlx::query_as(
        "SELECT * FROM consent_records WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(&user.id)
    .bind(limit)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "total_count": records.len(),
        "records": records
    })))
}

/// Look up one consent process by id
pub async fn get_consent_process(
    State(state): State<Arc<AppState>>,
    user: User,
    Path(process_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let process: Option<ConsentProcess> =
        sqlx::query_as("SELECT * FROM consent_processes WHERE id = ?")
            .bind(&process_id)
            .fetch_optional(&state.db)
            .await?;
    let process = process.ok_or_else(|| ApiError::not_found("Consent process not found"))?;
    if process.user_id != user.id {
        return Err(ApiError::forbidden("Consent process belongs to another user"));
    }

    let catalog = consent_catalog();
    let next_item = catalog.get(process.current_step as usize).cloned();

    Ok(Json(serde_json::json!({
        "success": true,
        "process": process,
        "next_item": next_item
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{self, DbPool};
    use crate::engine::AnalysisJob;
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

    async fn record_consent(
        pool: &DbPool,
        user_id: &str,
        consent_type: &str,
        status: &str,
        created_at: &str,
    ) {
        sqlx::query(
            r#"
            INSERT INTO consent_records (id, user_id, consent_type, status, consent_version, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(consent_type)
        .bind(status)
        .bind(CONSENT_VERSION)
        .bind(created_at)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn grant_step(
        state: &Arc<AppState>,
        user: &User,
        process_id: &str,
        consent_type: &str,
        granted: bool,
    ) -> ConsentStepResponse {
        let Json(response) = process_consent_step(
            State(state.clone()),
            user.clone(),
            HeaderMap::new(),
            Json(ConsentStepRequest {
                process_id: process_id.to_string(),
                consent_type: consent_type.to_string(),
                granted,
            }),
        )
        .await
        .unwrap();
        response
    }

    #[tokio::test]
    async fn test_gate_requires_both_required_consents() {
        let (state, _rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;
        let now = chrono::Utc::now().to_rfc3339();

        let missing = missing_required_consents(&state.db, &user.id, &now)
            .await
            .unwrap();
        assert_eq!(missing, vec!["data_collection", "data_processing"]);

        record_consent(&state.db, &user.id, "data_collection", "granted", &now).await;
        let missing = missing_required_consents(&state.db, &user.id, &now)
            .await
            .unwrap();
        assert_eq!(missing, vec!["data_processing"]);

        record_consent(&state.db, &user.id, "data_processing", "granted", &now).await;
        let missing = missing_required_consents(&state.db, &user.id, &now)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_latest_record_wins_per_consent_type() {
        let (state, _rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;
        let now = "2026-02-10T00:00:00+00:00";

        record_consent(&state.db, &user.id, "data_processing", "granted", now).await;

        // An old grant must not outvote a newer denial
        record_consent(
            &state.db,
            &user.id,
            "data_collection",
            "granted",
            "2026-02-01T00:00:00+00:00",
        )
        .await;
        record_consent(
            &state.db,
            &user.id,
            "data_collection",
            "denied",
            "2026-02-02T00:00:00+00:00",
        )
        .await;
        let missing = missing_required_consents(&state.db, &user.id, now)
            .await
            .unwrap();
        assert_eq!(missing, vec!["data_collection"]);

        // A fresh grant after the denial reopens the gate
        record_consent(
            &state.db,
            &user.id,
            "data_collection",
            "granted",
            "2026-02-03T00:00:00+00:00",
        )
        .await;
        let missing = missing_required_consents(&state.db, &user.id, now)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_expired_grant_does_not_count() {
        let (state, _rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;

        sqlx::query(
            r#"
            INSERT INTO consent_records (id, user_id, consent_type, status, consent_version,
                                         expires_at, created_at)
            VALUES (?, ?, 'data_collection', 'granted', ?, '2026-01-01T00:00:00+00:00',
                    '2025-12-01T00:00:00+00:00')
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&user.id)
        .bind(CONSENT_VERSION)
        .execute(&state.db)
        .await
        .unwrap();

        let missing =
            missing_required_consents(&state.db, &user.id, "2026-02-01T00:00:00+00:00")
                .await
                .unwrap();
        assert!(missing.contains(&"data_collection"));
    }

    #[tokio::test]
    async fn test_step_flow_unblocks_once_required_items_granted() {
        let (state, _rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;

        let Json(initiated) = initiate_consent_process(
            State(state.clone()),
            user.clone(),
            HeaderMap::new(),
            Json(InitiateConsentRequest { session_id: None }),
        )
        .await
        .unwrap();
        assert_eq!(initiated.current_step, 0);
        assert_eq!(initiated.total_steps, consent_catalog().len() as i64);

        // First required item alone does not open the gate
        let step = grant_step(&state, &user, &initiated.process_id, "data_collection", true).await;
        assert!(!step.can_proceed);
        assert!(!step.process_complete);

        // Second required item flips can_proceed
        let step = grant_step(&state, &user, &initiated.process_id, "data_processing", true).await;
        assert!(step.can_proceed);

        // Denying the remaining optional items never closes it again
        for optional in [
            "analysis_inference",
            "data_retention",
            "result_storage",
            "third_party_sharing",
            "marketing_communications",
        ] {
            let step = grant_step(&state, &user, &initiated.process_id, optional, false).await;
            assert!(step.can_proceed, "optional denial must not close the gate");
            assert!(!step.required_consent_denied);
        }

        let process: ConsentProcess =
            sqlx::query_as("SELECT * FROM consent_processes WHERE id = ?")
                .bind(&initiated.process_id)
                .fetch_one(&state.db)
                .await
                .unwrap();
        assert_eq!(process.is_complete, 1);
        assert_eq!(process.can_proceed, 1);
        assert!(process.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_steps_follow_catalog_order() {
        let (state, _rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;

        let Json(initiated) = initiate_consent_process(
            State(state.clone()),
            user.clone(),
            HeaderMap::new(),
            Json(InitiateConsentRequest { session_id: None }),
        )
        .await
        .unwrap();

        // Step 0 expects data_collection, not data_retention
        let err = process_consent_step(
            State(state.clone()),
            user.clone(),
            HeaderMap::new(),
            Json(ConsentStepRequest {
                process_id: initiated.process_id.clone(),
                consent_type: "data_retention".to_string(),
                granted: true,
            }),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("data_collection"));
    }

    #[tokio::test]
    async fn test_denying_required_item_is_flagged() {
        let (state, _rx) = test_state().await;
        let user = seed_user(&state.db, "u1").await;

        let Json(initiated) = initiate_consent_process(
            State(state.clone()),
            user.clone(),
            HeaderMap::new(),
            Json(InitiateConsentRequest { session_id: None }),
        )
        .await
        .unwrap();

        let step = grant_step(&state, &user, &initiated.process_id, "data_collection", false).await;
        assert!(step.required_consent_denied);
        assert!(!step.can_proceed);
    }
}
