//! Audit log model for tracking user actions.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;

/// Audit log entry for tracking user actions
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLog {
    pub id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub details: Option<String>,
    pub created_at: String,
}

/// Common audit action types
pub mod actions {
    // Auth actions
    pub const AUTH_REGISTER: &str = "auth.register";
    pub const AUTH_VERIFY_EMAIL: &str = "auth.verify_email";
    pub const AUTH_LOGIN: &str = "auth.login";
    pub const AUTH_LOGOUT: &str = "auth.logout";
    pub const AUTH_LOGIN_LOCKED: &str = "auth.login_locked";

    // Analysis actions
    pub const ANALYSIS_STARTED: &str = "analysis.started";
    pub const ANALYSIS_COMPLETED: &str = "analysis.completed";
    pub const ANALYSIS_FAILED: &str = "analysis.failed";
    pub const ANALYSIS_DELETED: &str = "analysis.deleted";

    // Consent actions
    pub const CONSENT_PROCESS_STARTED: &str = "consent.process_started";
    pub const CONSENT_STEP_RECORDED: &str = "consent.step_recorded";
    pub const CONSENT_REQUIRED_DENIED: &str = "consent.required_denied";
    pub const CONSENT_PROCESS_COMPLETED: &str = "consent.process_completed";
    pub const CONSENT_WITHDRAWN: &str = "consent.withdrawn";

    // User-rights actions
    pub const DELETION_REQUESTED: &str = "rights.deletion_requested";
    pub const DELETION_EXECUTED: &str = "rights.deletion_executed";
    pub const OPT_OUT_REQUESTED: &str = "rights.opt_out_requested";
}

/// Common resource types
pub mod resource_types {
    pub const USER: &str = "user";
    pub const ANALYSIS_SESSION: &str = "analysis_session";
    pub const CONSENT_PROCESS: &str = "consent_process";
    pub const CONSENT_RECORD: &str = "consent_record";
    pub const DELETION_REQUEST: &str = "deletion_request";
    pub const OPT_OUT_REQUEST: &str = "opt_out_request";
}

/// Truncated SHA-256 of a user id, for log lines that must not carry the raw id
pub fn anonymize_user_id(user_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// Log an audit event to the database
pub async fn log_audit(
    db: &SqlitePool,
    action: &str,
    resource_type: &str,
    resource_id: Option<&str>,
    user_id: Option<&str>,
    ip_address: Option<&str>,
    details: Option<serde_json::Value>,
) -> Result<(), sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let details_json = details.map(|d| d.to_string());

    sqlx::query(
        r#"
        INSERT INTO audit_logs (id, action, resource_type, resource_id, user_id, ip_address, details, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(action)
    .bind(resource_type)
    .bind(resource_id)
    .bind(user_id)
    .bind(ip_address)
    .bind(&details_json)
    .bind(&now)
    .execute(db)
    .await?;

    tracing::debug!(
        action = action,
        resource_type = resource_type,
        resource_id = resource_id,
        user = user_id.map(anonymize_user_id).as_deref(),
        "Audit log recorded"
    );

    Ok(())
}

/// List a user's audit log entries, newest first
pub async fn list_user_audit_logs(
    db: &SqlitePool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<AuditLog>, sqlx::Error> {
    sqlx::query_as(
        "SELECT * FROM audit_logs WHERE user_id = ? ORDER BY created_at DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit.clamp(1, 100))
    .fetch_all(db)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymize_is_stable_and_short() {
        let a = anonymize_user_id("user-123");
        let b = anonymize_user_id("user-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, anonymize_user_id("user-124"));
    }
}
