//! User account models and auth DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub name: String,
    pub verified: i64,
    #[serde(skip_serializing)]
    pub verification_code: Option<String>,
    pub is_active: i64,
    pub subscription_tier: String,
    pub privacy_level: String,
    pub daily_usage_count: i64,
    /// Calendar day (UTC, YYYY-MM-DD) that daily_usage_count refers to
    pub usage_day: Option<String>,
    pub total_analyses: i64,
    pub last_analysis_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    /// Daily usage for the given UTC day; a stale usage_day counts as zero.
    pub fn usage_for_day(&self, day: &str) -> i64 {
        match self.usage_day.as_deref() {
            Some(d) if d == day => self.daily_usage_count,
            _ => 0,
        }
    }
}

/// Public view of a user, safe to return from the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub user_id: String,
    pub email: String,
    pub email_verified: bool,
    pub display_name: String,
    pub subscription_tier: String,
    pub privacy_level: String,
    pub daily_usage_count: i64,
    pub total_analyses: i64,
    pub created_at: String,
    pub last_analysis: Option<String>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            user_id: user.id,
            email: user.email,
            email_verified: user.verified != 0,
            display_name: user.name,
            subscription_tier: user.subscription_tier,
            privacy_level: user.privacy_level,
            daily_usage_count: user.daily_usage_count,
            total_analyses: user.total_analyses,
            created_at: user.created_at,
            last_analysis: user.last_analysis_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub success: bool,
    pub user_id: String,
    pub requires_verification: bool,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub remember: bool,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub success: bool,
    pub token: String,
    pub expires_at: String,
    pub user: UserResponse,
}
