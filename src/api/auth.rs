//! Authentication: registration, email verification, login sessions.
//!
//! Session tokens are random 32-byte values returned to the client once and
//! stored only as SHA-256 hashes. The static admin token from config is
//! compared in constant time.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, Request},
    middleware::Next,
    response::Response,
    Json,
};
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::config::AuthConfig;
use crate::db::models::audit::{self, actions, resource_types};
use crate::db::models::user::{
    LoginRequest, LoginResponse, RegisterRequest, RegisterResponse, User, UserResponse,
    VerifyEmailRequest,
};
use crate::db::models::session::AuthSession;
use crate::AppState;

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password against a hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Generate a random session token
fn generate_token() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();
    hex::encode(bytes)
}

/// Hash a token for storage
fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a 6-digit email verification code
pub fn generate_verification_code() -> String {
    let mut rng = rand::rng();
    format!("{:06}", rng.random_range(0..1_000_000u32))
}

/// Passwords rejected outright regardless of composition
const COMMON_PASSWORDS: &[&str] = &[
    "password", "password1", "password123", "12345678", "123456789", "qwerty123",
    "letmein1", "welcome1", "admin123", "iloveyou1",
];

/// Validate password strength.
/// Returns None if valid, or Some(error_message) if invalid.
fn validate_password_strength(password: &str) -> Option<String> {
    if password.len() < 8 {
        return Some("Password must be at least 8 characters".to_string());
    }

    let has_uppercase = password.chars().any(|c| c.is_uppercase());
    let has_lowercase = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| !c.is_alphanumeric());

    if !has_uppercase {
        return Some("Password must contain at least one uppercase letter".to_string());
    }
    if !has_lowercase {
        return Some("Password must contain at least one lowercase letter".to_string());
    }
    if !has_digit {
        return Some("Password must contain at least one digit".to_string());
    }
    if !has_special {
        return Some("Password must contain at least one special character".to_string());
    }
    if COMMON_PASSWORDS.contains(&password.to_lowercase().as_str()) {
        return Some("Password is too common".to_string());
    }

    None
}

/// Tracks failed login attempts per (IP, email) pair
#[derive(Debug, Clone)]
pub struct LoginTracker {
    attempts: Arc<DashMap<(String, String), FailedAttempts>>,
    max_attempts: u32,
    lockout: Duration,
}

#[derive(Debug, Clone)]
struct FailedAttempts {
    count: u32,
    locked_until: Option<Instant>,
    last_failure: Instant,
}

impl LoginTracker {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            attempts: Arc::new(DashMap::new()),
            max_attempts: config.max_login_attempts,
            lockout: Duration::from_secs(config.lockout_minutes.max(0) as u64 * 60),
        }
    }

    /// Seconds remaining on an active lockout, if any
    pub fn locked_for(&self, ip: &str, email: &str) -> Option<u64> {
        let key = (ip.to_string(), email.to_string());
        let entry = self.attempts.get(&key)?;
        let locked_until = entry.locked_until?;
        let now = Instant::now();
        if locked_until > now {
            Some((locked_until - now).as_secs().max(1))
        } else {
            None
        }
    }

    /// Record a failed attempt; returns true if the pair is now locked out
    pub fn record_failure(&self, ip: &str, email: &str) -> bool {
        let key = (ip.to_string(), email.to_string());
        let now = Instant::now();
        let mut entry = self.attempts.entry(key).or_insert(FailedAttempts {
            count: 0,
            locked_until: None,
            last_failure: now,
        });

        // Stale counters from before a full lockout window reset
        if now.duration_since(entry.last_failure) > self.lockout {
            entry.count = 0;
            entry.locked_until = None;
        }

        entry.count += 1;
        entry.last_failure = now;
        if entry.count >= self.max_attempts {
            entry.locked_until = Some(now + self.lockout);
            true
        } else {
            false
        }
    }

    /// Clear the counter after a successful login
    pub fn record_success(&self, ip: &str, email: &str) {
        self.attempts
            .remove(&(ip.to_string(), email.to_string()));
    }

    /// Drop entries whose lockout window has fully elapsed
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let lockout = self.lockout;
        self.attempts
            .retain(|_, entry| now.duration_since(entry.last_failure) < lockout * 2);
    }
}

/// Best-effort client IP from proxy headers
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|h| h.to_str().ok()) {
        if let Some(ip) = forwarded.split(',').next() {
            let ip = ip.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|h| h.to_str().ok()) {
        return real_ip.trim().to_string();
    }
    "127.0.0.1".to_string()
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get("user-agent")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

/// Register a new account
pub async fn register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let email = request.email.trim().to_lowercase();
    crate::api::validation::validate_email(&email)
        .map_err(|msg| ApiError::validation_field("email", msg))?;
    if let Some(msg) = validate_password_strength(&request.password) {
        return Err(ApiError::validation_field("password", msg));
    }
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::validation_field("name", "Name is required"));
    }

    let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(&state.db)
        .await?;
    if existing.is_some() {
        return Err(ApiError::conflict("An account with this email already exists"));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let password_hash = hash_password(&request.password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {}", e)))?;
    let now = chrono::Utc::now().to_rfc3339();

    let requires_verification = state.config.auth.require_email_verification;
    let verification_code = if requires_verification {
        Some(generate_verification_code())
    } else {
        None
    };
    let verified = if requires_verification { 0 } else { 1 };

    sqlx::query(
        r#"
        INSERT INTO users (id, email, password_hash, name, verified, verification_code,
                           is_active, subscription_tier, privacy_level,
                           daily_usage_count, usage_day, total_analyses, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 1, 'free', 'standard', 0, NULL, 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&email)
    .bind(&password_hash)
    .bind(name)
    .bind(verified)
    .bind(&verification_code)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    if let Some(code) = &verification_code {
        state.mailer.send_verification_code(&email, code).await;
    }

    let ip = client_ip(&headers);
    audit::log_audit(
        &state.db,
        actions::AUTH_REGISTER,
        resource_types::USER,
        Some(&id),
        Some(&id),
        Some(&ip),
        None,
    )
    .await?;

    tracing::info!(user = %audit::anonymize_user_id(&id), "User registered");

    Ok(Json(RegisterResponse {
        success: true,
        user_id: id,
        requires_verification,
    }))
}

/// Verify an email address with the emailed code
pub async fn verify_email(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<VerifyEmailRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let email = request.email.trim().to_lowercase();
    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(&state.db)
        .await?;
    let user = user.ok_or_else(|| ApiError::unauthorized("Invalid email or code"))?;

    if user.verified != 0 {
        return Ok(Json(serde_json::json!({
            "success": true,
            "already_verified": true
        })));
    }

    let stored = user
        .verification_code
        .as_deref()
        .ok_or_else(|| ApiError::unauthorized("Invalid email or code"))?;
    if stored.as_bytes().ct_eq(request.code.trim().as_bytes()).unwrap_u8() == 0 {
        return Err(ApiError::unauthorized("Invalid email or code"));
    }

    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        "UPDATE users SET verified = 1, verification_code = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(&now)
    .bind(&user.id)
    .execute(&state.db)
    .await?;

    let ip = client_ip(&headers);
    audit::log_audit(
        &state.db,
        actions::AUTH_VERIFY_EMAIL,
        resource_types::USER,
        Some(&user.id),
        Some(&user.id),
        Some(&ip),
        None,
    )
    .await?;

    Ok(Json(serde_json::json!({ "success": true })))
}

/// Login endpoint
pub async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let email = request.email.trim().to_lowercase();
    let ip = client_ip(&headers);

    if let Some(retry_after) = state.login_tracker.locked_for(&ip, &email) {
        return Err(ApiError::rate_limited(format!(
            "Too many failed login attempts. Try again in {} seconds.",
            retry_after
        )));
    }

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE email = ?")
        .bind(&email)
        .fetch_optional(&state.db)
        .await?;

    let valid = match &user {
        Some(u) => u.is_active != 0 && verify_password(&request.password, &u.password_hash),
        None => {
            // Burn comparable time so absent accounts are indistinguishable
            let _ = verify_password(&request.password, DUMMY_HASH);
            false
        }
    };

    if !valid {
        let locked = state.login_tracker.record_failure(&ip, &email);
        if locked {
            audit::log_audit(
                &state.db,
                actions::AUTH_LOGIN_LOCKED,
                resource_types::USER,
                None,
                None,
                Some(&ip),
                Some(serde_json::json!({ "email": email })),
            )
            .await?;
        }
        return Err(ApiError::unauthorized("Invalid credentials"));
    }

    let user = user.ok_or_else(|| ApiError::unauthorized("Invalid credentials"))?;

    if state.config.auth.require_email_verification && user.verified == 0 {
        return Err(ApiError::forbidden(
            "Email address not verified. Check your inbox for the verification code.",
        ));
    }

    state.login_tracker.record_success(&ip, &email);

    let token = generate_token();
    let token_hash = hash_token(&token);

    let ttl = if request.remember {
        chrono::Duration::days(state.config.auth.remember_ttl_days)
    } else {
        chrono::Duration::hours(state.config.auth.session_ttl_hours)
    };
    let now = chrono::Utc::now();
    let created_at = now.to_rfc3339();
    let expires_at = (now + ttl).to_rfc3339();

    let session_id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO auth_sessions (id, user_id, token_hash, ip_address, user_agent,
                                   is_active, created_at, last_accessed_at, expires_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?)
        "#,
    )
    .bind(&session_id)
    .bind(&user.id)
    .bind(&token_hash)
    .bind(&ip)
    .bind(user_agent(&headers))
    .bind(&created_at)
    .bind(&created_at)
    .bind(&expires_at)
    .execute(&state.db)
    .await?;

    audit::log_audit(
        &state.db,
        actions::AUTH_LOGIN,
        resource_types::USER,
        Some(&user.id),
        Some(&user.id),
        Some(&ip),
        Some(serde_json::json!({ "remember": request.remember })),
    )
    .await?;

    Ok(Json(LoginResponse {
        success: true,
        token,
        expires_at,
        user: UserResponse::from(user),
    }))
}

// Valid Argon2 hash of an unguessable value, used to equalize timing
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$MDEyMzQ1Njc4OWFiY2RlZg$GpZ3sK/oH9p7bIP2HH8vFMCvX0tXP0qgIPLqgGIBLRY";

/// Logout: deactivate the current session
pub async fn logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let token = extract_token(&headers)
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
    let token_hash = hash_token(&token);

    let session: Option<AuthSession> =
        sqlx::query_as("SELECT * FROM auth_sessions WHERE token_hash = ? AND is_active = 1")
            .bind(&token_hash)
            .fetch_optional(&state.db)
            .await?;

    if let Some(session) = session {
        sqlx::query("UPDATE auth_sessions SET is_active = 0 WHERE id = ?")
            .bind(&session.id)
            .execute(&state.db)
            .await?;

        let ip = client_ip(&headers);
        audit::log_audit(
            &state.db,
            actions::AUTH_LOGOUT,
            resource_types::USER,
            Some(&session.user_id),
            Some(&session.user_id),
            Some(&ip),
            None,
        )
        .await?;
    }

    Ok(Json(serde_json::json!({ "success": true })))
}

/// Current user's profile
pub async fn profile(user: User) -> Json<UserResponse> {
    Json(UserResponse::from(user))
}

/// Auth middleware that validates tokens
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;

    // Constant-time comparison against the static admin token
    let admin_token = state.config.auth.admin_token.as_bytes();
    let provided = token.as_bytes();
    if admin_token.len() == provided.len() && admin_token.ct_eq(provided).into() {
        return Ok(next.run(request).await);
    }

    let token_hash = hash_token(&token);
    let now = chrono::Utc::now().to_rfc3339();
    let session: Option<AuthSession> = sqlx::query_as(
        "SELECT * FROM auth_sessions WHERE token_hash = ? AND is_active = 1 AND expires_at > ?",
    )
    .bind(&token_hash)
    .bind(&now)
    .fetch_optional(&state.db)
    .await?;

    match session {
        Some(session) => {
            sqlx::query("UPDATE auth_sessions SET last_accessed_at = ? WHERE id = ?")
                .bind(&now)
                .bind(&session.id)
                .execute(&state.db)
                .await?;
            Ok(next.run(request).await)
        }
        None => Err(ApiError::unauthorized("Invalid or expired session")),
    }
}

/// Extract the bearer token from request headers
fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth_header) = headers.get("Authorization").and_then(|h| h.to_str().ok()) {
        if let Some(token) = auth_header.strip_prefix("Bearer ") {
            return Some(token.to_string());
        }
    }
    headers
        .get("X-API-Key")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
}

/// Get the current user from a token
pub async fn get_current_user(
    pool: &sqlx::SqlitePool,
    config: &crate::config::Config,
    token: &str,
) -> Result<User, ApiError> {
    // The admin token maps to a synthetic system account
    let admin_token = config.auth.admin_token.as_bytes();
    if admin_token.len() == token.len() && admin_token.ct_eq(token.as_bytes()).into() {
        let now = chrono::Utc::now().to_rfc3339();
        return Ok(User {
            id: "system".to_string(),
            email: "system@tracelens.local".to_string(),
            password_hash: String::new(),
            name: "System".to_string(),
            verified: 1,
            verification_code: None,
            is_active: 1,
            subscription_tier: "admin".to_string(),
            privacy_level: "standard".to_string(),
            daily_usage_count: 0,
            usage_day: None,
            total_analyses: 0,
            last_analysis_at: None,
            created_at: now.clone(),
            updated_at: now,
        });
    }

    let token_hash = hash_token(token);
    let now = chrono::Utc::now().to_rfc3339();
    let session: Option<AuthSession> = sqlx::query_as(
        "SELECT * FROM auth_sessions WHERE token_hash = ? AND is_active = 1 AND expires_at > ?",
    )
    .bind(&token_hash)
    .bind(&now)
    .fetch_optional(pool)
    .await?;

    let session = session.ok_or_else(|| ApiError::unauthorized("Invalid or expired session"))?;

    let user: Option<User> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&session.user_id)
        .fetch_optional(pool)
        .await?;

    user.filter(|u| u.is_active != 0)
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired session"))
}

/// Extractor for getting the current authenticated user from a request
#[async_trait]
impl FromRequestParts<Arc<AppState>> for User {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_token(&parts.headers)
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;
        get_current_user(&state.db, &state.config, &token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("Str0ngPass!").unwrap();
        assert!(verify_password("Str0ngPass!", &hash));
        assert!(!verify_password("WrongPass1", &hash));
    }

    #[test]
    fn test_verify_rejects_malformed_hash() {
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn test_token_hash_is_stable() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert_eq!(hash_token(&token), hash_token(&token));
    }

    #[test]
    fn test_verification_code_format() {
        for _ in 0..20 {
            let code = generate_verification_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_password_strength() {
        assert!(validate_password_strength("short1A").is_some());
        assert!(validate_password_strength("alllowercase1!").is_some());
        assert!(validate_password_strength("ALLUPPERCASE1!").is_some());
        assert!(validate_password_strength("NoDigitsHere!").is_some());
        assert!(validate_password_strength("NoSpecial1Here").is_some());
        assert!(validate_password_strength("GoodPass1!").is_none());
    }

    fn tracker(max_attempts: u32) -> LoginTracker {
        LoginTracker::new(&AuthConfig {
            max_login_attempts: max_attempts,
            lockout_minutes: 15,
            ..AuthConfig::default()
        })
    }

    #[test]
    fn test_login_tracker_locks_after_max_failures() {
        let tracker = tracker(3);
        assert!(!tracker.record_failure("1.2.3.4", "a@b.com"));
        assert!(!tracker.record_failure("1.2.3.4", "a@b.com"));
        assert!(tracker.record_failure("1.2.3.4", "a@b.com"));
        assert!(tracker.locked_for("1.2.3.4", "a@b.com").is_some());
    }

    #[test]
    fn test_login_tracker_tracks_per_ip_and_email() {
        let tracker = tracker(2);
        tracker.record_failure("1.2.3.4", "a@b.com");
        tracker.record_failure("1.2.3.4", "a@b.com");
        assert!(tracker.locked_for("1.2.3.4", "a@b.com").is_some());
        assert!(tracker.locked_for("5.6.7.8", "a@b.com").is_none());
        assert!(tracker.locked_for("1.2.3.4", "c@d.com").is_none());
    }

    #[test]
    fn test_login_tracker_success_clears_counter() {
        let tracker = tracker(3);
        tracker.record_failure("1.2.3.4", "a@b.com");
        tracker.record_failure("1.2.3.4", "a@b.com");
        tracker.record_success("1.2.3.4", "a@b.com");
        assert!(!tracker.record_failure("1.2.3.4", "a@b.com"));
    }
}
