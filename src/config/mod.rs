use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub smtp: SmtpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Allowed CORS origins for the browser frontend
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            data_dir: default_data_dir(),
            cors_origins: default_cors_origins(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5001
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Static API token with full access, compared in constant time
    #[serde(default = "default_admin_token")]
    pub admin_token: String,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
    /// Session lifetime when the client asks to be remembered
    #[serde(default = "default_remember_ttl_days")]
    pub remember_ttl_days: i64,
    #[serde(default = "default_max_login_attempts")]
    pub max_login_attempts: u32,
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,
    #[serde(default = "default_require_verification")]
    pub require_email_verification: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_token: default_admin_token(),
            session_ttl_hours: default_session_ttl_hours(),
            remember_ttl_days: default_remember_ttl_days(),
            max_login_attempts: default_max_login_attempts(),
            lockout_minutes: default_lockout_minutes(),
            require_email_verification: default_require_verification(),
        }
    }
}

fn default_admin_token() -> String {
    // Generate a random token if not provided
    uuid::Uuid::new_v4().to_string()
}

fn default_session_ttl_hours() -> i64 {
    24
}

fn default_remember_ttl_days() -> i64 {
    30
}

fn default_max_login_attempts() -> u32 {
    5
}

fn default_lockout_minutes() -> i64 {
    15
}

fn default_require_verification() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// TTL for analysis sessions and their result payloads
    #[serde(default = "default_analysis_ttl_hours")]
    pub analysis_ttl_hours: i64,
    /// Interval between maintenance sweeps in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// Soft-expired sessions are hard-deleted after this grace window
    #[serde(default = "default_delete_grace_hours")]
    pub delete_grace_hours: i64,
    /// Cron expression for the daily deep-cleanup slot
    #[serde(default = "default_deep_cleanup_schedule")]
    pub deep_cleanup_schedule: String,
    #[serde(default = "default_audit_retention_days")]
    pub audit_retention_days: i64,
    /// Granted consents expire after this many days
    #[serde(default = "default_consent_expiry_days")]
    pub consent_expiry_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            analysis_ttl_hours: default_analysis_ttl_hours(),
            sweep_interval_seconds: default_sweep_interval(),
            delete_grace_hours: default_delete_grace_hours(),
            deep_cleanup_schedule: default_deep_cleanup_schedule(),
            audit_retention_days: default_audit_retention_days(),
            consent_expiry_days: default_consent_expiry_days(),
        }
    }
}

fn default_analysis_ttl_hours() -> i64 {
    24
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_delete_grace_hours() -> i64 {
    24
}

fn default_deep_cleanup_schedule() -> String {
    // sec min hour day month weekday
    "0 0 2 * * *".to_string()
}

fn default_audit_retention_days() -> i64 {
    90
}

fn default_consent_expiry_days() -> i64 {
    365
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Analyses per day on the free tier
    #[serde(default = "default_free_daily_analyses")]
    pub free_daily_analyses: i64,
    #[serde(default = "default_history_max")]
    pub history_max: i64,
    #[serde(default = "default_max_deletion_requests")]
    pub max_deletion_requests: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            free_daily_analyses: default_free_daily_analyses(),
            history_max: default_history_max(),
            max_deletion_requests: default_max_deletion_requests(),
        }
    }
}

fn default_free_daily_analyses() -> i64 {
    3
}

fn default_history_max() -> i64 {
    50
}

fn default_max_deletion_requests() -> i64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_requests")]
    pub api_requests_per_window: u32,
    #[serde(default = "default_auth_requests")]
    pub auth_requests_per_window: u32,
    #[serde(default = "default_analysis_requests")]
    pub analysis_requests_per_window: u32,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            api_requests_per_window: default_api_requests(),
            auth_requests_per_window: default_auth_requests(),
            analysis_requests_per_window: default_analysis_requests(),
            window_seconds: default_window_seconds(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_api_requests() -> u32 {
    100
}

fn default_auth_requests() -> u32 {
    20
}

fn default_analysis_requests() -> u32 {
    10
}

fn default_window_seconds() -> u64 {
    60
}

fn default_cleanup_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_smtp_host")]
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_smtp_from")]
    pub from: String,
    #[serde(default = "default_smtp_tls")]
    pub use_tls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            from: default_smtp_from(),
            use_tls: default_smtp_tls(),
        }
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_smtp_from() -> String {
    "noreply@tracelens.local".to_string()
}

fn default_smtp_tls() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            info!("Loaded configuration from {}", path.display());
            Ok(config)
        } else {
            info!(
                "Config file {} not found, using defaults",
                path.display()
            );
            Ok(Config::default())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            retention: RetentionConfig::default(),
            limits: LimitsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            smtp: SmtpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
