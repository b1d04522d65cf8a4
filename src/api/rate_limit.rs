//! Rate limiting middleware using a sliding window algorithm.
//!
//! Provides per-IP rate limiting with separate tiers for general API
//! endpoints, auth endpoints, and analysis submission.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::error::ApiError;
use crate::config::RateLimitConfig;
use crate::AppState;

/// Rate limit tier for different endpoint types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitTier {
    /// General API endpoints (100 req/min default)
    Api,
    /// Auth endpoints (20 req/min default)
    Auth,
    /// Analysis submission (10 req/min default)
    Analysis,
}

/// Entry in the rate limit tracker
#[derive(Debug, Clone)]
struct RateLimitEntry {
    /// Tokens remaining in the current window
    tokens: u32,
    /// Start of the current window
    window_start: Instant,
    /// Last request time (for sliding window)
    last_request: Instant,
}

impl RateLimitEntry {
    fn new(max_tokens: u32) -> Self {
        let now = Instant::now();
        Self {
            tokens: max_tokens,
            window_start: now,
            last_request: now,
        }
    }
}

/// Thread-safe rate limiter using dashmap
#[derive(Debug)]
pub struct RateLimiter {
    /// Map of (IP, Tier) -> RateLimitEntry
    entries: DashMap<(IpAddr, RateLimitTier), RateLimitEntry>,
    /// Configuration
    config: RateLimitConfig,
    /// Window duration
    window_duration: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter with the given configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: DashMap::new(),
            window_duration: Duration::from_secs(config.window_seconds),
            config,
        }
    }

    /// Check if a request should be allowed and consume a token if so.
    /// Returns Ok(remaining_tokens) if allowed, Err(retry_after_seconds) if rate limited.
    pub fn check_rate_limit(&self, ip: IpAddr, tier: RateLimitTier) -> Result<RateLimitInfo, u64> {
        if !self.config.enabled {
            return Ok(RateLimitInfo {
                remaining: u32::MAX,
                limit: u32::MAX,
                reset_after: 0,
            });
        }

        let max_tokens = self.get_max_tokens(tier);
        let key = (ip, tier);
        let now = Instant::now();

        let mut entry = self
            .entries
            .entry(key)
            .or_insert_with(|| RateLimitEntry::new(max_tokens));

        // Check if we need to reset the window
        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= self.window_duration {
            entry.tokens = max_tokens;
            entry.window_start = now;
        } else {
            // Gradually replenish tokens based on time elapsed since last request
            let since_last = now.duration_since(entry.last_request);
            let replenish_rate = max_tokens as f64 / self.window_duration.as_secs_f64();
            let replenished = (since_last.as_secs_f64() * replenish_rate) as u32;
            entry.tokens = (entry.tokens + replenished).min(max_tokens);
        }

        entry.last_request = now;

        if entry.tokens > 0 {
            entry.tokens -= 1;
            let remaining = entry.tokens;
            let reset_after = self.window_duration.saturating_sub(elapsed).as_secs();
            Ok(RateLimitInfo {
                remaining,
                limit: max_tokens,
                reset_after,
            })
        } else {
            let retry_after = self.window_duration.saturating_sub(elapsed).as_secs().max(1);
            Err(retry_after)
        }
    }

    /// Get the maximum tokens for a given tier
    fn get_max_tokens(&self, tier: RateLimitTier) -> u32 {
        match tier {
            RateLimitTier::Api => self.config.api_requests_per_window,
            RateLimitTier::Auth => self.config.auth_requests_per_window,
            RateLimitTier::Analysis => self.config.analysis_requests_per_window,
        }
    }

    /// Clean up expired entries to prevent memory leaks
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let expiry = self.window_duration * 2;

        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) < expiry);
    }

    /// Get the number of tracked entries (for monitoring)
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Information about rate limit status
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    /// Remaining requests in the current window
    pub remaining: u32,
    /// Maximum requests per window
    pub limit: u32,
    /// Seconds until the window resets
    pub reset_after: u64,
}

/// Extract client IP from request headers
pub fn extract_client_ip(request: &Request<Body>) -> IpAddr {
    // Check X-Forwarded-For header first (for reverse proxy setups)
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(ip_str) = value.split(',').next() {
                if let Ok(ip) = ip_str.trim().parse::<IpAddr>() {
                    return ip;
                }
            }
        }
    }

    // Check X-Real-IP header
    if let Some(real_ip) = request.headers().get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return ip;
            }
        }
    }

    IpAddr::from([127, 0, 0, 1])
}

/// Rate limiting middleware for general API endpoints
pub async fn rate_limit_api(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    rate_limit_with_tier(state, request, next, RateLimitTier::Api).await
}

/// Rate limiting middleware for auth endpoints
pub async fn rate_limit_auth(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    rate_limit_with_tier(state, request, next, RateLimitTier::Auth).await
}

/// Rate limiting middleware for analysis submission
pub async fn rate_limit_analysis(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, Response> {
    rate_limit_with_tier(state, request, next, RateLimitTier::Analysis).await
}

/// Core rate limiting logic
async fn rate_limit_with_tier(
    state: Arc<AppState>,
    request: Request<Body>,
    next: Next,
    tier: RateLimitTier,
) -> Result<Response, Response> {
    let ip = extract_client_ip(&request);

    match state.rate_limiter.check_rate_limit(ip, tier) {
        Ok(info) => {
            let response = next.run(request).await;

            // Add rate limit headers to successful responses
            let (mut parts, body) = response.into_parts();
            if let Ok(value) = info.limit.to_string().parse() {
                parts.headers.insert("X-RateLimit-Limit", value);
            }
            if let Ok(value) = info.remaining.to_string().parse() {
                parts.headers.insert("X-RateLimit-Remaining", value);
            }
            if let Ok(value) = info.reset_after.to_string().parse() {
                parts.headers.insert("X-RateLimit-Reset", value);
            }

            Ok(Response::from_parts(parts, body))
        }
        Err(retry_after) => {
            let error = ApiError::rate_limited(format!(
                "Rate limit exceeded. Try again in {} seconds.",
                retry_after
            ));
            let (mut parts, body) = error.into_response().into_parts();
            if let Ok(value) = retry_after.to_string().parse() {
                parts.headers.insert("Retry-After", value);
            }
            Err(Response::from_parts(parts, body))
        }
    }
}

/// Spawn a background task to periodically clean up expired rate limit entries
pub fn spawn_cleanup_task(rate_limiter: Arc<RateLimiter>, cleanup_interval_secs: u64) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(cleanup_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            rate_limiter.cleanup_expired();
            tracing::debug!(
                "Rate limiter cleanup complete, {} entries remaining",
                rate_limiter.entry_count()
            );
        }
    });
}
