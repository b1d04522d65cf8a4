//! Retention maintenance.
//!
//! The hourly sweep enforces the data lifecycle:
//! - analysis sessions past their TTL are soft-expired
//! - soft-expired sessions past the grace window are hard-deleted
//! - expired auth sessions are removed
//! - granted consents past their expiry are marked expired
//!
//! Every step is a guarded bulk update keyed on the current state, so a sweep
//! that overlaps a previous run (or is re-run immediately) changes nothing the
//! earlier run already handled.
//!
//! A separate daily deep-cleanup prunes old audit logs on a cron schedule.

use crate::api::metrics::SESSIONS_EXPIRED_TOTAL;
use crate::config::RetentionConfig;
use crate::DbPool;
use anyhow::Result;
use cron::Schedule;
use metrics::counter;
use std::str::FromStr;
use tokio::time::{interval, Duration};

pub struct RetentionSweeper {
    db: DbPool,
    config: RetentionConfig,
}

/// Statistics from one sweep cycle
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub sessions_expired: u64,
    pub sessions_deleted: u64,
    pub auth_sessions_removed: u64,
    pub consents_expired: u64,
}

impl RetentionSweeper {
    pub fn new(db: DbPool, config: RetentionConfig) -> Self {
        Self { db, config }
    }

    /// Run a single sweep cycle
    pub async fn run_sweep(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        let now = chrono::Utc::now();
        let now_str = now.to_rfc3339();

        // Soft-expire: any session past its TTL leaves the active pool,
        // whatever state the worker left it in
        let expired = sqlx::query(
            r#"
            UPDATE analysis_sessions
            SET status = 'expired', results = NULL, updated_at = ?
            WHERE expires_at <= ? AND status != 'expired'
            "#,
        )
        .bind(&now_str)
        .bind(&now_str)
        .execute(&self.db)
        .await?;
        stats.sessions_expired = expired.rows_affected();

        // Hard-delete sessions whose grace window has also elapsed
        let grace_cutoff =
            (now - chrono::Duration::hours(self.config.delete_grace_hours)).to_rfc3339();
        sqlx::query(
            r#"
            DELETE FROM processing_steps
            WHERE session_id IN (
                SELECT id FROM analysis_sessions
                WHERE status = 'expired' AND expires_at <= ?
            )
            "#,
        )
        .bind(&grace_cutoff)
        .execute(&self.db)
        .await?;
        let deleted = sqlx::query(
            "DELETE FROM analysis_sessions WHERE status = 'expired' AND expires_at <= ?",
        )
        .bind(&grace_cutoff)
        .execute(&self.db)
        .await?;
        stats.sessions_deleted = deleted.rows_affected();

        // Expired login sessions
        let auth_removed = sqlx::query("DELETE FROM auth_sessions WHERE expires_at <= ?")
            .bind(&now_str)
            .execute(&self.db)
            .await?;
        stats.auth_sessions_removed = auth_removed.rows_affected();

        // Lapsed consents
        let consents = sqlx::query(
            r#"
            UPDATE consent_records
            SET status = 'expired'
            WHERE status = 'granted' AND expires_at IS NOT NULL AND expires_at <= ?
            "#,
        )
        .bind(&now_str)
        .execute(&self.db)
        .await?;
        stats.consents_expired = consents.rows_affected();

        if stats.sessions_expired > 0 {
            counter!(SESSIONS_EXPIRED_TOTAL).increment(stats.sessions_expired);
        }

        tracing::info!(
            expired = stats.sessions_expired,
            deleted = stats.sessions_deleted,
            auth_removed = stats.auth_sessions_removed,
            consents_expired = stats.consents_expired,
            "Retention sweep completed"
        );

        Ok(stats)
    }

    /// Prune audit logs older than the retention horizon
    pub async fn run_deep_cleanup(&self) -> Result<u64> {
        let cutoff = (chrono::Utc::now()
            - chrono::Duration::days(self.config.audit_retention_days))
        .to_rfc3339();

        let pruned = sqlx::query("DELETE FROM audit_logs WHERE created_at <= ?")
            .bind(&cutoff)
            .execute(&self.db)
            .await?;

        tracing::info!(pruned = pruned.rows_affected(), "Deep cleanup completed");
        Ok(pruned.rows_affected())
    }
}

/// Spawn the periodic sweep task
pub fn spawn_sweep_task(db: DbPool, config: RetentionConfig) {
    let interval_secs = config.sweep_interval_seconds;
    tracing::info!(
        interval_secs = interval_secs,
        ttl_hours = config.analysis_ttl_hours,
        "Starting retention sweep task"
    );

    let sweeper = RetentionSweeper::new(db, config);

    tokio::spawn(async move {
        // Short initial delay so startup isn't competing with the sweep
        tokio::time::sleep(Duration::from_secs(30)).await;

        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = sweeper.run_sweep().await {
                tracing::error!(error = %e, "Retention sweep failed");
            }
        }
    });
}

/// Spawn the daily deep-cleanup task on its cron schedule
pub fn spawn_deep_cleanup_task(db: DbPool, config: RetentionConfig) {
    let schedule = match Schedule::from_str(&config.deep_cleanup_schedule) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(
                schedule = %config.deep_cleanup_schedule,
                error = %e,
                "Invalid deep cleanup schedule, task not started"
            );
            return;
        }
    };

    let sweeper = RetentionSweeper::new(db, config);

    tokio::spawn(async move {
        loop {
            let next = match schedule.upcoming(chrono::Utc).next() {
                Some(next) => next,
                None => break,
            };
            let wait = (next - chrono::Utc::now()).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            // Full sweep first, then the slow audit-log prune
            if let Err(e) = sweeper.run_sweep().await {
                tracing::error!(error = %e, "Pre-cleanup sweep failed");
            }
            if let Err(e) = sweeper.run_deep_cleanup().await {
                tracing::error!(error = %e, "Deep cleanup failed");
            }
        }
    });
}
