//! Background analysis engine.
//!
//! Jobs arrive over an mpsc channel and are processed concurrently, one task
//! per job. All status transitions are guarded updates keyed on the current
//! status, so a job delivered twice (or raced by an opt-out) never moves a
//! session out of a terminal state.

pub mod analyzer;
pub mod maintenance;

use metrics::counter;
use tokio::sync::mpsc;

use crate::api::metrics::{ANALYSES_COMPLETED_TOTAL, ANALYSES_FAILED_TOTAL};
use crate::db::models::rights::ProcessingStage;
use crate::DbPool;

/// A queued analysis job
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    pub session_id: String,
}

/// Pipeline stages in execution order, with the progress they report
const PIPELINE: &[(ProcessingStage, i64, &str)] = &[
    (ProcessingStage::DataIngestion, 10, "Collecting public profile data"),
    (ProcessingStage::SentimentAnalysis, 30, "Analyzing sentiment signals"),
    (ProcessingStage::BehavioralAnalysis, 55, "Analyzing behavioral patterns"),
    (ProcessingStage::EconomicAnalysis, 80, "Estimating economic indicators"),
    (ProcessingStage::ResultsGeneration, 100, "Generating results"),
];

/// Simulated per-stage work duration
const STAGE_DURATION_MS: u64 = 400;

pub struct AnalysisEngine {
    db: DbPool,
    rx: mpsc::Receiver<AnalysisJob>,
}

impl AnalysisEngine {
    pub fn new(db: DbPool, rx: mpsc::Receiver<AnalysisJob>) -> Self {
        Self { db, rx }
    }

    pub async fn run(mut self) {
        tracing::info!("Analysis engine started");

        while let Some(job) = self.rx.recv().await {
            tracing::info!(session = %job.session_id, "Processing analysis job");

            let db = self.db.clone();
            tokio::spawn(async move {
                if let Err(e) = process_job(&db, &job.session_id).await {
                    tracing::error!(session = %job.session_id, error = %e, "Analysis job failed");
                    let _ = mark_failed(&db, &job.session_id, &e.to_string()).await;
                }
            });
        }

        tracing::info!("Analysis engine stopped");
    }
}

/// Run one analysis job to completion
pub(crate) async fn process_job(db: &DbPool, session_id: &str) -> anyhow::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();

    // Guarded claim: only a pending session becomes processing
    let claimed = sqlx::query(
        "UPDATE analysis_sessions SET status = 'processing', message = 'Analysis in progress', updated_at = ? WHERE id = ? AND status = 'pending'",
    )
    .bind(&now)
    .bind(session_id)
    .execute(db)
    .await?;

    if claimed.rows_affected() == 0 {
        tracing::warn!(session = %session_id, "Skipping job: session is not pending");
        return Ok(());
    }

    let session: Option<(String, String, Option<String>, String)> = sqlx::query_as(
        "SELECT target_url, platform, username, analysis_type FROM analysis_sessions WHERE id = ?",
    )
    .bind(session_id)
    .fetch_optional(db)
    .await?;
    let (target_url, platform, username, analysis_type) =
        session.ok_or_else(|| anyhow::anyhow!("Session disappeared mid-run"))?;

    for (stage, progress, detail) in PIPELINE {
        tokio::time::sleep(std::time::Duration::from_millis(STAGE_DURATION_MS)).await;

        let now = chrono::Utc::now().to_rfc3339();
        // The guarded update also acts as the opt-out check: a session that
        // was failed while we slept takes no further writes.
        let updated = sqlx::query(
            "UPDATE analysis_sessions SET progress = ?, message = ?, updated_at = ? WHERE id = ? AND status = 'processing'",
        )
        .bind(progress)
        .bind(detail)
        .bind(&now)
        .bind(session_id)
        .execute(db)
        .await?;

        if updated.rows_affected() == 0 {
            tracing::info!(session = %session_id, stage = stage.as_str(), "Analysis halted mid-pipeline");
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO processing_steps (session_id, step, detail, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(stage.as_str())
        .bind(detail)
        .bind(&now)
        .execute(db)
        .await?;
    }

    let results = analyzer::build_results(
        &analysis_type,
        &target_url,
        &platform,
        username.as_deref(),
    );
    let results_json = results.payload.to_string();
    let now = chrono::Utc::now().to_rfc3339();

    let completed = sqlx::query(
        r#"
        UPDATE analysis_sessions
        SET status = 'completed', progress = 100, message = 'Analysis complete',
            results = ?, privacy_score = ?, privacy_grade = ?,
            completed_at = ?, updated_at = ?
        WHERE id = ? AND status = 'processing'
        "#,
    )
    .bind(&results_json)
    .bind(results.privacy_score)
    .bind(&results.privacy_grade)
    .bind(&now)
    .bind(&now)
    .bind(session_id)
    .execute(db)
    .await?;

    if completed.rows_affected() == 0 {
        tracing::info!(session = %session_id, "Analysis halted before completion");
        return Ok(());
    }

    // Bump the owner's usage counters for today
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
    sqlx::query(
        r#"
        UPDATE users
        SET daily_usage_count = CASE WHEN usage_day = ? THEN daily_usage_count + 1 ELSE 1 END,
            usage_day = ?,
            total_analyses = total_analyses + 1,
            last_analysis_at = ?,
            updated_at = ?
        WHERE id = (SELECT user_id FROM analysis_sessions WHERE id = ?)
        "#,
    )
    .bind(&today)
    .bind(&today)
    .bind(&now)
    .bind(&now)
    .bind(session_id)
    .execute(db)
    .await?;

    counter!(ANALYSES_COMPLETED_TOTAL).increment(1);
    tracing::info!(session = %session_id, "Analysis completed");

    Ok(())
}

/// Recover sessions left behind by an earlier run of the service.
///
/// Sessions that were mid-pipeline when the process died are failed (their
/// in-memory pipeline state is gone), while still-pending sessions are put
/// back on the queue. Returns (requeued, failed) counts.
pub async fn recover_interrupted(
    db: &DbPool,
    tx: &mpsc::Sender<AnalysisJob>,
) -> Result<(usize, usize), sqlx::Error> {
    let now = chrono::Utc::now().to_rfc3339();
    let orphaned = sqlx::query(
        "UPDATE analysis_sessions SET status = 'failed', error_message = ?, updated_at = ? WHERE status = 'processing'",
    )
    .bind("Analysis interrupted by service restart")
    .bind(&now)
    .execute(db)
    .await?;

    let pending: Vec<(String,)> =
        sqlx::query_as("SELECT id FROM analysis_sessions WHERE status = 'pending'")
            .fetch_all(db)
            .await?;
    let mut requeued = 0;
    for (session_id,) in pending {
        if tx.send(AnalysisJob { session_id }).await.is_err() {
            break;
        }
        requeued += 1;
    }

    if requeued > 0 || orphaned.rows_affected() > 0 {
        tracing::info!(
            requeued,
            failed = orphaned.rows_affected(),
            "Recovered interrupted analysis sessions"
        );
    }
    Ok((requeued, orphaned.rows_affected() as usize))
}

/// Mark a session as failed, unless it already reached a terminal state
async fn mark_failed(db: &DbPool, session_id: &str, error: &str) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().to_rfc3339();
    let updated = sqlx::query(
        "UPDATE analysis_sessions SET status = 'failed', error_message = ?, updated_at = ? WHERE id = ? AND status IN ('pending', 'processing')",
    )
    .bind(error)
    .bind(&now)
    .bind(session_id)
    .execute(db)
    .await?;

    if updated.rows_affected() > 0 {
        counter!(ANALYSES_FAILED_TOTAL).increment(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn insert_session(pool: &DbPool, id: &str, status: &str) {
        let now = chrono::Utc::now();
        let expires = (now + chrono::Duration::hours(24)).to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, name, verified, is_active,
                               subscription_tier, privacy_level, daily_usage_count,
                               total_analyses, created_at, updated_at)
            VALUES ('u1', 'u1@test.local', 'x', 'U1', 1, 1, 'free', 'standard', 0, 0, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(pool)
        .await
        .unwrap();

        sqlx::query(
            r#"
            INSERT INTO analysis_sessions (id, user_id, target_url, platform, username,
                                           analysis_type, status, progress, created_at,
                                           updated_at, expires_at)
            VALUES (?, 'u1', 'https://github.com/janedoe', 'github', 'janedoe',
                    'comprehensive', ?, 0, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .bind(&expires)
        .execute(pool)
        .await
        .unwrap();
    }

    async fn session_status(pool: &DbPool, id: &str) -> (String, i64) {
        sqlx::query_as("SELECT status, progress FROM analysis_sessions WHERE id = ?")
            .bind(id)
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_pending_job_runs_to_completion() {
        let pool = db::init_in_memory().await.unwrap();
        insert_session(&pool, "s1", "pending").await;

        process_job(&pool, "s1").await.unwrap();

        let (status, progress) = session_status(&pool, "s1").await;
        assert_eq!(status, "completed");
        assert_eq!(progress, 100);

        let steps: Vec<(String,)> =
            sqlx::query_as("SELECT step FROM processing_steps WHERE session_id = 's1' ORDER BY id")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(steps.len(), PIPELINE.len());
        assert_eq!(steps[0].0, "data_ingestion");
        assert_eq!(steps.last().unwrap().0, "results_generation");
    }

    #[tokio::test]
    async fn test_terminal_session_is_not_reprocessed() {
        let pool = db::init_in_memory().await.unwrap();
        insert_session(&pool, "s2", "completed").await;

        process_job(&pool, "s2").await.unwrap();

        let (status, progress) = session_status(&pool, "s2").await;
        assert_eq!(status, "completed");
        assert_eq!(progress, 0, "terminal session must not be touched");
    }

    #[tokio::test]
    async fn test_completion_bumps_usage_counters() {
        let pool = db::init_in_memory().await.unwrap();
        insert_session(&pool, "s3", "pending").await;

        process_job(&pool, "s3").await.unwrap();

        let (daily, total): (i64, i64) =
            sqlx::query_as("SELECT daily_usage_count, total_analyses FROM users WHERE id = 'u1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(daily, 1);
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_restart_recovery_requeues_pending_and_fails_processing() {
        let pool = db::init_in_memory().await.unwrap();
        insert_session(&pool, "s-pending", "pending").await;
        insert_session(&pool, "s-stuck", "processing").await;
        insert_session(&pool, "s-done", "completed").await;

        let (tx, mut rx) = mpsc::channel(10);
        let (requeued, failed) = recover_interrupted(&pool, &tx).await.unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(failed, 1);

        let job = rx.try_recv().unwrap();
        assert_eq!(job.session_id, "s-pending");
        assert!(rx.try_recv().is_err(), "only pending sessions are requeued");

        let (status, _) = session_status(&pool, "s-stuck").await;
        assert_eq!(status, "failed");
        let error: (Option<String>,) =
            sqlx::query_as("SELECT error_message FROM analysis_sessions WHERE id = 's-stuck'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(
            error.0.as_deref(),
            Some("Analysis interrupted by service restart")
        );

        let (status, _) = session_status(&pool, "s-done").await;
        assert_eq!(status, "completed");
    }

    #[tokio::test]
    async fn test_mark_failed_skips_terminal_sessions() {
        let pool = db::init_in_memory().await.unwrap();
        insert_session(&pool, "s4", "completed").await;

        mark_failed(&pool, "s4", "boom").await.unwrap();

        let (status, _) = session_status(&pool, "s4").await;
        assert_eq!(status, "completed");
    }
}
