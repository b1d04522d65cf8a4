//! Analysis session models and DTOs.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl AnalysisStatus {
    /// Terminal sessions are never transitioned again by the worker.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Expired)
    }
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl From<String> for AnalysisStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnalysisSession {
    pub id: String,
    pub user_id: String,
    pub target_url: String,
    pub platform: String,
    pub username: Option<String>,
    pub analysis_type: String,
    pub status: String,
    pub progress: i64,
    pub message: Option<String>,
    /// Full results payload as JSON, present once completed
    pub results: Option<String>,
    pub privacy_score: Option<f64>,
    pub privacy_grade: Option<String>,
    pub error_message: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    pub expires_at: String,
}

impl AnalysisSession {
    pub fn status_enum(&self) -> AnalysisStatus {
        AnalysisStatus::from(self.status.clone())
    }

    pub fn is_expired_at(&self, now: &str) -> bool {
        self.expires_at.as_str() <= now
    }
}

/// Per-step log entry recorded by the worker while a job runs
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProcessingStep {
    pub id: i64,
    pub session_id: String,
    pub step: String,
    pub detail: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct StartAnalysisRequest {
    pub url: String,
    #[serde(default = "default_analysis_type")]
    pub analysis_type: String,
}

fn default_analysis_type() -> String {
    "comprehensive".to_string()
}

#[derive(Debug, Serialize)]
pub struct StartAnalysisResponse {
    pub success: bool,
    pub session_id: String,
    pub status: AnalysisStatus,
    pub message: String,
    pub estimated_completion: String,
}

#[derive(Debug, Serialize)]
pub struct AnalysisStatusResponse {
    pub success: bool,
    pub session_id: String,
    pub status: AnalysisStatus,
    pub progress: i64,
    pub message: Option<String>,
    /// Stored failure reason, passed through unmodified
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processing_steps: Vec<ProcessingStep>,
    pub created_at: String,
    pub expires_at: String,
}

#[derive(Debug, Serialize)]
pub struct AnalysisResultsResponse {
    pub success: bool,
    pub session_id: String,
    pub analysis_type: String,
    pub target_url: String,
    pub results: serde_json::Value,
    pub completed_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistoryEntry {
    pub session_id: String,
    pub target_url: String,
    pub analysis_type: String,
    pub status: AnalysisStatus,
    pub privacy_score: Option<f64>,
    pub privacy_grade: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub expires_at: String,
}

impl From<AnalysisSession> for HistoryEntry {
    fn from(s: AnalysisSession) -> Self {
        let status = s.status_enum();
        Self {
            session_id: s.id,
            target_url: s.target_url,
            analysis_type: s.analysis_type,
            status,
            privacy_score: s.privacy_score,
            privacy_grade: s.privacy_grade,
            created_at: s.created_at,
            completed_at: s.completed_at,
            expires_at: s.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub success: bool,
    pub history: Vec<HistoryEntry>,
    pub total_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for s in ["pending", "processing", "completed", "failed", "expired"] {
            assert_eq!(AnalysisStatus::from(s.to_string()).to_string(), s);
        }
        // Unknown statuses fall back to pending
        assert_eq!(
            AnalysisStatus::from("bogus".to_string()),
            AnalysisStatus::Pending
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!AnalysisStatus::Pending.is_terminal());
        assert!(!AnalysisStatus::Processing.is_terminal());
        assert!(AnalysisStatus::Completed.is_terminal());
        assert!(AnalysisStatus::Failed.is_terminal());
        assert!(AnalysisStatus::Expired.is_terminal());
    }
}
