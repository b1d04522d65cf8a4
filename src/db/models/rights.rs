//! Deletion and opt-out request models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeletionScope {
    Complete,
    AnalysisOnly,
    Partial,
}

impl DeletionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::AnalysisOnly => "analysis_only",
            Self::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "complete" => Some(Self::Complete),
            "analysis_only" => Some(Self::AnalysisOnly),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

/// Pipeline stages at which a running analysis may be opted out of
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    DataIngestion,
    SentimentAnalysis,
    BehavioralAnalysis,
    EconomicAnalysis,
    ResultsGeneration,
}

impl ProcessingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataIngestion => "data_ingestion",
            Self::SentimentAnalysis => "sentiment_analysis",
            Self::BehavioralAnalysis => "behavioral_analysis",
            Self::EconomicAnalysis => "economic_analysis",
            Self::ResultsGeneration => "results_generation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data_ingestion" => Some(Self::DataIngestion),
            "sentiment_analysis" => Some(Self::SentimentAnalysis),
            "behavioral_analysis" => Some(Self::BehavioralAnalysis),
            "economic_analysis" => Some(Self::EconomicAnalysis),
            "results_generation" => Some(Self::ResultsGeneration),
            _ => None,
        }
    }

    /// Position in the pipeline, for "this stage and later" selections
    pub fn ordinal(&self) -> usize {
        match self {
            Self::DataIngestion => 0,
            Self::SentimentAnalysis => 1,
            Self::BehavioralAnalysis => 2,
            Self::EconomicAnalysis => 3,
            Self::ResultsGeneration => 4,
        }
    }

    /// All stages at or after this one, in pipeline order
    pub fn and_later(&self) -> Vec<ProcessingStage> {
        [
            Self::DataIngestion,
            Self::SentimentAnalysis,
            Self::BehavioralAnalysis,
            Self::EconomicAnalysis,
            Self::ResultsGeneration,
        ]
        .into_iter()
        .filter(|s| s.ordinal() >= self.ordinal())
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeletionRequest {
    pub id: String,
    pub user_id: String,
    pub deletion_scope: String,
    /// JSON array of data type names, for scope=partial
    pub data_types: Option<String>,
    pub reason: Option<String>,
    pub status: String,
    #[serde(skip_serializing)]
    pub verification_code: String,
    pub retry_count: i64,
    pub requested_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OptOutRequest {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub processing_stage: String,
    pub reason: Option<String>,
    pub status: String,
    pub requested_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RequestDeletionRequest {
    #[serde(default = "default_scope")]
    pub scope: String,
    pub data_types: Option<Vec<String>>,
    pub reason: Option<String>,
}

fn default_scope() -> String {
    "complete".to_string()
}

#[derive(Debug, Serialize)]
pub struct RequestDeletionResponse {
    pub success: bool,
    pub request_id: String,
    pub status: String,
    /// Present only when email delivery is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteDeletionRequest {
    pub request_id: String,
    pub verification_code: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteDeletionResponse {
    pub success: bool,
    pub deleted_items: Vec<String>,
    pub completed_at: String,
}

#[derive(Debug, Deserialize)]
pub struct RequestOptOutRequest {
    pub session_id: String,
    pub stage: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RequestOptOutResponse {
    pub success: bool,
    pub request_id: String,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parse() {
        assert_eq!(DeletionScope::parse("complete"), Some(DeletionScope::Complete));
        assert_eq!(
            DeletionScope::parse("analysis_only"),
            Some(DeletionScope::AnalysisOnly)
        );
        assert_eq!(DeletionScope::parse("everything"), None);
    }

    #[test]
    fn test_stage_parse_roundtrip() {
        for stage in [
            ProcessingStage::DataIngestion,
            ProcessingStage::SentimentAnalysis,
            ProcessingStage::BehavioralAnalysis,
            ProcessingStage::EconomicAnalysis,
            ProcessingStage::ResultsGeneration,
        ] {
            assert_eq!(ProcessingStage::parse(stage.as_str()), Some(stage));
        }
    }
}
