//! Consent process and record models.
//!
//! The consent gate is a fixed, ordered catalog of consent items. Two of them
//! (data collection and data processing) are required; analysis cannot start
//! until both are granted and active. Every grant/deny/withdraw action is
//! persisted as its own record before any derived state advances.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Version stamped on every consent record
pub const CONSENT_VERSION: &str = "4.3";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConsentType {
    DataCollection,
    DataProcessing,
    AnalysisInference,
    DataRetention,
    ResultStorage,
    ThirdPartySharing,
    MarketingCommunications,
}

impl ConsentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataCollection => "data_collection",
            Self::DataProcessing => "data_processing",
            Self::AnalysisInference => "analysis_inference",
            Self::DataRetention => "data_retention",
            Self::ResultStorage => "result_storage",
            Self::ThirdPartySharing => "third_party_sharing",
            Self::MarketingCommunications => "marketing_communications",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "data_collection" => Some(Self::DataCollection),
            "data_processing" => Some(Self::DataProcessing),
            "analysis_inference" => Some(Self::AnalysisInference),
            "data_retention" => Some(Self::DataRetention),
            "result_storage" => Some(Self::ResultStorage),
            "third_party_sharing" => Some(Self::ThirdPartySharing),
            "marketing_communications" => Some(Self::MarketingCommunications),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConsentStatus {
    Granted,
    Denied,
    Partial,
    Withdrawn,
    Expired,
}

impl ConsentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Denied => "denied",
            Self::Partial => "partial",
            Self::Withdrawn => "withdrawn",
            Self::Expired => "expired",
        }
    }
}

/// One item in the consent catalog shown to the user
#[derive(Debug, Clone, Serialize)]
pub struct ConsentItem {
    pub consent_type: ConsentType,
    pub title: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub default_value: bool,
}

/// The fixed, ordered consent catalog. Order defines the step sequence.
pub fn consent_catalog() -> &'static [ConsentItem] {
    const CATALOG: &[ConsentItem] = &[
        ConsentItem {
            consent_type: ConsentType::DataCollection,
            title: "Public Data Collection",
            description: "Collect publicly visible information from the profile you submit.",
            required: true,
            default_value: false,
        },
        ConsentItem {
            consent_type: ConsentType::DataProcessing,
            title: "Data Processing",
            description: "Process the collected data to produce your analysis.",
            required: true,
            default_value: false,
        },
        ConsentItem {
            consent_type: ConsentType::AnalysisInference,
            title: "AI Inference",
            description: "Derive sentiment, behavioral and economic insights from the data.",
            required: false,
            default_value: false,
        },
        ConsentItem {
            consent_type: ConsentType::DataRetention,
            title: "Temporary Retention",
            description: "Keep your results for 24 hours so you can revisit them.",
            required: false,
            default_value: true,
        },
        ConsentItem {
            consent_type: ConsentType::ResultStorage,
            title: "Result Storage",
            description: "Store the derived scores alongside your account history.",
            required: false,
            default_value: true,
        },
        ConsentItem {
            consent_type: ConsentType::ThirdPartySharing,
            title: "Third-Party Sharing",
            description: "Share anonymized aggregates with research partners.",
            required: false,
            default_value: false,
        },
        ConsentItem {
            consent_type: ConsentType::MarketingCommunications,
            title: "Product Updates",
            description: "Receive occasional product and feature announcements.",
            required: false,
            default_value: false,
        },
    ];
    CATALOG
}

/// Consent types that must be granted before analysis may start
pub const REQUIRED_CONSENTS: &[ConsentType] =
    &[ConsentType::DataCollection, ConsentType::DataProcessing];

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConsentProcess {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,
    pub current_step: i64,
    pub total_steps: i64,
    pub is_complete: i64,
    pub can_proceed: i64,
    pub started_at: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ConsentRecord {
    pub id: String,
    pub process_id: Option<String>,
    pub user_id: String,
    pub consent_type: String,
    pub status: String,
    pub consent_version: String,
    pub granted_at: Option<String>,
    pub withdrawn_at: Option<String>,
    pub expires_at: Option<String>,
    pub withdrawal_reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct InitiateConsentRequest {
    /// Analysis session this consent flow is attached to, if any
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InitiateConsentResponse {
    pub success: bool,
    pub process_id: String,
    pub current_step: i64,
    pub total_steps: i64,
    pub consent_items: Vec<ConsentItem>,
    pub next_item: Option<ConsentItem>,
}

#[derive(Debug, Deserialize)]
pub struct ConsentStepRequest {
    pub process_id: String,
    pub consent_type: String,
    pub granted: bool,
}

#[derive(Debug, Serialize)]
pub struct ConsentStepResponse {
    pub success: bool,
    pub process_complete: bool,
    pub can_proceed: bool,
    /// Set when a required catalog item was just denied
    pub required_consent_denied: bool,
    pub current_step: i64,
    pub total_steps: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_item: Option<ConsentItem>,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawConsentRequest {
    /// Omitted means withdraw every active consent
    pub consent_type: Option<String>,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_order_and_required_items() {
        let catalog = consent_catalog();
        assert_eq!(catalog.len(), 7);
        // Required items come first and match the gate list
        assert_eq!(catalog[0].consent_type, ConsentType::DataCollection);
        assert_eq!(catalog[1].consent_type, ConsentType::DataProcessing);
        let required: Vec<ConsentType> = catalog
            .iter()
            .filter(|i| i.required)
            .map(|i| i.consent_type)
            .collect();
        assert_eq!(required, REQUIRED_CONSENTS);
    }

    #[test]
    fn test_consent_type_parse_roundtrip() {
        for item in consent_catalog() {
            let s = item.consent_type.as_str();
            assert_eq!(ConsentType::parse(s), Some(item.consent_type));
        }
        assert_eq!(ConsentType::parse("nope"), None);
    }
}
