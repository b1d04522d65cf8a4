//! Result synthesis for completed analyses.
//!
//! Scores are derived deterministically from a SHA-256 digest of the target
//! URL, so repeated analyses of the same profile produce identical results.

use serde_json::json;
use sha2::{Digest, Sha256};

/// Final output of an analysis run
#[derive(Debug, Clone)]
pub struct AnalysisResults {
    pub payload: serde_json::Value,
    pub privacy_score: Option<f64>,
    pub privacy_grade: Option<String>,
}

/// Deterministic pseudo-random bytes for a target URL
fn seed_bytes(target_url: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(target_url.as_bytes());
    hasher.finalize().into()
}

/// Map a seed byte into [min, max] with one decimal place
fn scaled(byte: u8, min: f64, max: f64) -> f64 {
    let value = min + (byte as f64 / 255.0) * (max - min);
    (value * 10.0).round() / 10.0
}

/// Letter grade for a 0-10 privacy score
fn grade_for_score(score: f64) -> &'static str {
    match score {
        s if s >= 9.0 => "A+",
        s if s >= 8.0 => "A",
        s if s >= 7.0 => "B",
        s if s >= 6.0 => "C",
        s if s >= 5.0 => "D",
        _ => "F",
    }
}

fn privacy_section(seed: &[u8; 32]) -> (f64, &'static str, serde_json::Value) {
    let score = scaled(seed[0], 4.0, 9.5);
    let grade = grade_for_score(score);
    let exposure_count = (seed[1] % 8) as i64 + 1;

    let section = json!({
        "privacy_score": score,
        "privacy_grade": grade,
        "exposed_data_points": exposure_count,
        "risk_factors": risk_factors(seed, exposure_count),
        "recommendations": [
            "Review which profile fields are publicly visible",
            "Limit location details in posts and bio",
            "Audit third-party app permissions"
        ]
    });
    (score, grade, section)
}

fn risk_factors(seed: &[u8; 32], count: i64) -> Vec<&'static str> {
    const FACTORS: &[&str] = &[
        "public_email",
        "location_disclosure",
        "employer_visible",
        "posting_schedule_pattern",
        "cross_platform_linkage",
        "photo_metadata",
        "contact_graph_exposure",
        "historical_posts_public",
    ];
    FACTORS
        .iter()
        .enumerate()
        .filter(|(i, _)| seed[2 + i] % 3 == 0)
        .map(|(_, f)| *f)
        .take(count as usize)
        .collect()
}

fn sentiment_section(seed: &[u8; 32]) -> serde_json::Value {
    let positive = scaled(seed[10], 0.2, 0.7);
    let negative = scaled(seed[11], 0.0, 1.0 - positive).min(1.0 - positive);
    let neutral = ((1.0 - positive - negative) * 10.0).round() / 10.0;
    let overall = if positive > negative + 0.2 {
        "positive"
    } else if negative > positive + 0.2 {
        "negative"
    } else {
        "neutral"
    };

    json!({
        "overall_sentiment": overall,
        "sentiment_distribution": {
            "positive": positive,
            "negative": negative,
            "neutral": neutral.max(0.0)
        },
        "emotional_tone": (["informative", "casual", "professional"][(seed[12] % 3) as usize]),
        "confidence": scaled(seed[13], 0.6, 0.95)
    })
}

fn behavioral_section(seed: &[u8; 32]) -> serde_json::Value {
    json!({
        "activity_level": (["low", "moderate", "high"][(seed[14] % 3) as usize]),
        "posting_frequency_per_week": (seed[15] % 20) as i64 + 1,
        "peak_activity_hours": format!("{:02}:00-{:02}:00", seed[16] % 24, (seed[16] % 24 + 3) % 24),
        "engagement_style": (["broadcaster", "conversationalist", "observer"][(seed[17] % 3) as usize]),
        "consistency_score": scaled(seed[18], 0.3, 0.9)
    })
}

fn platform_section(platform: &str, seed: &[u8; 32]) -> serde_json::Value {
    match platform {
        "linkedin" => json!({
            "professional_network_size": (["small", "medium", "large"][(seed[23] % 3) as usize]),
            "endorsement_activity": scaled(seed[24], 0.1, 0.9)
        }),
        "github" => json!({
            "contribution_cadence": (["sporadic", "steady", "intense"][(seed[23] % 3) as usize]),
            "public_repo_exposure": scaled(seed[24], 0.2, 1.0)
        }),
        "twitter" => json!({
            "reply_ratio": scaled(seed[23], 0.1, 0.8),
            "thread_usage": seed[24] % 2 == 0
        }),
        _ => json!({
            "visibility": (["limited", "moderate", "broad"][(seed[23] % 3) as usize])
        }),
    }
}

fn economic_section(seed: &[u8; 32]) -> serde_json::Value {
    json!({
        "estimated_influence_tier": (["nano", "micro", "mid", "macro"][(seed[19] % 4) as usize]),
        "commercial_content_ratio": scaled(seed[20], 0.0, 0.4),
        "brand_affinity_signals": (seed[21] % 6) as i64,
        "monetization_indicators": seed[22] % 2 == 0
    })
}

/// Build the results payload for a finished analysis.
///
/// The sections included depend on the analysis type; `comprehensive` carries
/// all of them, `basic` only a summary.
pub fn build_results(
    analysis_type: &str,
    target_url: &str,
    platform: &str,
    username: Option<&str>,
) -> AnalysisResults {
    let seed = seed_bytes(target_url);
    let (score, grade, privacy) = privacy_section(&seed);

    let metadata = json!({
        "platform": platform,
        "username": username,
        "target_url": target_url,
        "analysis_type": analysis_type,
        "analyzed_at": chrono::Utc::now().to_rfc3339(),
        "engine_version": env!("CARGO_PKG_VERSION")
    });

    let (payload, privacy_score, privacy_grade) = match analysis_type {
        "privacy_only" => (
            json!({
                "privacy": privacy,
                "metadata": metadata
            }),
            Some(score),
            Some(grade.to_string()),
        ),
        "sentiment" => (
            json!({
                "sentiment": sentiment_section(&seed),
                "metadata": metadata
            }),
            None,
            None,
        ),
        "basic" => (
            json!({
                "summary": {
                    "privacy_score": score,
                    "privacy_grade": grade,
                    "overall_sentiment": sentiment_section(&seed)["overall_sentiment"]
                },
                "metadata": metadata
            }),
            Some(score),
            Some(grade.to_string()),
        ),
        // comprehensive and anything else that slipped past validation
        _ => (
            json!({
                "privacy": privacy,
                "sentiment": sentiment_section(&seed),
                "behavioral": behavioral_section(&seed),
                "economic": economic_section(&seed),
                "platform_specific": platform_section(platform, &seed),
                "metadata": metadata
            }),
            Some(score),
            Some(grade.to_string()),
        ),
    };

    AnalysisResults {
        payload,
        privacy_score,
        privacy_grade,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_are_deterministic() {
        let a = build_results("comprehensive", "https://github.com/janedoe", "github", Some("janedoe"));
        let b = build_results("comprehensive", "https://github.com/janedoe", "github", Some("janedoe"));
        assert_eq!(a.privacy_score, b.privacy_score);
        assert_eq!(a.payload["privacy"], b.payload["privacy"]);
        assert_eq!(a.payload["sentiment"], b.payload["sentiment"]);
    }

    #[test]
    fn test_comprehensive_has_all_sections() {
        let r = build_results("comprehensive", "https://github.com/janedoe", "github", None);
        for section in [
            "privacy",
            "sentiment",
            "behavioral",
            "economic",
            "platform_specific",
            "metadata",
        ] {
            assert!(r.payload.get(section).is_some(), "missing {}", section);
        }
        assert!(r.privacy_score.is_some());
        assert!(r.privacy_grade.is_some());
    }

    #[test]
    fn test_sentiment_only_omits_privacy_score() {
        let r = build_results("sentiment", "https://github.com/janedoe", "github", None);
        assert!(r.privacy_score.is_none());
        assert!(r.payload.get("privacy").is_none());
        assert!(r.payload.get("sentiment").is_some());
    }

    #[test]
    fn test_grade_boundaries() {
        assert_eq!(grade_for_score(9.5), "A+");
        assert_eq!(grade_for_score(8.0), "A");
        assert_eq!(grade_for_score(7.2), "B");
        assert_eq!(grade_for_score(6.1), "C");
        assert_eq!(grade_for_score(5.0), "D");
        assert_eq!(grade_for_score(4.9), "F");
    }

    #[test]
    fn test_score_in_range() {
        for url in ["https://x.com/a", "https://x.com/b", "https://x.com/c"] {
            let r = build_results("comprehensive", url, "twitter", None);
            let score = r.privacy_score.unwrap();
            assert!((4.0..=9.5).contains(&score), "{} out of range", score);
        }
    }

    #[test]
    fn test_sentiment_distribution_sums_to_one_ish() {
        let r = build_results("sentiment", "https://github.com/janedoe", "github", None);
        let dist = &r.payload["sentiment"]["sentiment_distribution"];
        let sum = dist["positive"].as_f64().unwrap()
            + dist["negative"].as_f64().unwrap()
            + dist["neutral"].as_f64().unwrap();
        assert!((0.8..=1.2).contains(&sum), "distribution sum {}", sum);
    }
}
