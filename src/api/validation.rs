//! Input validation for API requests.
//!
//! Social media URL validation happens entirely before any session row is
//! created or any job is queued: an empty or malformed URL never reaches the
//! analysis pipeline.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Regex for basic URL shape (scheme + host)
    static ref URL_REGEX: Regex = Regex::new(
        r"^https?://[a-zA-Z0-9][-a-zA-Z0-9.]*(:\d+)?(/[^\s]*)?$"
    ).unwrap();

    /// Regex for validating email addresses
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$"
    ).unwrap();

    /// Platform-specific profile URL patterns, checked after the domain test
    static ref PLATFORM_PATTERNS: Vec<(&'static str, Regex)> = vec![
        ("linkedin", Regex::new(r"(?i)^https?://(www\.)?linkedin\.com/(in|pub)/[\w\-%.]+/?").unwrap()),
        ("twitter", Regex::new(r"(?i)^https?://(www\.)?(twitter\.com|x\.com)/[\w\-]+/?").unwrap()),
        ("github", Regex::new(r"(?i)^https?://(www\.)?github\.com/[\w\-]+/?").unwrap()),
        ("instagram", Regex::new(r"(?i)^https?://(www\.)?instagram\.com/[\w\-.]+/?").unwrap()),
        ("facebook", Regex::new(r"(?i)^https?://(www\.)?facebook\.com/[\w\-.]+/?").unwrap()),
        ("tiktok", Regex::new(r"(?i)^https?://(www\.)?tiktok\.com/@[\w\-.]+/?").unwrap()),
        ("youtube", Regex::new(r"(?i)^https?://(www\.)?youtube\.com/(c/|channel/|user/|@)[\w\-]+/?").unwrap()),
        ("reddit", Regex::new(r"(?i)^https?://(www\.)?reddit\.com/(u|user)/[\w\-]+/?").unwrap()),
        ("pinterest", Regex::new(r"(?i)^https?://(www\.)?pinterest\.com/[\w\-]+/?").unwrap()),
        ("snapchat", Regex::new(r"(?i)^https?://(www\.)?snapchat\.com/add/[\w\-]+/?").unwrap()),
    ];
}

/// Domains accepted as social media platforms
const SOCIAL_DOMAINS: &[(&str, &str)] = &[
    ("linkedin.com", "linkedin"),
    ("twitter.com", "twitter"),
    ("x.com", "twitter"),
    ("github.com", "github"),
    ("instagram.com", "instagram"),
    ("facebook.com", "facebook"),
    ("tiktok.com", "tiktok"),
    ("youtube.com", "youtube"),
    ("reddit.com", "reddit"),
    ("pinterest.com", "pinterest"),
    ("snapchat.com", "snapchat"),
];

/// Query parameters stripped during URL normalization
const TRACKING_PARAMS: &[&str] = &["utm_source", "utm_medium", "utm_campaign", "fbclid", "gclid"];

/// Outcome of validating a social media URL
#[derive(Debug, Clone)]
pub struct ValidatedUrl {
    pub cleaned_url: String,
    pub platform: String,
    pub username: Option<String>,
}

/// Names of all supported platforms, for structured rejection responses
pub fn supported_platforms() -> Vec<&'static str> {
    PLATFORM_PATTERNS.iter().map(|(name, _)| *name).collect()
}

/// Validate a social media profile URL.
///
/// Returns the normalized URL plus detected platform and username, or a
/// user-facing error message.
pub fn validate_social_url(url: &str) -> Result<ValidatedUrl, String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err("Social media URL is required".to_string());
    }
    if trimmed.len() > 2048 {
        return Err("URL is too long (max 2048 characters)".to_string());
    }

    let cleaned = clean_url(trimmed);

    if !URL_REGEX.is_match(&cleaned) {
        return Err(
            "Invalid URL format. Please enter a valid URL starting with http:// or https://"
                .to_string(),
        );
    }

    let domain = extract_domain(&cleaned);
    let platform = match SOCIAL_DOMAINS.iter().find(|(d, _)| *d == domain) {
        Some((_, platform)) => *platform,
        None => {
            return Err(format!(
                "URL must be from a supported social media platform. Domain \"{}\" is not supported.",
                domain
            ));
        }
    };

    // Prefer the pattern match (it also validates the path shape); fall back
    // to the domain-derived platform for recognized domains with odd paths.
    let matched = PLATFORM_PATTERNS
        .iter()
        .find(|(_, re)| re.is_match(&cleaned))
        .map(|(name, _)| *name)
        .unwrap_or(platform);

    let username = extract_username(&cleaned, matched);

    Ok(ValidatedUrl {
        cleaned_url: cleaned,
        platform: matched.to_string(),
        username,
    })
}

/// Validate an email address
pub fn validate_email(email: &str) -> Result<(), String> {
    if email.is_empty() {
        return Err("Email is required".to_string());
    }
    if email.len() > 254 {
        return Err("Email is too long".to_string());
    }
    if !EMAIL_REGEX.is_match(email) {
        return Err("Invalid email format".to_string());
    }
    Ok(())
}

/// Normalize a URL: default to https and strip tracking parameters
fn clean_url(url: &str) -> String {
    let mut url = url.to_string();
    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("https://{}", url);
    }

    if let Some(query_start) = url.find('?') {
        let (base, query) = url.split_at(query_start);
        let kept: Vec<&str> = query[1..]
            .split('&')
            .filter(|param| {
                !TRACKING_PARAMS
                    .iter()
                    .any(|track| param.starts_with(&format!("{}=", track)))
            })
            .collect();
        url = if kept.is_empty() {
            base.to_string()
        } else {
            format!("{}?{}", base, kept.join("&"))
        };
    }

    url
}

/// Extract the host from a URL, lowercased and without the www prefix
fn extract_domain(url: &str) -> String {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_lowercase();
    host.strip_prefix("www.").unwrap_or(&host).to_string()
}

/// Extract a username from a profile URL, platform-aware
fn extract_username(url: &str, platform: &str) -> Option<String> {
    let without_scheme = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let path = without_scheme.splitn(2, '/').nth(1).unwrap_or("");
    let parts: Vec<&str> = path
        .split(['?', '#'])
        .next()
        .unwrap_or("")
        .split('/')
        .filter(|p| !p.is_empty())
        .collect();

    match platform {
        "linkedin" => {
            // /in/username or /pub/username
            if parts.len() >= 2 && (parts[0] == "in" || parts[0] == "pub") {
                return Some(parts[1].to_string());
            }
        }
        "reddit" => {
            // /u/username or /user/username
            if parts.len() >= 2 && (parts[0] == "u" || parts[0] == "user") {
                return Some(parts[1].to_string());
            }
        }
        "tiktok" => {
            if let Some(first) = parts.first() {
                if let Some(name) = first.strip_prefix('@') {
                    return Some(name.to_string());
                }
            }
        }
        "youtube" => {
            if parts.len() >= 2 && (parts[0] == "c" || parts[0] == "user" || parts[0] == "channel")
            {
                return Some(parts[1].to_string());
            }
            if let Some(first) = parts.first() {
                if let Some(name) = first.strip_prefix('@') {
                    return Some(name.to_string());
                }
            }
        }
        _ => {}
    }

    // Generic fallback: first path segment, with a leading @ stripped
    parts
        .first()
        .map(|p| p.trim_start_matches('@').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_url_rejected() {
        assert!(validate_social_url("").is_err());
        assert!(validate_social_url("   ").is_err());
    }

    #[test]
    fn test_malformed_url_rejected() {
        assert!(validate_social_url("not a url").is_err());
        assert!(validate_social_url("http://").is_err());
    }

    #[test]
    fn test_unsupported_domain_rejected() {
        let err = validate_social_url("https://example.org/profile").unwrap_err();
        assert!(err.contains("example.org"));
    }

    #[test]
    fn test_platform_detection() {
        let cases = [
            ("https://linkedin.com/in/jane-doe", "linkedin", Some("jane-doe")),
            ("https://www.x.com/janedoe", "twitter", Some("janedoe")),
            ("https://github.com/janedoe", "github", Some("janedoe")),
            ("https://tiktok.com/@janedoe", "tiktok", Some("janedoe")),
            ("https://youtube.com/@janedoe", "youtube", Some("janedoe")),
            ("https://reddit.com/u/janedoe", "reddit", Some("janedoe")),
        ];
        for (url, platform, username) in cases {
            let v = validate_social_url(url).unwrap();
            assert_eq!(v.platform, platform, "{}", url);
            assert_eq!(v.username.as_deref(), username, "{}", url);
        }
    }

    #[test]
    fn test_scheme_added_when_missing() {
        let v = validate_social_url("github.com/janedoe").unwrap();
        assert_eq!(v.cleaned_url, "https://github.com/janedoe");
    }

    #[test]
    fn test_tracking_params_stripped() {
        let v = validate_social_url(
            "https://github.com/janedoe?utm_source=news&tab=repos&fbclid=x",
        )
        .unwrap();
        assert_eq!(v.cleaned_url, "https://github.com/janedoe?tab=repos");
    }

    #[test]
    fn test_email_validation() {
        assert!(validate_email("user@example.com").is_ok());
        assert!(validate_email("").is_err());
        assert!(validate_email("not-an-email").is_err());
        assert!(validate_email("a@b").is_err());
    }

    #[test]
    fn test_supported_platforms_listed() {
        let platforms = supported_platforms();
        assert!(platforms.contains(&"linkedin"));
        assert!(platforms.contains(&"twitter"));
        assert_eq!(platforms.len(), 10);
    }
}
