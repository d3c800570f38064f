//! Error classification
//!
//! Execution errors are classified by matching their text against two
//! ordered regex tables. Permanent errors short-circuit retries; transient
//! errors are retried and may trigger a cross-provider switch. Anything
//! unmatched is retried like a transient but never switches providers.

use std::sync::LazyLock;

use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// The two principal error kinds driving retry vs. abandon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    /// Unmatched by either table
    Unknown,
}

// Permanent: authentication, authorization, invalid arguments, content policy
static PERMANENT: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)\b401\b",
        r"(?i)\b403\b",
        r"PERMISSION_DENIED",
        r"(?i)unauthorized",
        r"(?i)forbidden",
        r"(?i)api key",
        r"(?i)invalid model",
        r"(?i)content.policy",
        r"(?i)safety",
        r"INVALID_ARGUMENT",
        r"(?i)invalid request",
        r"(?i)invalid argument",
    ])
    .expect("permanent error patterns are valid")
});

// Transient: rate limits, connectivity, upstream hiccups, killed processes
static TRANSIENT: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)\b429\b",
        r"RESOURCE_EXHAUSTED",
        r"(?i)rate.limit",
        r"(?i)quota",
        r"(?i)overloaded",
        r"(?i)capacity",
        r"ECONNREFUSED",
        r"ETIMEDOUT",
        r"ENOTFOUND",
        r"(?i)fetch failed",
        r"(?i)timed? ?out",
        r"(?i)\b502\b",
        r"(?i)\b503\b",
        r"SIGKILL",
        r"SIGTERM",
        r"(?i)connection (reset|refused|closed)",
    ])
    .expect("transient error patterns are valid")
});

/// Classify an error string. The permanent table wins over the transient
/// one, so "403 rate limit" reads as an auth failure, not a retry.
pub fn classify(error: &str) -> ErrorKind {
    if PERMANENT.is_match(error) {
        ErrorKind::Permanent
    } else if TRANSIENT.is_match(error) {
        ErrorKind::Transient
    } else {
        ErrorKind::Unknown
    }
}

impl ErrorKind {
    /// Whether the runner should retry after this kind of error
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent)
    }

    /// Whether this error justifies switching providers
    pub fn allows_provider_switch(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_patterns() {
        for error in [
            "HTTP 401 from api",
            "status 403 Forbidden",
            "PERMISSION_DENIED: not allowed",
            "request unauthorized",
            "missing api key",
            "invalid model: gpt-nonsense",
            "blocked by content policy",
            "safety system triggered",
            "INVALID_ARGUMENT: bad temperature",
        ] {
            assert_eq!(classify(error), ErrorKind::Permanent, "{}", error);
        }
    }

    #[test]
    fn test_transient_patterns() {
        for error in [
            "HTTP 429 Too Many Requests",
            "RESOURCE_EXHAUSTED",
            "quota exceeded for project",
            "model overloaded, try later",
            "at capacity",
            "connect ECONNREFUSED 127.0.0.1:443",
            "ETIMEDOUT after 30000ms",
            "getaddrinfo ENOTFOUND api.example.com",
            "fetch failed",
            "request timed out",
            "upstream returned 502",
            "503 Service Unavailable",
            "child exited after SIGKILL",
            "terminated by SIGTERM",
        ] {
            assert_eq!(classify(error), ErrorKind::Transient, "{}", error);
        }
    }

    #[test]
    fn test_permanent_wins_over_transient() {
        assert_eq!(classify("403 while rate limited"), ErrorKind::Permanent);
    }

    #[test]
    fn test_unknown() {
        let kind = classify("something completely different");
        assert_eq!(kind, ErrorKind::Unknown);
        assert!(kind.is_retryable());
        assert!(!kind.allows_provider_switch());
    }

    #[test]
    fn test_retry_semantics() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(ErrorKind::Transient.allows_provider_switch());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::Permanent.allows_provider_switch());
    }
}
