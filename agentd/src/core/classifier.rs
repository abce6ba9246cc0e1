//! Deterministic classification of command failures and redaction of
//! credentials from text that ends up in errors or logs.

use std::sync::LazyLock;

use regex::Regex;

/// How a failed external call should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Likely to succeed on retry (timeouts, connectivity).
    Transient,
    /// Will fail the same way again (auth, not found, validation, unknown).
    Permanent,
}

static PERMANENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(authenticat|auth login|bad credentials|http 40[134]|http 422|not found|could not find|validation failed|permission denied|must be logged in)",
    )
    .expect("permanent failure pattern is valid")
});

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(timed? ?out|deadline exceeded|connection (reset|refused|closed)|dial tcp|tls handshake|temporary failure|could not resolve host|network is unreachable|unexpected eof|\bEOF\b|http 50[234]|bad gateway|service unavailable|gateway timeout)",
    )
    .expect("transient failure pattern is valid")
});

static URL_CREDENTIALS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(https?://)[^/\s@]+@").expect("url credential pattern is valid")
});

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(gh[pousr]_[A-Za-z0-9]{16,}|github_pat_[A-Za-z0-9_]{20,})\b")
        .expect("token pattern is valid")
});

/// Classify a failure from its captured output.
///
/// Permanent markers win over transient ones: "HTTP 404 ... timed out waiting"
/// is still a missing resource.
pub fn classify_failure(output: &str) -> FailureClass {
    if PERMANENT_RE.is_match(output) {
        return FailureClass::Permanent;
    }
    if TRANSIENT_RE.is_match(output) {
        return FailureClass::Transient;
    }
    FailureClass::Permanent
}

pub fn is_transient(output: &str) -> bool {
    classify_failure(output) == FailureClass::Transient
}

/// Strip credentials embedded in URLs and well-known token formats.
pub fn redact(text: &str) -> String {
    let without_urls = URL_CREDENTIALS_RE.replace_all(text, "${1}***@");
    TOKEN_RE.replace_all(&without_urls, "***").into_owned()
}
