//! Deterministic classification of worker failure messages.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::signature::{ErrorSignature, normalize_message};
use crate::core::types::{ErrorCategory, ObservedError};

/// Maps a raw failure message to a category and a stable signature.
pub trait Classifier {
    fn classify(&self, message: &str) -> ErrorCategory;

    fn signature(&self, message: &str) -> ErrorSignature {
        ErrorSignature::from_message(message)
    }

    fn observe(&self, message: &str) -> ObservedError {
        ObservedError {
            category: self.classify(message),
            signature: self.signature(message),
            message: message.to_string(),
        }
    }
}

/// Case-insensitive keyword table, checked in order; first match wins.
///
/// Permission denials are checked first so a denied tool call inside a
/// failing test run is not mistaken for a test failure.
const KEYWORDS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::PermissionDenied,
        &[
            "permission denied",
            "not permitted",
            "requires approval",
            "tool use was denied",
            "access denied",
        ],
    ),
    (
        ErrorCategory::RateLimit,
        &["rate limit", "rate_limit", "too many requests", "usage limit"],
    ),
    (
        ErrorCategory::ContextOverflow,
        &[
            "context window",
            "context length",
            "prompt is too long",
            "maximum context",
            "token limit",
        ],
    ),
    (
        ErrorCategory::DependencyError,
        &[
            "could not resolve dependency",
            "failed to resolve",
            "no matching package",
            "module not found",
            "cannot find module",
            "unresolved import",
            "failed to download",
        ],
    ),
    (
        ErrorCategory::TestFailure,
        &[
            "test failed",
            "tests failed",
            "assertion failed",
            "assertionerror",
            "failures:",
            "expected:",
        ],
    ),
    (
        ErrorCategory::BuildError,
        &[
            "compilation failed",
            "could not compile",
            "build failed",
            "syntax error",
            "error[e",
            "cannot find symbol",
        ],
    ),
    (
        ErrorCategory::ApiError,
        &[
            "api error",
            "overloaded",
            "internal server error",
            "service unavailable",
            "connection reset",
            "timed out",
        ],
    ),
];

/// HTTP status codes, matched as whole tokens after source positions have
/// been normalized away.
static RATE_LIMIT_STATUS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b429\b").expect("rate limit status regex should be valid"));
static SERVER_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:500|502|503|504|529)\b").expect("server status regex should be valid")
});

fn matches_status(category: ErrorCategory, text: &str) -> bool {
    match category {
        ErrorCategory::RateLimit => RATE_LIMIT_STATUS_RE.is_match(text),
        ErrorCategory::ApiError => SERVER_STATUS_RE.is_match(text),
        _ => false,
    }
}

/// Default classifier backed by [`KEYWORDS`].
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl Classifier for KeywordClassifier {
    fn classify(&self, message: &str) -> ErrorCategory {
        let text = normalize_message(message);
        KEYWORDS
            .iter()
            .find(|(category, needles)| {
                needles.iter().any(|needle| text.contains(needle)) || matches_status(*category, &text)
            })
            .map(|(category, _)| *category)
            .unwrap_or(ErrorCategory::Unknown)
    }
}
