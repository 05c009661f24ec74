//! Stable identity for failure messages.
//!
//! Two occurrences of "the same" error rarely produce byte-identical text:
//! timestamps move and line numbers shift as the worker edits files. The
//! signature strips those volatile parts before hashing so retry attempts
//! are counted per distinct failure.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest.
pub const SIGNATURE_LEN: usize = 16;

static ISO_TIMESTAMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{4}-\d{2}-\d{2}[t ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:z|[+-]\d{2}:?\d{2})?")
        .expect("iso timestamp regex should be valid")
});
static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b").expect("clock regex should be valid")
});
static EPOCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{10,13}\b").expect("epoch regex should be valid"));
static LINE_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(line|ln|col|column)\s*:?\s*\d+").expect("line word regex should be valid")
});
static FILE_POSITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\.[a-z0-9_]+):\d+(?::\d+)?").expect("file position regex should be valid")
});
static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace regex should be valid"));

/// Normalized, hashed identity of a failure message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorSignature(String);

impl ErrorSignature {
    /// Derive the signature for a raw error message.
    pub fn from_message(message: &str) -> Self {
        let normalized = normalize_message(message);
        let digest = Sha256::digest(normalized.as_bytes());
        let mut hex = hex::encode(digest);
        hex.truncate(SIGNATURE_LEN);
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ErrorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase the message and replace volatile substrings with placeholders.
pub fn normalize_message(message: &str) -> String {
    let lowered = message.to_lowercase();
    let text = ISO_TIMESTAMP_RE.replace_all(&lowered, "<ts>");
    let text = CLOCK_RE.replace_all(&text, "<time>");
    let text = EPOCH_RE.replace_all(&text, "<ts>");
    let text = LINE_WORD_RE.replace_all(&text, "$1 <n>");
    let text = FILE_POSITION_RE.replace_all(&text, "$1:<n>");
    let text = WHITESPACE_RE.replace_all(&text, " ");
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_sixteen_hex_chars() {
        let sig = ErrorSignature::from_message("error: something broke");
        assert_eq!(sig.as_str().len(), SIGNATURE_LEN);
        assert!(sig.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_ignores_case_and_timestamps() {
        let a = ErrorSignature::from_message("2024-01-05T10:11:12Z Build FAILED in src/lib.rs:10:4");
        let b = ErrorSignature::from_message("2025-03-09 22:01:59 build failed in src/lib.rs:88:1");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_ignores_line_numbers() {
        let a = ErrorSignature::from_message("assertion failed at line 42");
        let b = ErrorSignature::from_message("assertion failed at line 97");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_messages_have_distinct_signatures() {
        let a = ErrorSignature::from_message("test parser::empty failed");
        let b = ErrorSignature::from_message("test parser::nested failed");
        assert_ne!(a, b);
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(
            normalize_message("  Rate   limit\n exceeded at 12:00:01 "),
            "rate limit exceeded at <time>"
        );
    }
}
