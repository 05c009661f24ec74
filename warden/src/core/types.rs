//! Shared deterministic types for the supervision core.
//!
//! These types define stable contracts between the retry engine, the circuit
//! breaker and the coordinator. They carry no I/O and serialize to the same
//! labels the persisted documents use.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::signature::ErrorSignature;

/// Category assigned to an observed failure by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    PermissionDenied,
    TestFailure,
    BuildError,
    DependencyError,
    ContextOverflow,
    ApiError,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::RateLimit,
        ErrorCategory::PermissionDenied,
        ErrorCategory::TestFailure,
        ErrorCategory::BuildError,
        ErrorCategory::DependencyError,
        ErrorCategory::ContextOverflow,
        ErrorCategory::ApiError,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::PermissionDenied => "permission_denied",
            ErrorCategory::TestFailure => "test_failure",
            ErrorCategory::BuildError => "build_error",
            ErrorCategory::DependencyError => "dependency_error",
            ErrorCategory::ContextOverflow => "context_overflow",
            ErrorCategory::ApiError => "api_error",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Parse a category label. Unrecognized labels map to `Unknown`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == label)
            .unwrap_or(ErrorCategory::Unknown)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remediation chosen for a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    WaitAndRetry,
    RetryWithHint,
    ResetSession,
    Halt,
    NoRetry,
}

impl RetryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryStrategy::WaitAndRetry => "wait_and_retry",
            RetryStrategy::RetryWithHint => "retry_with_hint",
            RetryStrategy::ResetSession => "reset_session",
            RetryStrategy::Halt => "halt",
            RetryStrategy::NoRetry => "no_retry",
        }
    }

    /// True for strategies that never retry regardless of attempt count.
    pub fn is_terminal(self) -> bool {
        matches!(self, RetryStrategy::Halt | RetryStrategy::NoRetry)
    }
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure observed during one unit of work, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedError {
    pub category: ErrorCategory,
    pub signature: ErrorSignature,
    pub message: String,
}

/// What the coordinator reports to the circuit breaker after each unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopOutcome {
    /// 1-indexed loop number within the current session.
    pub loop_number: u32,
    /// Number of files the worker changed.
    pub files_changed: usize,
    /// Size of the worker's output in bytes.
    pub output_bytes: usize,
    pub error: Option<ObservedError>,
}

impl LoopOutcome {
    pub fn made_progress(&self) -> bool {
        self.files_changed > 0
    }

    /// A successful loop changed files and reported no error.
    pub fn is_success(&self) -> bool {
        self.made_progress() && self.error.is_none()
    }

    pub fn is_permission_denial(&self) -> bool {
        matches!(
            &self.error,
            Some(err) if err.category == ErrorCategory::PermissionDenied
        )
    }
}
