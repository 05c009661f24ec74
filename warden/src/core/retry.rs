//! Retry decision rules: strategy table, backoff, and retry eligibility.
//!
//! Everything here is a pure function of the category, the attempt count and
//! the [`RetryPolicy`]. Attempt bookkeeping and side effects live in
//! [`crate::retry`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::types::{ErrorCategory, RetryStrategy};

/// Tunables for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_initial_secs: u64,
    pub backoff_multiplier: u32,
    pub backoff_max_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_initial_secs: 30,
            backoff_multiplier: 2,
            backoff_max_secs: 300,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt` (1-indexed; 0 is treated as 1).
    ///
    /// `min(initial * multiplier^(attempt-1), max)`, saturating on overflow.
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1) - 1;
        let secs = self
            .backoff_multiplier
            .checked_pow(exponent)
            .and_then(|factor| self.backoff_initial_secs.checked_mul(u64::from(factor)))
            .unwrap_or(u64::MAX);
        Duration::from_secs(secs.min(self.backoff_max_secs))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn should_retry(&self, category: ErrorCategory, attempts: u32) -> bool {
        if get_retry_strategy(category).is_terminal() {
            return false;
        }
        attempts < self.max_attempts
    }

    /// Variant of [`Self::should_retry`] for untrusted counts; negatives count as zero.
    pub fn should_retry_raw(&self, category: ErrorCategory, attempts: i64) -> bool {
        let attempts = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);
        self.should_retry(category, attempts)
    }
}

/// Fixed category → strategy table.
pub fn get_retry_strategy(category: ErrorCategory) -> RetryStrategy {
    match category {
        ErrorCategory::RateLimit | ErrorCategory::ApiError => RetryStrategy::WaitAndRetry,
        ErrorCategory::TestFailure | ErrorCategory::BuildError | ErrorCategory::DependencyError => {
            RetryStrategy::RetryWithHint
        }
        ErrorCategory::ContextOverflow => RetryStrategy::ResetSession,
        ErrorCategory::PermissionDenied => RetryStrategy::Halt,
        ErrorCategory::Unknown => RetryStrategy::NoRetry,
    }
}

/// Strategy lookup by raw category label; unrecognized labels yield `NoRetry`.
pub fn get_retry_strategy_for_label(label: &str) -> RetryStrategy {
    get_retry_strategy(ErrorCategory::from_label(label))
}

/// Remediation hint injected into the next attempt for `retry_with_hint` categories.
pub fn retry_hint(category: ErrorCategory) -> Option<&'static str> {
    match category {
        ErrorCategory::TestFailure => Some(
            "The previous attempt left failing tests. Focus on the failing assertion: \
             read the test output, fix the code under test, and rerun only that test first.",
        ),
        ErrorCategory::BuildError => Some(
            "The previous attempt did not compile. Fix the first reported compiler error \
             before making any other change, then rebuild.",
        ),
        ErrorCategory::DependencyError => Some(
            "The previous attempt failed to resolve a dependency. Check the package name \
             and version in the manifest and install or correct it before continuing.",
        ),
        ErrorCategory::RateLimit
        | ErrorCategory::PermissionDenied
        | ErrorCategory::ContextOverflow
        | ErrorCategory::ApiError
        | ErrorCategory::Unknown => None,
    }
}
