//! Stateful retry engine: per-signature attempt tracking, backoff sleeps,
//! and the retry audit log.
//!
//! The engine never stops the process. [`RetryAction::Escalate`] is a signal
//! for the caller.

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::retry::{RetryPolicy, get_retry_strategy, retry_hint};
use crate::core::signature::ErrorSignature;
use crate::core::types::{ErrorCategory, RetryStrategy};
use crate::io::store::{RETRY_LOG, RETRY_STATE, StateStore};

/// Blocks the current thread for backoff waits.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Production sleeper.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// How an observation was resolved, stamped on the signature's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Another attempt was allowed.
    Retrying,
    /// The attempt budget for this signature is spent.
    Exhausted,
    /// The category never retries (`halt`/`no_retry`).
    Terminal,
}

/// Attempt bookkeeping for one error signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub category: ErrorCategory,
    pub attempt_count: u32,
    pub last_attempt_timestamp: Option<DateTime<Utc>>,
    pub last_loop: u32,
    pub last_outcome: Option<AttemptOutcome>,
}

impl RetryState {
    fn unseen(category: ErrorCategory) -> Self {
        Self {
            category,
            attempt_count: 0,
            last_attempt_timestamp: None,
            last_loop: 0,
            last_outcome: None,
        }
    }
}

/// Persisted `retry_state` document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryTable {
    pub signatures: BTreeMap<ErrorSignature, RetryState>,
}

/// What the caller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Retry now (any backoff has already been slept).
    Proceed,
    /// Retry with this hint added to the next prompt.
    ProceedWithHint(String),
    /// Start a fresh session, then retry.
    ResetSession,
    /// Stop retrying and hand the failure to an operator.
    Escalate,
}

impl RetryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryAction::Proceed => "proceed",
            RetryAction::ProceedWithHint(_) => "proceed_with_hint",
            RetryAction::ResetSession => "reset_session",
            RetryAction::Escalate => "escalate",
        }
    }
}

/// Immutable `retry_log` entry, one per executed retry decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttemptRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "loop")]
    pub loop_number: u32,
    pub category: ErrorCategory,
    pub attempt: u32,
    pub strategy: RetryStrategy,
    pub outcome: String,
}

/// Result of [`RetryEngine::decide`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    pub strategy: RetryStrategy,
    /// Attempt count for the signature after this observation.
    pub attempt: u32,
    pub action: RetryAction,
}

pub struct RetryEngine<'a, S: StateStore, Z: Sleeper> {
    store: &'a S,
    sleeper: &'a Z,
    policy: RetryPolicy,
}

impl<'a, S: StateStore, Z: Sleeper> RetryEngine<'a, S, Z> {
    pub fn new(store: &'a S, sleeper: &'a Z, policy: RetryPolicy) -> Self {
        Self {
            store,
            sleeper,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn table(&self) -> Result<RetryTable> {
        self.store
            .load_or_default(RETRY_STATE)
            .context("load retry state")
    }

    /// State for `signature`; unseen signatures report zero attempts and an
    /// `unknown` category.
    pub fn get_retry_state(&self, signature: &ErrorSignature) -> Result<RetryState> {
        Ok(self
            .table()?
            .signatures
            .get(signature)
            .cloned()
            .unwrap_or_else(|| RetryState::unseen(ErrorCategory::Unknown)))
    }

    /// Count one more attempt for `signature` and persist.
    pub fn update_retry_state(
        &self,
        signature: &ErrorSignature,
        category: ErrorCategory,
        outcome: AttemptOutcome,
        loop_number: u32,
    ) -> Result<RetryState> {
        let mut table = self.table()?;
        let state = table
            .signatures
            .entry(signature.clone())
            .or_insert_with(|| RetryState::unseen(category));
        state.category = category;
        state.attempt_count += 1;
        state.last_attempt_timestamp = Some(Utc::now());
        state.last_loop = loop_number;
        state.last_outcome = Some(outcome);
        let updated = state.clone();

        self.store
            .save(RETRY_STATE, &table)
            .context("persist retry state")?;
        debug!(
            signature = %signature,
            category = %category,
            attempt_count = updated.attempt_count,
            "retry state updated"
        );
        Ok(updated)
    }

    /// Forget every signature (manual reset, or a session reset).
    pub fn reset_retry_state(&self) -> Result<()> {
        self.store
            .save(RETRY_STATE, &RetryTable::default())
            .context("persist retry state")?;
        info!("retry state reset");
        Ok(())
    }

    /// Carry out `strategy` for attempt `attempt` and log it.
    ///
    /// `wait_and_retry` sleeps the backoff before returning.
    pub fn execute_retry(
        &self,
        strategy: RetryStrategy,
        attempt: u32,
        category: ErrorCategory,
        loop_number: u32,
    ) -> Result<RetryAction> {
        let action = match strategy {
            RetryStrategy::WaitAndRetry => {
                let backoff = self.policy.calculate_backoff(attempt);
                info!(
                    category = %category,
                    attempt,
                    backoff_secs = backoff.as_secs(),
                    "waiting before retry"
                );
                self.sleeper.sleep(backoff);
                RetryAction::Proceed
            }
            RetryStrategy::RetryWithHint => match retry_hint(category) {
                Some(hint) => RetryAction::ProceedWithHint(hint.to_string()),
                None => RetryAction::Proceed,
            },
            RetryStrategy::ResetSession => RetryAction::ResetSession,
            RetryStrategy::Halt | RetryStrategy::NoRetry => RetryAction::Escalate,
        };
        self.log_attempt(strategy, attempt, category, loop_number, &action)?;
        Ok(action)
    }

    /// Full decision for one observed failure: look up, check the budget,
    /// count the attempt, then execute the strategy.
    ///
    /// An exhausted signature escalates without counting another attempt, so
    /// `attempt_count` never passes `max_attempts` for retryable categories.
    pub fn decide(
        &self,
        category: ErrorCategory,
        signature: &ErrorSignature,
        loop_number: u32,
    ) -> Result<RetryDecision> {
        let strategy = get_retry_strategy(category);
        let state = self.get_retry_state(signature)?;

        if strategy.is_terminal() {
            let updated =
                self.update_retry_state(signature, category, AttemptOutcome::Terminal, loop_number)?;
            let action =
                self.execute_retry(strategy, updated.attempt_count, category, loop_number)?;
            return Ok(RetryDecision {
                strategy,
                attempt: updated.attempt_count,
                action,
            });
        }

        if !self.policy.should_retry(category, state.attempt_count) {
            warn!(
                signature = %signature,
                category = %category,
                attempts = state.attempt_count,
                max_attempts = self.policy.max_attempts,
                "retry budget exhausted"
            );
            self.mark_exhausted(signature, category, loop_number)?;
            let action = RetryAction::Escalate;
            self.log_attempt(strategy, state.attempt_count, category, loop_number, &action)?;
            return Ok(RetryDecision {
                strategy,
                attempt: state.attempt_count,
                action,
            });
        }

        let updated =
            self.update_retry_state(signature, category, AttemptOutcome::Retrying, loop_number)?;
        let action = self.execute_retry(strategy, updated.attempt_count, category, loop_number)?;
        Ok(RetryDecision {
            strategy,
            attempt: updated.attempt_count,
            action,
        })
    }

    fn mark_exhausted(
        &self,
        signature: &ErrorSignature,
        category: ErrorCategory,
        loop_number: u32,
    ) -> Result<()> {
        let mut table = self.table()?;
        let state = table
            .signatures
            .entry(signature.clone())
            .or_insert_with(|| RetryState::unseen(category));
        state.last_attempt_timestamp = Some(Utc::now());
        state.last_loop = loop_number;
        state.last_outcome = Some(AttemptOutcome::Exhausted);
        self.store
            .save(RETRY_STATE, &table)
            .context("persist retry state")
    }

    pub fn history(&self) -> Result<Vec<RetryAttemptRecord>> {
        self.store.read_records(RETRY_LOG).context("read retry log")
    }

    fn log_attempt(
        &self,
        strategy: RetryStrategy,
        attempt: u32,
        category: ErrorCategory,
        loop_number: u32,
        action: &RetryAction,
    ) -> Result<()> {
        let record = RetryAttemptRecord {
            timestamp: Utc::now(),
            loop_number,
            category,
            attempt,
            strategy,
            outcome: action.as_str().to_string(),
        };
        self.store
            .append(RETRY_LOG, &record)
            .context("append retry log")
    }
}
