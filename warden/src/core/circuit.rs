//! Loop-level circuit breaker.
//!
//! Tracks four counters across consecutive units of work and halts the loop
//! when any of them crosses its threshold:
//!
//! ```text
//! CLOSED    -> OPEN       any threshold reached
//! OPEN      -> HALF_OPEN  cooldown elapsed (on poll, or on a successful loop)
//! HALF_OPEN -> CLOSED     next loop succeeds
//! HALF_OPEN -> OPEN       next loop fails
//! ```
//!
//! The breaker is pure: the caller supplies `now` and persists the state.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::signature::ErrorSignature;
use crate::core::types::LoopOutcome;

/// Output sizes kept for the decline baseline.
pub const OUTPUT_WINDOW: usize = 5;
/// Samples required before output decline is evaluated.
pub const OUTPUT_BASELINE_MIN: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
            CircuitState::Open => write!(f, "OPEN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitThresholds {
    pub no_progress_threshold: u32,
    pub same_error_threshold: u32,
    /// Percentage drop versus the recent average that trips the breaker.
    pub output_decline_threshold: u32,
    pub permission_denial_threshold: u32,
    pub cooldown_secs: u64,
}

impl Default for CircuitThresholds {
    fn default() -> Self {
        Self {
            no_progress_threshold: 3,
            same_error_threshold: 5,
            output_decline_threshold: 70,
            permission_denial_threshold: 2,
            cooldown_secs: 30 * 60,
        }
    }
}

/// Persisted breaker record (`circuit_breaker.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub consecutive_no_progress: u32,
    pub consecutive_same_error: u32,
    pub output_decline_pct: u32,
    pub consecutive_permission_denials: u32,
    pub last_transition_reason: Option<String>,
    pub last_error_signature: Option<ErrorSignature>,
    pub recent_output_sizes: Vec<usize>,
    pub opened_at: Option<DateTime<Utc>>,
    pub current_loop: u32,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_no_progress: 0,
            consecutive_same_error: 0,
            output_decline_pct: 0,
            consecutive_permission_denials: 0,
            last_transition_reason: None,
            last_error_signature: None,
            recent_output_sizes: Vec::new(),
            opened_at: None,
            current_loop: 0,
        }
    }
}

/// One state change, appended to the transition history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from_state: CircuitState,
    pub to_state: CircuitState,
    pub reason: String,
    #[serde(rename = "loop")]
    pub loop_number: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    thresholds: CircuitThresholds,
    state: CircuitBreakerState,
}

impl CircuitBreaker {
    pub fn new(thresholds: CircuitThresholds) -> Self {
        Self::from_state(thresholds, CircuitBreakerState::default())
    }

    pub fn from_state(thresholds: CircuitThresholds, state: CircuitBreakerState) -> Self {
        Self { thresholds, state }
    }

    pub fn state(&self) -> &CircuitBreakerState {
        &self.state
    }

    pub fn into_state(self) -> CircuitBreakerState {
        self.state
    }

    pub fn thresholds(&self) -> &CircuitThresholds {
        &self.thresholds
    }

    pub fn is_open(&self) -> bool {
        self.state.state == CircuitState::Open
    }

    /// True once an open breaker has waited out its cooldown.
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        let Some(opened_at) = self.state.opened_at else {
            return true;
        };
        let cooldown = i64::try_from(self.thresholds.cooldown_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        now.signed_duration_since(opened_at) >= cooldown
    }

    /// Enter probation if the breaker is open and the cooldown has elapsed.
    pub fn poll_cooldown(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        if self.is_open() && self.cooldown_elapsed(now) {
            return Some(self.transition(
                CircuitState::HalfOpen,
                "cooldown elapsed, entering probation".to_string(),
                now,
            ));
        }
        None
    }

    /// Whether a new unit of work may start. May enter `HALF_OPEN`.
    pub fn can_execute(&mut self, now: DateTime<Utc>) -> (bool, Option<Transition>) {
        let transition = self.poll_cooldown(now);
        (!self.is_open(), transition)
    }

    /// Fold one completed unit of work into the counters and re-evaluate state.
    pub fn record_loop_result(
        &mut self,
        outcome: &LoopOutcome,
        now: DateTime<Utc>,
    ) -> Option<Transition> {
        self.state.current_loop = outcome.loop_number;
        self.update_counters(outcome);
        let tripped = self.tripped_reason();

        match self.state.state {
            CircuitState::Closed => {
                let reason = tripped?;
                Some(self.transition(CircuitState::Open, reason, now))
            }
            CircuitState::HalfOpen => {
                if outcome.is_success() && tripped.is_none() {
                    Some(self.transition(
                        CircuitState::Closed,
                        "probation loop succeeded".to_string(),
                        now,
                    ))
                } else {
                    let reason = tripped.unwrap_or_else(|| describe_failure(outcome));
                    Some(self.transition(CircuitState::Open, format!("probation failed: {reason}"), now))
                }
            }
            CircuitState::Open => {
                if outcome.is_success() && self.cooldown_elapsed(now) {
                    Some(self.transition(
                        CircuitState::HalfOpen,
                        "cooldown elapsed and loop made progress".to_string(),
                        now,
                    ))
                } else {
                    None
                }
            }
        }
    }

    /// Manual reset: back to `CLOSED` with cleared counters.
    pub fn reset(&mut self, reason: &str, now: DateTime<Utc>) -> Transition {
        let current_loop = self.state.current_loop;
        let from_state = self.state.state;
        self.state = CircuitBreakerState {
            current_loop,
            ..CircuitBreakerState::default()
        };
        self.state.last_transition_reason = Some(reason.to_string());
        Transition {
            from_state,
            to_state: CircuitState::Closed,
            reason: reason.to_string(),
            loop_number: current_loop,
            timestamp: now,
        }
    }

    fn update_counters(&mut self, outcome: &LoopOutcome) {
        let s = &mut self.state;

        if outcome.made_progress() {
            s.consecutive_no_progress = 0;
        } else {
            s.consecutive_no_progress += 1;
        }

        match &outcome.error {
            Some(err) if s.last_error_signature.as_ref() == Some(&err.signature) => {
                s.consecutive_same_error += 1;
            }
            Some(_) => s.consecutive_same_error = 1,
            None => s.consecutive_same_error = 0,
        }
        s.last_error_signature = outcome.error.as_ref().map(|err| err.signature.clone());

        if outcome.is_permission_denial() {
            s.consecutive_permission_denials += 1;
        } else {
            s.consecutive_permission_denials = 0;
        }

        s.output_decline_pct = output_decline(&s.recent_output_sizes, outcome.output_bytes);
        s.recent_output_sizes.push(outcome.output_bytes);
        if s.recent_output_sizes.len() > OUTPUT_WINDOW {
            let excess = s.recent_output_sizes.len() - OUTPUT_WINDOW;
            s.recent_output_sizes.drain(..excess);
        }
    }

    fn tripped_reason(&self) -> Option<String> {
        let s = &self.state;
        let t = &self.thresholds;
        if s.consecutive_permission_denials >= t.permission_denial_threshold {
            return Some(format!(
                "{} consecutive permission denials",
                s.consecutive_permission_denials
            ));
        }
        if s.consecutive_no_progress >= t.no_progress_threshold {
            return Some(format!(
                "no progress in {} consecutive loops",
                s.consecutive_no_progress
            ));
        }
        if s.consecutive_same_error >= t.same_error_threshold {
            return Some(format!(
                "same error repeated in {} consecutive loops",
                s.consecutive_same_error
            ));
        }
        if t.output_decline_threshold > 0 && s.output_decline_pct >= t.output_decline_threshold {
            return Some(format!("output declined by {}%", s.output_decline_pct));
        }
        None
    }

    fn transition(&mut self, to: CircuitState, reason: String, now: DateTime<Utc>) -> Transition {
        let from = self.state.state;
        self.state.state = to;
        self.state.last_transition_reason = Some(reason.clone());
        self.state.opened_at = match to {
            CircuitState::Open => Some(now),
            CircuitState::HalfOpen | CircuitState::Closed => None,
        };
        Transition {
            from_state: from,
            to_state: to,
            reason,
            loop_number: self.state.current_loop,
            timestamp: now,
        }
    }
}

/// Percentage drop of `current` against the mean of `history`.
fn output_decline(history: &[usize], current: usize) -> u32 {
    if history.len() < OUTPUT_BASELINE_MIN {
        return 0;
    }
    let total: u128 = history.iter().map(|&size| size as u128).sum();
    let mean = total / history.len() as u128;
    let current = current as u128;
    if mean == 0 || current >= mean {
        return 0;
    }
    u32::try_from((mean - current) * 100 / mean).unwrap_or(100)
}

fn describe_failure(outcome: &LoopOutcome) -> String {
    match &outcome.error {
        Some(err) => format!("{} error", err.category),
        None => "no progress".to_string(),
    }
}
