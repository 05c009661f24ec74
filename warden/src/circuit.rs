//! Persisted circuit breaker with transition history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::core::circuit::{CircuitBreaker, CircuitBreakerState, CircuitState, CircuitThresholds, Transition};
use crate::core::types::LoopOutcome;
use crate::io::store::{CIRCUIT_BREAKER, CIRCUIT_HISTORY, StateStore};

/// Loads the breaker from the store for every operation, applies it, and
/// writes back the state plus any transition.
pub struct CircuitBreakerService<'a, S: StateStore> {
    store: &'a S,
    thresholds: CircuitThresholds,
}

impl<'a, S: StateStore> CircuitBreakerService<'a, S> {
    pub fn new(store: &'a S, thresholds: CircuitThresholds) -> Self {
        Self { store, thresholds }
    }

    pub fn status(&self) -> Result<CircuitBreakerState> {
        self.store
            .load_or_default(CIRCUIT_BREAKER)
            .context("load circuit breaker state")
    }

    /// Whether a new loop may start. An open breaker whose cooldown has
    /// elapsed moves to `HALF_OPEN` here.
    pub fn can_execute(&self, now: DateTime<Utc>) -> Result<bool> {
        let mut breaker = self.load()?;
        let (allowed, transition) = breaker.can_execute(now);
        self.commit(breaker, transition)?;
        Ok(allowed)
    }

    pub fn record_loop_result(
        &self,
        outcome: &LoopOutcome,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>> {
        let mut breaker = self.load()?;
        let transition = breaker.record_loop_result(outcome, now);
        self.commit(breaker, transition.clone())?;
        Ok(transition)
    }

    pub fn reset(&self, reason: &str, now: DateTime<Utc>) -> Result<Transition> {
        let mut breaker = self.load()?;
        let transition = breaker.reset(reason, now);
        self.commit(breaker, Some(transition.clone()))?;
        Ok(transition)
    }

    pub fn history(&self) -> Result<Vec<Transition>> {
        self.store
            .read_records(CIRCUIT_HISTORY)
            .context("read circuit history")
    }

    fn load(&self) -> Result<CircuitBreaker> {
        Ok(CircuitBreaker::from_state(self.thresholds, self.status()?))
    }

    fn commit(&self, breaker: CircuitBreaker, transition: Option<Transition>) -> Result<()> {
        let state = breaker.into_state();
        self.store
            .save(CIRCUIT_BREAKER, &state)
            .context("persist circuit breaker state")?;
        let Some(transition) = transition else {
            return Ok(());
        };
        self.store
            .append(CIRCUIT_HISTORY, &transition)
            .context("append circuit history")?;
        if transition.to_state == CircuitState::Open {
            warn!(
                from = %transition.from_state,
                loop_number = transition.loop_number,
                reason = %transition.reason,
                "circuit opened"
            );
        } else {
            info!(
                from = %transition.from_state,
                to = %transition.to_state,
                loop_number = transition.loop_number,
                reason = %transition.reason,
                "circuit transition"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::io::store::MemoryStore;

    fn idle(loop_number: u32) -> LoopOutcome {
        LoopOutcome {
            loop_number,
            files_changed: 0,
            output_bytes: 100,
            error: None,
        }
    }

    fn productive(loop_number: u32) -> LoopOutcome {
        LoopOutcome {
            files_changed: 2,
            ..idle(loop_number)
        }
    }

    #[test]
    fn state_and_history_survive_reload() {
        let store = MemoryStore::new();
        let now = Utc::now();
        {
            let service = CircuitBreakerService::new(&store, CircuitThresholds::default());
            for n in 1..=3 {
                service.record_loop_result(&idle(n), now).expect("record");
            }
        }

        let service = CircuitBreakerService::new(&store, CircuitThresholds::default());
        let status = service.status().expect("status");
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.consecutive_no_progress, 3);
        assert!(!service.can_execute(now).expect("can execute"));

        let history = service.history().expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].from_state, CircuitState::Closed);
        assert_eq!(history[0].to_state, CircuitState::Open);
        assert_eq!(history[0].loop_number, 3);
    }

    #[test]
    fn cooldown_then_probation_closes() {
        let store = MemoryStore::new();
        let service = CircuitBreakerService::new(&store, CircuitThresholds::default());
        let opened = Utc::now();
        for n in 1..=3 {
            service.record_loop_result(&idle(n), opened).expect("record");
        }

        let later = opened + Duration::seconds(1801);
        assert!(service.can_execute(later).expect("can execute"));
        assert_eq!(service.status().expect("status").state, CircuitState::HalfOpen);

        let transition = service
            .record_loop_result(&productive(4), later)
            .expect("record")
            .expect("transition");
        assert_eq!(transition.to_state, CircuitState::Closed);
        assert_eq!(service.history().expect("history").len(), 3);
    }

    #[test]
    fn reset_closes_and_is_recorded() {
        let store = MemoryStore::new();
        let service = CircuitBreakerService::new(&store, CircuitThresholds::default());
        let now = Utc::now();
        for n in 1..=3 {
            service.record_loop_result(&idle(n), now).expect("record");
        }
        let transition = service.reset("manual reset", now).expect("reset");
        assert_eq!(transition.from_state, CircuitState::Open);
        assert_eq!(transition.to_state, CircuitState::Closed);

        let status = service.status().expect("status");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_no_progress, 0);
        assert_eq!(status.last_transition_reason.as_deref(), Some("manual reset"));
        assert_eq!(service.history().expect("history").len(), 2);
    }
}
