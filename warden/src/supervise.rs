//! Single-job supervision loop.
//!
//! Each loop: ask the breaker, run the worker, classify any failure, feed the
//! outcome to the breaker, then let the retry engine pick the next move.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::circuit::CircuitBreakerService;
use crate::core::circuit::{CircuitState, Transition};
use crate::core::classifier::Classifier;
use crate::core::types::{ErrorCategory, LoopOutcome, ObservedError};
use crate::io::config::SuperviseConfig;
use crate::io::prompt::{PromptEngine, PromptInputs};
use crate::io::store::StateStore;
use crate::io::worker::{WorkRequest, Worker};
use crate::retry::{RetryAction, RetryEngine, Sleeper};

/// The unit of work being supervised.
#[derive(Debug, Clone, Copy)]
pub struct Job<'a> {
    /// Repo name in multi-job mode.
    pub name: Option<&'a str>,
    pub workdir: &'a Path,
    pub task: &'a str,
}

/// Why `supervise` stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum SuperviseStop {
    /// The worker signalled completion on an error-free loop.
    Completed,
    /// The breaker is open.
    CircuitOpen { reason: String },
    /// The retry engine gave up on a failure.
    Escalated {
        category: ErrorCategory,
        message: String,
    },
    /// `max_loops` loops ran without completion.
    MaxLoops { max_loops: u32 },
}

impl SuperviseStop {
    pub fn describe(&self) -> String {
        match self {
            SuperviseStop::Completed => "completed".to_string(),
            SuperviseStop::CircuitOpen { reason } => format!("circuit open: {reason}"),
            SuperviseStop::Escalated { category, message } => {
                format!("escalated {category} error: {}", first_line(message))
            }
            SuperviseStop::MaxLoops { max_loops } => {
                format!("loop budget exhausted after {max_loops} loops")
            }
        }
    }
}

/// Summary of a `supervise` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SuperviseOutcome {
    /// Loops executed in this invocation.
    pub loops: u32,
    pub cost_usd: f64,
    pub stop: SuperviseStop,
}

/// Work spent before `supervise` failed. Attached as context to its error so
/// callers can still account for it with `downcast_ref`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SuperviseUsage {
    pub loops: u32,
    pub cost_usd: f64,
}

impl fmt::Display for SuperviseUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "supervision failed after {} loops (${:.2})",
            self.loops, self.cost_usd
        )
    }
}

/// Per-loop report passed to the `on_loop` callback.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopReport {
    pub outcome: LoopOutcome,
    pub transition: Option<Transition>,
    pub action: Option<RetryAction>,
}

/// Run the worker until it completes, escalates, trips the breaker, or runs
/// out of loops.
///
/// Loop numbers continue from the breaker's persisted `current_loop`, so a
/// resumed job keeps a monotonic loop count. A loop that signals completion
/// without an error stops the job as `Completed` even if it also tripped the
/// breaker. Errors carry a [`SuperviseUsage`] context.
#[instrument(skip_all, fields(job = job.name.unwrap_or("-"), max_loops = config.max_loops))]
pub fn supervise<W, C, S, Z, F>(
    job: &Job<'_>,
    worker: &W,
    classifier: &C,
    engine: &RetryEngine<'_, S, Z>,
    breaker: &CircuitBreakerService<'_, S>,
    config: &SuperviseConfig,
    mut on_loop: F,
) -> Result<SuperviseOutcome>
where
    W: Worker,
    C: Classifier,
    S: StateStore,
    Z: Sleeper,
    F: FnMut(&LoopReport),
{
    let mut usage = SuperviseUsage::default();
    let looped = Looper {
        job,
        worker,
        classifier,
        engine,
        breaker,
        config,
    }
    .run(&mut usage, &mut on_loop);

    let stop = match looped {
        Ok(stop) => stop,
        Err(err) => {
            warn!(loops = usage.loops, cost_usd = usage.cost_usd, "supervision failed");
            return Err(err.context(usage));
        }
    };
    info!(loops = usage.loops, cost_usd = usage.cost_usd, stop = %stop.describe(), "supervision stopped");
    Ok(SuperviseOutcome {
        loops: usage.loops,
        cost_usd: usage.cost_usd,
        stop,
    })
}

struct Looper<'j, 'a, W, C, S: StateStore, Z: Sleeper> {
    job: &'j Job<'j>,
    worker: &'j W,
    classifier: &'j C,
    engine: &'j RetryEngine<'a, S, Z>,
    breaker: &'j CircuitBreakerService<'a, S>,
    config: &'j SuperviseConfig,
}

impl<W, C, S, Z> Looper<'_, '_, W, C, S, Z>
where
    W: Worker,
    C: Classifier,
    S: StateStore,
    Z: Sleeper,
{
    fn run<F>(&self, usage: &mut SuperviseUsage, on_loop: &mut F) -> Result<SuperviseStop>
    where
        F: FnMut(&LoopReport),
    {
        let Self {
            job,
            worker,
            classifier,
            engine,
            breaker,
            config,
        } = self;
        let prompts = PromptEngine::new()?;
        let first_loop = breaker.status()?.current_loop + 1;

        let mut hint: Option<String> = None;
        let mut previous_error: Option<ObservedError> = None;

        loop {
            if usage.loops >= config.max_loops {
                warn!(loops = usage.loops, "loop budget exhausted");
                return Ok(SuperviseStop::MaxLoops {
                    max_loops: config.max_loops,
                });
            }
            if !breaker.can_execute(Utc::now())? {
                return Ok(SuperviseStop::CircuitOpen {
                    reason: open_reason(breaker)?,
                });
            }

            let loop_number = first_loop + usage.loops;
            let prompt = prompts.render(&PromptInputs {
                task: job.task,
                repo: job.name,
                loop_number,
                hint: hint.as_deref(),
                previous_error: previous_error.as_ref(),
            })?;
            debug!(loop_number, prompt_bytes = prompt.len(), "running loop");

            let report = worker
                .run(&WorkRequest {
                    workdir: job.workdir.to_path_buf(),
                    prompt,
                    loop_number,
                })
                .with_context(|| format!("run worker for loop {loop_number}"))?;
            usage.loops += 1;
            usage.cost_usd += report.cost_usd;

            let outcome = LoopOutcome {
                loop_number,
                files_changed: report.files_changed,
                output_bytes: report.output_bytes,
                error: report.error.as_deref().map(|message| classifier.observe(message)),
            };
            let transition = breaker.record_loop_result(&outcome, Utc::now())?;
            let tripped = matches!(&transition, Some(t) if t.to_state == CircuitState::Open);

            let mut action = None;
            let stop = if report.completed && outcome.error.is_none() {
                Some(SuperviseStop::Completed)
            } else if tripped {
                Some(SuperviseStop::CircuitOpen {
                    reason: open_reason(breaker)?,
                })
            } else if let Some(err) = &outcome.error {
                let decision = engine.decide(err.category, &err.signature, loop_number)?;
                info!(
                    loop_number,
                    category = %err.category,
                    strategy = %decision.strategy,
                    attempt = decision.attempt,
                    action = decision.action.as_str(),
                    "loop failed"
                );
                action = Some(decision.action.clone());
                match decision.action {
                    RetryAction::Proceed => {
                        hint = None;
                        previous_error = Some(err.clone());
                        None
                    }
                    RetryAction::ProceedWithHint(next_hint) => {
                        hint = Some(next_hint);
                        previous_error = Some(err.clone());
                        None
                    }
                    RetryAction::ResetSession => {
                        engine.reset_retry_state()?;
                        hint = None;
                        previous_error = None;
                        None
                    }
                    RetryAction::Escalate => Some(SuperviseStop::Escalated {
                        category: err.category,
                        message: err.message.clone(),
                    }),
                }
            } else {
                hint = None;
                previous_error = None;
                None
            };

            on_loop(&LoopReport {
                outcome,
                transition,
                action,
            });
            if let Some(stop) = stop {
                return Ok(stop);
            }
        }
    }
}

fn open_reason<S: StateStore>(breaker: &CircuitBreakerService<'_, S>) -> Result<String> {
    Ok(breaker
        .status()?
        .last_transition_reason
        .unwrap_or_else(|| "circuit open".to_string()))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::circuit::CircuitThresholds;
    use crate::core::classifier::KeywordClassifier;
    use crate::core::retry::RetryPolicy;
    use crate::io::store::MemoryStore;
    use crate::io::worker::WorkReport;
    use crate::test_support::{RecordingSleeper, ScriptedWorker, complete, failure, idle, progress};

    fn failing_with_progress(message: &str) -> WorkReport {
        WorkReport {
            files_changed: 1,
            ..failure(message)
        }
    }

    struct Harness {
        store: MemoryStore,
        sleeper: RecordingSleeper,
        workdir: tempfile::TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                sleeper: RecordingSleeper::default(),
                workdir: tempfile::tempdir().expect("tempdir"),
            }
        }

        fn run(&self, worker: &ScriptedWorker, max_loops: u32) -> (SuperviseOutcome, Vec<LoopReport>) {
            let engine = RetryEngine::new(&self.store, &self.sleeper, RetryPolicy::default());
            let breaker = CircuitBreakerService::new(&self.store, CircuitThresholds::default());
            let job = Job {
                name: None,
                workdir: self.workdir.path(),
                task: "Implement the feature.",
            };
            let mut reports = Vec::new();
            let outcome = supervise(
                &job,
                worker,
                &KeywordClassifier,
                &engine,
                &breaker,
                &SuperviseConfig { max_loops },
                |report| reports.push(report.clone()),
            )
            .expect("supervise");
            (outcome, reports)
        }
    }

    #[test]
    fn completes_when_worker_signals_done() {
        let harness = Harness::new();
        let worker = ScriptedWorker::new(vec![progress(2), complete(1)]);
        let (outcome, reports) = harness.run(&worker, 10);
        assert_eq!(outcome.stop, SuperviseStop::Completed);
        assert_eq!(outcome.loops, 2);
        assert_eq!(reports.len(), 2);
        assert_eq!(worker.requests()[1].loop_number, 2);
    }

    #[test]
    fn stagnation_opens_the_circuit() {
        let harness = Harness::new();
        let worker = ScriptedWorker::new(vec![idle(), idle(), idle(), progress(1)]);
        let (outcome, reports) = harness.run(&worker, 10);
        assert!(matches!(
            outcome.stop,
            SuperviseStop::CircuitOpen { ref reason } if reason.contains("no progress")
        ));
        assert_eq!(outcome.loops, 3);
        assert_eq!(worker.remaining(), 1);
        assert!(reports[2].transition.is_some());
    }

    #[test]
    fn open_circuit_blocks_before_running() {
        let harness = Harness::new();
        let worker = ScriptedWorker::new(vec![idle(), idle(), idle()]);
        harness.run(&worker, 10);

        let untouched = ScriptedWorker::new(vec![complete(1)]);
        let (outcome, _) = harness.run(&untouched, 10);
        assert_eq!(outcome.loops, 0);
        assert!(matches!(outcome.stop, SuperviseStop::CircuitOpen { .. }));
        assert_eq!(untouched.remaining(), 1);
    }

    #[test]
    fn test_failure_carries_hint_into_next_prompt() {
        let harness = Harness::new();
        let worker = ScriptedWorker::new(vec![
            failing_with_progress("assertion failed: parse(\"1\") == 1"),
            complete(1),
        ]);
        let (outcome, reports) = harness.run(&worker, 10);
        assert_eq!(outcome.stop, SuperviseStop::Completed);
        assert!(matches!(reports[0].action, Some(RetryAction::ProceedWithHint(_))));

        let second_prompt = &worker.requests()[1].prompt;
        assert!(second_prompt.contains("## Hint"));
        assert!(second_prompt.contains("assertion failed"));
    }

    #[test]
    fn rate_limit_waits_with_backoff() {
        let harness = Harness::new();
        let worker = ScriptedWorker::new(vec![failure("HTTP 429 Too Many Requests"), complete(1)]);
        let (outcome, _) = harness.run(&worker, 10);
        assert_eq!(outcome.stop, SuperviseStop::Completed);
        assert_eq!(
            harness.sleeper.recorded(),
            vec![std::time::Duration::from_secs(30)]
        );
    }

    #[test]
    fn permission_denial_escalates() {
        let harness = Harness::new();
        let worker = ScriptedWorker::new(vec![failure("Permission denied: write to /etc"), complete(1)]);
        let (outcome, _) = harness.run(&worker, 10);
        assert!(matches!(
            outcome.stop,
            SuperviseStop::Escalated {
                category: ErrorCategory::PermissionDenied,
                ..
            }
        ));
        assert_eq!(outcome.loops, 1);
    }

    #[test]
    fn context_overflow_resets_retry_state() {
        let harness = Harness::new();
        let worker = ScriptedWorker::new(vec![
            failing_with_progress("prompt is too long for the context window"),
            complete(1),
        ]);
        let (outcome, reports) = harness.run(&worker, 10);
        assert_eq!(outcome.stop, SuperviseStop::Completed);
        assert_eq!(reports[0].action, Some(RetryAction::ResetSession));

        let engine = RetryEngine::new(&harness.store, &harness.sleeper, RetryPolicy::default());
        assert!(engine.table().expect("table").signatures.is_empty());
        assert!(!worker.requests()[1].prompt.contains("## Previous attempt"));
    }

    #[test]
    fn loop_budget_stops_the_job() {
        let harness = Harness::new();
        let worker = ScriptedWorker::new(vec![progress(1), progress(1), progress(1)]);
        let (outcome, _) = harness.run(&worker, 2);
        assert_eq!(outcome.stop, SuperviseStop::MaxLoops { max_loops: 2 });
        assert_eq!(outcome.loops, 2);
    }

    #[test]
    fn cost_is_accumulated() {
        let harness = Harness::new();
        let mut first = progress(1);
        first.cost_usd = 0.25;
        let mut second = complete(1);
        second.cost_usd = 0.5;
        let worker = ScriptedWorker::new(vec![first, second]);
        let (outcome, _) = harness.run(&worker, 10);
        assert_eq!(outcome.cost_usd, 0.75);
    }

    #[test]
    fn completion_wins_over_a_stagnation_trip() {
        let harness = Harness::new();
        let worker = ScriptedWorker::new(vec![idle(), idle(), complete(0)]);
        let (outcome, reports) = harness.run(&worker, 10);
        assert_eq!(outcome.stop, SuperviseStop::Completed);
        assert_eq!(outcome.loops, 3);
        let transition = reports[2].transition.as_ref().expect("transition");
        assert_eq!(transition.to_state, CircuitState::Open);
    }

    #[test]
    fn worker_error_carries_usage_so_far() {
        let harness = Harness::new();
        let mut first = progress(1);
        first.cost_usd = 0.3;
        let worker = ScriptedWorker::new(vec![first]);
        let engine = RetryEngine::new(&harness.store, &harness.sleeper, RetryPolicy::default());
        let breaker = CircuitBreakerService::new(&harness.store, CircuitThresholds::default());
        let job = Job {
            name: None,
            workdir: harness.workdir.path(),
            task: "Implement the feature.",
        };

        let err = supervise(
            &job,
            &worker,
            &KeywordClassifier,
            &engine,
            &breaker,
            &SuperviseConfig { max_loops: 10 },
            |_| {},
        )
        .expect_err("second loop has no scripted report");
        let usage = err.downcast_ref::<SuperviseUsage>().expect("usage context");
        assert_eq!(
            *usage,
            SuperviseUsage {
                loops: 1,
                cost_usd: 0.3
            }
        );
        assert!(format!("{err:#}").contains("run worker for loop 2"));
    }
}
