//! Multi-repo orchestration: run each declared repo's job in dependency order.
//!
//! Every repo gets its own retry table and circuit breaker under
//! `.warden/repos/<name>/`. A failed job is marked blocked and never aborts
//! independent siblings; its dependents simply stay waiting.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::circuit::CircuitBreakerService;
use crate::core::classifier::Classifier;
use crate::core::graph::{RepoGraph, validate_graph};
use crate::core::orchestration::{OrchestrationState, RepoState, init_orchestration_state};
use crate::io::config::WardenConfig;
use crate::io::init::WardenPaths;
use crate::io::repo_config::load_repo_config;
use crate::io::store::{FileStore, ORCHESTRATION, ORCHESTRATION_EVENTS, StateStore};
use crate::io::worker::Worker;
use crate::retry::{RetryEngine, Sleeper, ThreadSleeper};
use crate::supervise::{Job, SuperviseStop, SuperviseUsage, supervise};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Resumed,
    RepoStarted,
    RepoCompleted,
    RepoBlocked,
    RepoUnblocked,
    Finished,
}

/// One `orchestration_events` log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    pub timestamp: DateTime<Utc>,
    pub event: EventKind,
    pub repo: Option<String>,
    pub detail: Option<String>,
}

/// Inputs for [`run_orchestration`].
#[derive(Debug, Clone, Copy)]
pub struct OrchestrationRequest<'a> {
    pub root: &'a Path,
    pub repo_config: &'a Path,
    pub task: &'a str,
    pub config: &'a WardenConfig,
    /// Discard any persisted progress and start from a fresh state.
    pub fresh: bool,
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestrationReport {
    pub order: Vec<String>,
    pub state: OrchestrationState,
}

impl OrchestrationReport {
    /// Repos still pending because something they depend on did not complete.
    pub fn waiting(&self) -> Vec<&str> {
        self.state
            .repos
            .iter()
            .filter(|(_, repo)| repo.status == RepoState::Pending)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn all_completed(&self) -> bool {
        self.state
            .repos
            .values()
            .all(|repo| repo.status == RepoState::Completed)
    }
}

/// Load and fully validate a declaration, returning the execution order.
pub fn validate_orchestration(repo_config: &Path) -> Result<(RepoGraph, Vec<String>)> {
    let graph = load_repo_config(repo_config)?;
    let order = validate_graph(&graph)
        .with_context(|| format!("validate {}", repo_config.display()))?;
    Ok((graph, order))
}

/// Drive every runnable repo to completion or blocked.
///
/// Configuration errors abort before any state is written. Persisted progress
/// for the same set of repos is resumed unless `request.fresh` is set; a
/// resumed run with nothing runnable just reports and finishes.
#[instrument(skip_all, fields(repo_config = %request.repo_config.display()))]
pub fn run_orchestration<W, C, Z, F>(
    request: &OrchestrationRequest<'_>,
    worker: &W,
    classifier: &C,
    sleeper: &Z,
    mut on_event: F,
) -> Result<OrchestrationReport>
where
    W: Worker,
    C: Classifier,
    Z: Sleeper,
    F: FnMut(&OrchestrationEvent),
{
    let (graph, order) = validate_orchestration(request.repo_config)?;
    let paths = WardenPaths::new(request.root);
    let store = FileStore::for_paths(&paths);
    let mut emit = |kind: EventKind, repo: Option<&str>, detail: Option<String>| -> Result<()> {
        let event = OrchestrationEvent {
            timestamp: Utc::now(),
            event: kind,
            repo: repo.map(str::to_string),
            detail,
        };
        store
            .append(ORCHESTRATION_EVENTS, &event)
            .context("append orchestration event")?;
        on_event(&event);
        Ok(())
    };

    let mut state = match resumable_state(&store, &graph)? {
        Some(state) if !request.fresh => {
            info!("resuming orchestration");
            emit(EventKind::Resumed, None, Some(order.join(" -> ")))?;
            state
        }
        _ => {
            emit(EventKind::Started, None, Some(order.join(" -> ")))?;
            init_orchestration_state(&graph)
        }
    };
    state.active = true;
    save_state(&store, &state)?;

    while let Some(name) = state.get_next_repo().map(str::to_string) {
        state.mark_repo_in_progress(&name)?;
        save_state(&store, &state)?;
        emit(EventKind::RepoStarted, Some(&name), None)?;

        let repo = state.repo(&name)?;
        let workdir = repo.path.clone();
        let (prior_loops, prior_cost) = (repo.loops, repo.cost_usd);

        let repo_store = FileStore::for_paths(&paths.for_repo(&name));
        let engine = RetryEngine::new(&repo_store, sleeper, request.config.retry);
        let breaker = CircuitBreakerService::new(&repo_store, request.config.circuit);
        let job = Job {
            name: Some(&name),
            workdir: &workdir,
            task: request.task,
        };
        let result = supervise(
            &job,
            worker,
            classifier,
            &engine,
            &breaker,
            &request.config.supervise,
            |_| {},
        );

        match result {
            Ok(outcome) => {
                let loops = prior_loops + outcome.loops;
                let cost = prior_cost + outcome.cost_usd;
                if outcome.stop == SuperviseStop::Completed {
                    state.mark_repo_complete(&name, loops, cost)?;
                    emit(
                        EventKind::RepoCompleted,
                        Some(&name),
                        Some(format!("{loops} loops, ${cost:.2}")),
                    )?;
                } else {
                    record_usage(&mut state, &name, loops, cost)?;
                    let reason = outcome.stop.describe();
                    warn!(repo = %name, reason = %reason, "repo blocked");
                    state.mark_repo_blocked(&name, &reason)?;
                    emit(EventKind::RepoBlocked, Some(&name), Some(reason))?;
                }
            }
            Err(err) => {
                if let Some(usage) = err.downcast_ref::<SuperviseUsage>() {
                    record_usage(
                        &mut state,
                        &name,
                        prior_loops + usage.loops,
                        prior_cost + usage.cost_usd,
                    )?;
                }
                let reason = format!("{err:#}");
                warn!(repo = %name, reason = %reason, "repo failed to run");
                state.mark_repo_blocked(&name, &reason)?;
                emit(EventKind::RepoBlocked, Some(&name), Some(reason))?;
            }
        }
        save_state(&store, &state)?;
    }

    state.finish();
    save_state(&store, &state)?;
    let summary = state.summary();
    emit(
        EventKind::Finished,
        None,
        Some(format!(
            "{} completed, {} blocked, {} waiting",
            summary.completed, summary.blocked, summary.pending
        )),
    )?;

    Ok(OrchestrationReport { order, state })
}

/// Persisted orchestration document, if any.
pub fn orchestration_status<S: StateStore>(store: &S) -> Result<Option<OrchestrationState>> {
    store.load(ORCHESTRATION).context("load orchestration state")
}

/// Return a blocked repo to pending and clear its breaker and retry table so
/// the next run gets a fresh start.
pub fn unblock(root: &Path, name: &str, config: &WardenConfig) -> Result<()> {
    let paths = WardenPaths::new(root);
    let store = FileStore::for_paths(&paths);
    let mut state = orchestration_status(&store)?
        .ok_or_else(|| anyhow!("no orchestration state (run `warden orchestrate run` first)"))?;
    state.unblock_repo(name)?;

    let repo_store = FileStore::for_paths(&paths.for_repo(name));
    CircuitBreakerService::new(&repo_store, config.circuit).reset("repo unblocked", Utc::now())?;
    RetryEngine::new(&repo_store, &ThreadSleeper, config.retry).reset_retry_state()?;

    save_state(&store, &state)?;
    store
        .append(
            ORCHESTRATION_EVENTS,
            &OrchestrationEvent {
                timestamp: Utc::now(),
                event: EventKind::RepoUnblocked,
                repo: Some(name.to_string()),
                detail: None,
            },
        )
        .context("append orchestration event")?;
    info!(repo = name, "repo unblocked");
    Ok(())
}

pub fn orchestration_events<S: StateStore>(store: &S) -> Result<Vec<OrchestrationEvent>> {
    store
        .read_records(ORCHESTRATION_EVENTS)
        .context("read orchestration events")
}

/// Persisted state is resumable when it covers exactly the declared repos.
/// Completed repos are never rerun, and blocked repos stay blocked until
/// [`unblock`].
fn resumable_state<S: StateStore>(
    store: &S,
    graph: &RepoGraph,
) -> Result<Option<OrchestrationState>> {
    let Some(state) = orchestration_status(store)? else {
        return Ok(None);
    };
    let same_repos = state.repos.len() == graph.len()
        && graph.nodes().iter().all(|node| state.repos.contains_key(&node.name));
    Ok(same_repos.then_some(state))
}

fn record_usage(state: &mut OrchestrationState, name: &str, loops: u32, cost: f64) -> Result<()> {
    let repo = state
        .repos
        .get_mut(name)
        .ok_or_else(|| anyhow!("repo not found: {name}"))?;
    repo.loops = loops;
    repo.cost_usd = cost;
    state.total_cost_usd = state.repos.values().map(|repo| repo.cost_usd).sum();
    Ok(())
}

fn save_state<S: StateStore>(store: &S, state: &OrchestrationState) -> Result<()> {
    store
        .save(ORCHESTRATION, state)
        .context("persist orchestration state")
}
