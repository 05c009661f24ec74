//! Per-graph scheduling bookkeeping: which repo runs next, what is done, what is stuck.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::graph::{RepoGraph, priority_rank};
use crate::error::GraphError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoState {
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl fmt::Display for RepoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoState::Pending => write!(f, "pending"),
            RepoState::InProgress => write!(f, "in_progress"),
            RepoState::Completed => write!(f, "completed"),
            RepoState::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub status: RepoState,
    pub path: PathBuf,
    pub loops: u32,
    pub cost_usd: f64,
    /// Dependencies that have not completed yet.
    pub blocked_by: BTreeSet<String>,
    pub block_reason: Option<String>,
    pub priority: Option<i64>,
    /// Declaration index, used to break priority ties.
    pub position: usize,
}

/// Persisted scheduler record (`orchestration.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub active: bool,
    pub repos: BTreeMap<String, RepoStatus>,
    pub completed_repos: Vec<String>,
    pub blocked_repos: Vec<String>,
    pub total_cost_usd: f64,
    pub current_repo: Option<String>,
}

/// Aggregate counts for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestrationSummary {
    pub active: bool,
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub blocked: usize,
    pub total_cost_usd: f64,
    pub current_repo: Option<String>,
}

/// Fresh state for a validated graph: everything pending, nothing spent.
///
/// `blocked_by` starts as each repo's declared dependencies and shrinks as
/// they complete.
pub fn init_orchestration_state(graph: &RepoGraph) -> OrchestrationState {
    let repos = graph
        .nodes()
        .iter()
        .enumerate()
        .map(|(position, node)| {
            (
                node.name.clone(),
                RepoStatus {
                    status: RepoState::Pending,
                    path: node.path.clone(),
                    loops: 0,
                    cost_usd: 0.0,
                    blocked_by: node.deps.clone(),
                    block_reason: None,
                    priority: node.priority,
                    position,
                },
            )
        })
        .collect();

    OrchestrationState {
        active: true,
        repos,
        completed_repos: Vec::new(),
        blocked_repos: Vec::new(),
        total_cost_usd: 0.0,
        current_repo: None,
    }
}

impl OrchestrationState {
    pub fn repo(&self, name: &str) -> Result<&RepoStatus, GraphError> {
        self.repos
            .get(name)
            .ok_or_else(|| GraphError::UnknownRepo(name.to_string()))
    }

    fn repo_mut(&mut self, name: &str) -> Result<&mut RepoStatus, GraphError> {
        self.repos
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownRepo(name.to_string()))
    }

    /// The runnable repo with the lowest priority, or `None` when all are done or stuck.
    pub fn get_next_repo(&self) -> Option<&str> {
        self.repos
            .iter()
            .filter(|(_, repo)| {
                matches!(repo.status, RepoState::Pending | RepoState::InProgress)
                    && repo.blocked_by.is_empty()
            })
            .min_by_key(|(_, repo)| {
                let (unset, value) = priority_rank(repo.priority);
                (unset, value, repo.position)
            })
            .map(|(name, _)| name.as_str())
    }

    pub fn is_repo_blocked(&self, name: &str) -> Result<bool, GraphError> {
        Ok(!self.repo(name)?.blocked_by.is_empty())
    }

    pub fn mark_repo_in_progress(&mut self, name: &str) -> Result<(), GraphError> {
        let repo = self.repo_mut(name)?;
        match repo.status {
            RepoState::Pending | RepoState::InProgress => {}
            other => return Err(invalid_transition(name, other, RepoState::InProgress)),
        }
        if !repo.blocked_by.is_empty() {
            return Err(GraphError::StillBlocked {
                repo: name.to_string(),
                blocked_by: repo.blocked_by.iter().cloned().collect(),
            });
        }
        repo.status = RepoState::InProgress;
        self.current_repo = Some(name.to_string());
        Ok(())
    }

    /// Record completion and release every repo that was waiting on `name`.
    pub fn mark_repo_complete(&mut self, name: &str, loops: u32, cost_usd: f64) -> Result<(), GraphError> {
        let repo = self.repo_mut(name)?;
        if repo.status == RepoState::Blocked {
            return Err(invalid_transition(name, repo.status, RepoState::Completed));
        }
        repo.status = RepoState::Completed;
        repo.loops = loops;
        repo.cost_usd = cost_usd;

        if !self.completed_repos.iter().any(|done| done == name) {
            self.completed_repos.push(name.to_string());
        }
        self.total_cost_usd = self.repos.values().map(|repo| repo.cost_usd).sum();
        for (other, repo) in &mut self.repos {
            if other != name {
                repo.blocked_by.remove(name);
            }
        }
        if self.current_repo.as_deref() == Some(name) {
            self.current_repo = None;
        }
        Ok(())
    }

    /// Park a repo until an operator intervenes. Dependents stay waiting on it.
    pub fn mark_repo_blocked(&mut self, name: &str, reason: &str) -> Result<(), GraphError> {
        let repo = self.repo_mut(name)?;
        if repo.status == RepoState::Completed {
            return Err(invalid_transition(name, repo.status, RepoState::Blocked));
        }
        repo.status = RepoState::Blocked;
        repo.block_reason = Some(reason.to_string());
        if !self.blocked_repos.iter().any(|blocked| blocked == name) {
            self.blocked_repos.push(name.to_string());
        }
        if self.current_repo.as_deref() == Some(name) {
            self.current_repo = None;
        }
        Ok(())
    }

    /// Manual recovery: return a blocked repo to `pending`.
    pub fn unblock_repo(&mut self, name: &str) -> Result<(), GraphError> {
        let repo = self.repo_mut(name)?;
        if repo.status != RepoState::Blocked {
            return Err(invalid_transition(name, repo.status, RepoState::Pending));
        }
        repo.status = RepoState::Pending;
        repo.block_reason = None;
        self.blocked_repos.retain(|blocked| blocked != name);
        self.active = true;
        Ok(())
    }

    /// Mark the run finished; no repo is current any more.
    pub fn finish(&mut self) {
        self.active = false;
        self.current_repo = None;
    }

    pub fn summary(&self) -> OrchestrationSummary {
        let count = |state: RepoState| self.repos.values().filter(|r| r.status == state).count();
        OrchestrationSummary {
            active: self.active,
            total: self.repos.len(),
            pending: count(RepoState::Pending),
            in_progress: count(RepoState::InProgress),
            completed: count(RepoState::Completed),
            blocked: count(RepoState::Blocked),
            total_cost_usd: self.total_cost_usd,
            current_repo: self.current_repo.clone(),
        }
    }
}

fn invalid_transition(repo: &str, from: RepoState, to: RepoState) -> GraphError {
    GraphError::InvalidTransition {
        repo: repo.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::graph::RepoNode;

    fn diamond_plus() -> RepoGraph {
        RepoGraph::new(vec![
            RepoNode::new("a", "/a"),
            RepoNode::new("d", "/d"),
            RepoNode::new("b", "/b").with_deps(&["a"]),
            RepoNode::new("c", "/c").with_deps(&["a", "d"]),
        ])
        .expect("graph")
    }

    #[test]
    fn init_marks_everything_pending() {
        let state = init_orchestration_state(&diamond_plus());
        assert!(state.active);
        assert_eq!(state.total_cost_usd, 0.0);
        assert!(state.repos.values().all(|r| r.status == RepoState::Pending));
        assert!(state.repos.values().all(|r| r.loops == 0));
        assert_eq!(state.current_repo, None);
    }

    #[test]
    fn completing_a_dependency_unblocks_only_fully_released_repos() {
        let mut state = init_orchestration_state(&diamond_plus());
        state.mark_repo_complete("a", 4, 1.25).expect("complete a");

        assert!(state.repo("b").expect("b").blocked_by.is_empty());
        assert_eq!(
            state.repo("c").expect("c").blocked_by,
            BTreeSet::from(["d".to_string()])
        );
        assert!(!state.is_repo_blocked("b").expect("b"));
        assert!(state.is_repo_blocked("c").expect("c"));
        assert_eq!(state.completed_repos, vec!["a"]);
        assert_eq!(state.total_cost_usd, 1.25);
    }

    #[test]
    fn next_repo_prefers_priority_then_declaration() {
        let graph = RepoGraph::new(vec![
            RepoNode::new("first", "/1"),
            RepoNode::new("urgent", "/2").with_priority(0),
            RepoNode::new("later", "/3").with_priority(10),
        ])
        .expect("graph");
        let mut state = init_orchestration_state(&graph);
        assert_eq!(state.get_next_repo(), Some("urgent"));
        state.mark_repo_complete("urgent", 1, 0.0).expect("complete");
        assert_eq!(state.get_next_repo(), Some("later"));
        state.mark_repo_complete("later", 1, 0.0).expect("complete");
        assert_eq!(state.get_next_repo(), Some("first"));
    }

    #[test]
    fn next_repo_skips_waiting_and_blocked() {
        let mut state = init_orchestration_state(&diamond_plus());
        assert_eq!(state.get_next_repo(), Some("a"));
        state.mark_repo_blocked("a", "circuit open").expect("block");
        assert_eq!(state.get_next_repo(), Some("d"));
        state.mark_repo_complete("d", 1, 0.5).expect("complete d");
        // b and c still wait on the blocked repo.
        assert_eq!(state.get_next_repo(), None);
        assert_eq!(state.blocked_repos, vec!["a"]);
        assert_eq!(
            state.repo("a").expect("a").block_reason.as_deref(),
            Some("circuit open")
        );
    }

    #[test]
    fn in_progress_requires_empty_blocked_by() {
        let mut state = init_orchestration_state(&diamond_plus());
        let err = state.mark_repo_in_progress("b").expect_err("still blocked");
        assert_eq!(
            err,
            GraphError::StillBlocked {
                repo: "b".to_string(),
                blocked_by: vec!["a".to_string()]
            }
        );
        state.mark_repo_in_progress("a").expect("a runnable");
        assert_eq!(state.current_repo.as_deref(), Some("a"));
        assert_eq!(state.get_next_repo(), Some("a"));
    }

    #[test]
    fn unblock_returns_repo_to_pending() {
        let mut state = init_orchestration_state(&diamond_plus());
        state.mark_repo_blocked("a", "halted").expect("block");
        state.finish();
        state.unblock_repo("a").expect("unblock");
        let repo = state.repo("a").expect("a");
        assert_eq!(repo.status, RepoState::Pending);
        assert_eq!(repo.block_reason, None);
        assert!(state.blocked_repos.is_empty());
        assert!(state.active);
        assert_eq!(state.get_next_repo(), Some("a"));
    }

    #[test]
    fn status_changes_are_guarded() {
        let mut state = init_orchestration_state(&diamond_plus());
        state.mark_repo_complete("a", 1, 0.0).expect("complete");
        assert!(matches!(
            state.mark_repo_blocked("a", "late"),
            Err(GraphError::InvalidTransition { .. })
        ));
        assert!(matches!(
            state.unblock_repo("a"),
            Err(GraphError::InvalidTransition { .. })
        ));
        assert_eq!(
            state.mark_repo_complete("ghost", 1, 0.0),
            Err(GraphError::UnknownRepo("ghost".to_string()))
        );
    }

    #[test]
    fn total_cost_is_sum_over_repos() {
        let mut state = init_orchestration_state(&diamond_plus());
        state.mark_repo_complete("a", 1, 1.5).expect("a");
        state.mark_repo_complete("d", 2, 2.0).expect("d");
        state.mark_repo_complete("b", 3, 0.25).expect("b");
        assert_eq!(state.total_cost_usd, 3.75);
        let summary = state.summary();
        assert_eq!(summary.completed, 3);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.total, 4);
    }

    #[test]
    fn independent_inits_do_not_share_state() {
        let graph = diamond_plus();
        let mut first = init_orchestration_state(&graph);
        let second = init_orchestration_state(&graph);
        first.mark_repo_complete("a", 1, 9.0).expect("complete");
        assert!(second.repos.values().all(|r| r.status == RepoState::Pending));
        assert_eq!(second.total_cost_usd, 0.0);
        assert_ne!(first, second);
    }
}
