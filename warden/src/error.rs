//! Typed errors callers need to tell apart.
//!
//! Everything else in the crate travels as `anyhow::Error` with context.

use std::path::PathBuf;

use thiserror::Error;

/// Job-graph declaration problems, reported before any state is created.
#[derive(Debug, Error)]
pub enum RepoConfigError {
    #[error("repo config {}: expected a JSON array of repo declarations", .path.display())]
    NotAnArray { path: PathBuf },

    #[error("repo config {}: entry {index} is missing required field '{field}'", .path.display())]
    MissingField {
        path: PathBuf,
        index: usize,
        field: &'static str,
    },

    #[error("repo config {}: entry {index} field '{field}' {expected}", .path.display())]
    InvalidField {
        path: PathBuf,
        index: usize,
        field: &'static str,
        expected: &'static str,
    },

    #[error("repo config {}: path does not exist for repo '{name}': {}", .path.display(), .repo_path.display())]
    PathNotFound {
        path: PathBuf,
        name: String,
        repo_path: PathBuf,
    },

    #[error("repo config {}: invalid JSON: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("read repo config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Structural problems in a dependency graph or invalid scheduler operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("duplicate repo name: {0}")]
    DuplicateRepo(String),

    #[error("repo '{repo}' depends on unknown repo '{dep}'")]
    UnknownDependency { repo: String, dep: String },

    #[error("circular dependency detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("execution order incomplete; unresolved repos: {}", .0.join(", "))]
    IncompleteOrder(Vec<String>),

    #[error("repo not found: {0}")]
    UnknownRepo(String),

    #[error("repo '{repo}' is still waiting on: {}", .blocked_by.join(", "))]
    StillBlocked { repo: String, blocked_by: Vec<String> },

    #[error("repo '{repo}' cannot move from {from} to {to}")]
    InvalidTransition {
        repo: String,
        from: String,
        to: String,
    },
}
