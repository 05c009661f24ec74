//! Test-only helpers: scripted workers, a recording sleeper, and job-graph
//! fixtures on disk.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tempfile::TempDir;

use crate::io::worker::{WorkReport, WorkRequest, Worker};
use crate::retry::Sleeper;

/// Sleeper that records requested durations instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

/// A loop that changed `files` files and reported nothing else.
pub fn progress(files: usize) -> WorkReport {
    WorkReport {
        output: "working".to_string(),
        output_bytes: 1_000,
        files_changed: files,
        ..WorkReport::default()
    }
}

/// A loop that changed files and signalled completion.
pub fn complete(files: usize) -> WorkReport {
    WorkReport {
        completed: true,
        ..progress(files)
    }
}

/// A loop that changed nothing.
pub fn idle() -> WorkReport {
    progress(0)
}

/// A loop that failed with `message`.
pub fn failure(message: &str) -> WorkReport {
    WorkReport {
        output: message.to_string(),
        output_bytes: 1_000,
        error: Some(message.to_string()),
        ..WorkReport::default()
    }
}

/// Worker that replays queued reports and records every request.
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    reports: RefCell<VecDeque<WorkReport>>,
    requests: RefCell<Vec<WorkRequest>>,
}

impl ScriptedWorker {
    pub fn new(reports: Vec<WorkReport>) -> Self {
        Self {
            reports: RefCell::new(reports.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<WorkRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.reports.borrow().len()
    }
}

impl Worker for ScriptedWorker {
    fn run(&self, request: &WorkRequest) -> Result<WorkReport> {
        self.requests.borrow_mut().push(request.clone());
        self.reports
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted worker has no report for loop {}", request.loop_number))
    }
}

/// Routes requests to a [`ScriptedWorker`] by working directory.
#[derive(Debug, Default)]
pub struct RoutedWorker {
    routes: BTreeMap<PathBuf, ScriptedWorker>,
}

impl RoutedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, workdir: impl Into<PathBuf>, reports: Vec<WorkReport>) -> Self {
        self.routes.insert(workdir.into(), ScriptedWorker::new(reports));
        self
    }

    pub fn calls(&self, workdir: &Path) -> usize {
        self.routes
            .get(workdir)
            .map(|worker| worker.requests().len())
            .unwrap_or(0)
    }
}

impl Worker for RoutedWorker {
    fn run(&self, request: &WorkRequest) -> Result<WorkReport> {
        self.routes
            .get(&request.workdir)
            .ok_or_else(|| anyhow!("no scripted route for {}", request.workdir.display()))?
            .run(request)
    }
}

/// A declared repo for [`RepoWorkspace`].
#[derive(Debug, Clone)]
pub struct RepoSpec {
    pub name: &'static str,
    pub deps: Vec<&'static str>,
    pub priority: Option<i64>,
}

pub fn repo(name: &'static str, deps: &[&'static str]) -> RepoSpec {
    RepoSpec {
        name,
        deps: deps.to_vec(),
        priority: None,
    }
}

/// Temp directory with one subdirectory per repo and a `repos.json`
/// declaration.
pub struct RepoWorkspace {
    temp: TempDir,
    config_path: PathBuf,
}

impl RepoWorkspace {
    pub fn new(repos: &[RepoSpec]) -> Result<Self> {
        let temp = tempfile::tempdir().context("create tempdir")?;
        let mut entries = Vec::with_capacity(repos.len());
        for spec in repos {
            let dir = temp.path().join("repos").join(spec.name);
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            let mut entry = json!({
                "name": spec.name,
                "path": format!("repos/{}", spec.name),
                "deps": spec.deps,
            });
            if let Some(priority) = spec.priority {
                entry["priority"] = json!(priority);
            }
            entries.push(entry);
        }
        let config_path = temp.path().join("repos.json");
        let contents = serde_json::to_string_pretty(&entries).context("serialize repos")?;
        fs::write(&config_path, contents).context("write repos.json")?;
        Ok(Self { temp, config_path })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Directory a repo's path resolves to.
    pub fn repo_dir(&self, name: &str) -> PathBuf {
        self.temp.path().join(format!("repos/{name}"))
    }
}
