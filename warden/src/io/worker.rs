//! Worker abstraction for the supervised process.
//!
//! The [`Worker`] trait decouples the supervision loop from the process that
//! does the actual work. [`CommandWorker`] spawns the configured command;
//! tests use scripted workers that return canned reports.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::config::WorkerConfig;
use crate::io::git::{Git, WorktreeSnapshot};
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::COMPLETION_MARKER;

/// One unit of work handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    pub loop_number: u32,
}

/// What a worker observed while running one unit of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkReport {
    pub output: String,
    pub output_bytes: usize,
    pub files_changed: usize,
    /// Raw failure text, classified by the caller.
    pub error: Option<String>,
    /// The worker signalled the task is finished.
    pub completed: bool,
    pub cost_usd: f64,
}

/// Abstraction over worker backends.
pub trait Worker {
    /// Run one unit of work. `Err` is reserved for failures to run the
    /// worker at all; failures of the work itself go in [`WorkReport::error`].
    fn run(&self, request: &WorkRequest) -> Result<WorkReport>;
}

/// Worker that spawns the configured command with the prompt on stdin.
pub struct CommandWorker {
    config: WorkerConfig,
}

impl CommandWorker {
    pub fn new(config: WorkerConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        Ok(Self { config })
    }
}

impl Worker for CommandWorker {
    #[instrument(skip_all, fields(loop_number = request.loop_number, timeout_secs = self.config.timeout_secs))]
    fn run(&self, request: &WorkRequest) -> Result<WorkReport> {
        info!(workdir = %request.workdir.display(), program = %self.config.command[0], "starting worker");
        let tracker = ChangeTracker::capture(&request.workdir)?;

        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..])
            .current_dir(&request.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            Duration::from_secs(self.config.timeout_secs),
            self.config.output_limit_bytes,
        )
        .context("run worker command")?;

        let files_changed = tracker.changed_files()?;
        let stdout = output.stdout_lossy();
        let parsed = ParsedOutput::from_stdout(&stdout);

        let error = if output.timed_out {
            Some(format!(
                "worker timed out after {}s",
                self.config.timeout_secs
            ))
        } else if !output.status.success() || parsed.is_error {
            let stderr = output.stderr_lossy();
            let detail = [stderr.trim(), parsed.text.trim()]
                .into_iter()
                .find(|text| !text.is_empty())
                .unwrap_or("no output");
            Some(format!(
                "worker exited with status {:?}: {}",
                output.status.code(),
                tail(detail, 2_000)
            ))
        } else {
            None
        };

        if let Some(err) = &error {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, err = %tail(err, 200), "worker failed");
        }
        debug!(files_changed, output_bytes = output.stdout_len(), "worker finished");

        Ok(WorkReport {
            completed: parsed.text.lines().any(|line| line.trim() == COMPLETION_MARKER),
            output: parsed.text,
            output_bytes: output.stdout_len(),
            files_changed,
            error,
            cost_usd: parsed.cost_usd,
        })
    }
}

/// Stdout of the worker, unwrapped from a JSON result envelope if present.
#[derive(Debug, Clone, PartialEq)]
struct ParsedOutput {
    text: String,
    cost_usd: f64,
    is_error: bool,
}

impl ParsedOutput {
    /// Accepts `{"result": "...", "total_cost_usd": 0.12, "is_error": false}`;
    /// anything else is treated as plain text.
    fn from_stdout(stdout: &str) -> Self {
        let plain = || Self {
            text: stdout.to_string(),
            cost_usd: 0.0,
            is_error: false,
        };
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(stdout.trim()) else {
            return plain();
        };
        let Some(text) = map.get("result").and_then(Value::as_str) else {
            return plain();
        };
        Self {
            text: text.to_string(),
            cost_usd: map
                .get("total_cost_usd")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            is_error: map.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &text[start..]
}

/// Counts files changed by a loop: git status when available, otherwise a
/// size/mtime scan of the working directory.
enum ChangeTracker {
    Git(Git, WorktreeSnapshot),
    Scan(PathBuf, BTreeMap<PathBuf, (u64, Option<SystemTime>)>),
}

impl ChangeTracker {
    fn capture(workdir: &Path) -> Result<Self> {
        let git = Git::new(workdir);
        if git.is_repository() {
            let snapshot = git.snapshot().context("snapshot worktree")?;
            return Ok(ChangeTracker::Git(git, snapshot));
        }
        debug!(workdir = %workdir.display(), "not a git repository, scanning files");
        Ok(ChangeTracker::Scan(workdir.to_path_buf(), scan_files(workdir)?))
    }

    fn changed_files(&self) -> Result<usize> {
        match self {
            ChangeTracker::Git(git, snapshot) => git.changed_files_since(snapshot),
            ChangeTracker::Scan(workdir, before) => {
                let after = scan_files(workdir)?;
                let modified = after
                    .iter()
                    .filter(|(path, meta)| before.get(*path) != Some(*meta))
                    .count();
                let removed = before.keys().filter(|path| !after.contains_key(*path)).count();
                Ok(modified + removed)
            }
        }
    }
}

fn scan_files(root: &Path) -> Result<BTreeMap<PathBuf, (u64, Option<SystemTime>)>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries =
            fs::read_dir(&dir).with_context(|| format!("read directory {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            let name = entry.file_name();
            if name == ".git" || name == ".warden" {
                continue;
            }
            let meta = entry
                .metadata()
                .with_context(|| format!("stat {}", path.display()))?;
            if meta.is_dir() {
                pending.push(path);
            } else {
                files.insert(path, (meta.len(), meta.modified().ok()));
            }
        }
    }
    Ok(files)
}
