//! Git adapter used to measure worker progress.
//!
//! A loop "made progress" when files changed between the snapshot taken
//! before the worker ran and the worktree afterwards, whether the worker left
//! the changes uncommitted or committed them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Worktree state captured before a loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeSnapshot {
    pub head: Option<String>,
    pub status: BTreeMap<String, String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if `workdir` is inside a git worktree.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// HEAD commit, or `None` for a repository without commits.
    pub fn head(&self) -> Result<Option<String>> {
        let out = self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&out.stdout).trim().to_string()))
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn snapshot(&self) -> Result<WorktreeSnapshot> {
        let status = self
            .status_porcelain()?
            .into_iter()
            .map(|entry| (entry.path, entry.code))
            .collect();
        Ok(WorktreeSnapshot {
            head: self.head()?,
            status,
        })
    }

    /// Number of distinct files that changed since `before`.
    #[instrument(skip_all)]
    pub fn changed_files_since(&self, before: &WorktreeSnapshot) -> Result<usize> {
        let after = self.snapshot()?;
        let mut changed: BTreeSet<String> = after
            .status
            .iter()
            .filter(|(path, code)| before.status.get(*path) != Some(*code))
            .map(|(path, _)| path.clone())
            .collect();
        changed.extend(
            before
                .status
                .keys()
                .filter(|path| !after.status.contains_key(*path))
                .cloned(),
        );

        if after.head != before.head
            && let (Some(old), Some(new)) = (&before.head, &after.head)
        {
            let range = format!("{old}..{new}");
            let out = self.run_capture(&["diff", "--name-only", &range])?;
            changed.extend(out.lines().filter(|l| !l.trim().is_empty()).map(str::to_string));
        }

        debug!(changed = changed.len(), "worktree changes since snapshot");
        Ok(changed.len())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
