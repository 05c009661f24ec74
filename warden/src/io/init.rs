//! Initialization helpers for `.warden/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{WardenConfig, write_config};

/// All canonical paths within `.warden/` for a project root.
#[derive(Debug, Clone)]
pub struct WardenPaths {
    pub root: PathBuf,
    pub warden_dir: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub repos_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub prompt_path: PathBuf,
}

impl WardenPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let warden_dir = root.join(".warden");
        Self {
            root: root.clone(),
            state_dir: warden_dir.join("state"),
            logs_dir: warden_dir.join("logs"),
            repos_dir: warden_dir.join("repos"),
            gitignore_path: warden_dir.join(".gitignore"),
            config_path: warden_dir.join("config.toml"),
            prompt_path: warden_dir.join("PROMPT.md"),
            warden_dir,
        }
    }

    /// Per-repo scope used in multi-job mode, so each job keeps its own
    /// retry table and breaker.
    pub fn for_repo(&self, name: &str) -> WardenPaths {
        let warden_dir = self.repos_dir.join(name);
        WardenPaths {
            root: self.root.clone(),
            state_dir: warden_dir.join("state"),
            logs_dir: warden_dir.join("logs"),
            repos_dir: self.repos_dir.clone(),
            gitignore_path: self.gitignore_path.clone(),
            config_path: self.config_path.clone(),
            prompt_path: self.prompt_path.clone(),
            warden_dir,
        }
    }
}

/// Options for `init_warden`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing warden-owned files.
    pub force: bool,
}

/// Create `.warden/` scaffolding in `root`.
///
/// Fails if `.warden/` already exists unless `options.force` is set.
pub fn init_warden(root: &Path, options: &InitOptions) -> Result<WardenPaths> {
    let paths = WardenPaths::new(root);
    if paths.warden_dir.exists() && !paths.warden_dir.is_dir() {
        return Err(anyhow!("warden init: .warden exists but is not a directory"));
    }
    if paths.warden_dir.exists() && !options.force {
        return Err(anyhow!(
            "warden init: .warden already exists (use --force to overwrite)"
        ));
    }

    create_dir(&paths.state_dir)?;
    create_dir(&paths.logs_dir)?;

    write_file(&paths.gitignore_path, WARDEN_GITIGNORE)?;
    write_file(&paths.prompt_path, PROMPT_PLACEHOLDER)?;
    write_config(&paths.config_path, &WardenConfig::default())?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

const PROMPT_PLACEHOLDER: &str = "# Task\n\nDescribe what the worker should do on every loop.\n\
When the work is finished, print WARDEN_COMPLETE on its own line.\n";
const WARDEN_GITIGNORE: &str = "state/\nlogs/\nrepos/\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_warden(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.state_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
        assert!(paths.prompt_path.is_file());
        assert_eq!(
            fs::read_to_string(&paths.gitignore_path).expect("read"),
            WARDEN_GITIGNORE
        );
        assert_eq!(
            load_config(&paths.config_path).expect("config"),
            WardenConfig::default()
        );
    }

    #[test]
    fn init_without_force_refuses_existing_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_warden(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_warden(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_prompt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_warden(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.prompt_path, "custom").expect("write custom");
        init_warden(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(
            fs::read_to_string(&paths.prompt_path).expect("read"),
            PROMPT_PLACEHOLDER
        );
    }

    #[test]
    fn repo_scope_nests_under_repos_dir() {
        let paths = WardenPaths::new("/work");
        let scoped = paths.for_repo("api");
        assert_eq!(scoped.state_dir, PathBuf::from("/work/.warden/repos/api/state"));
        assert_eq!(scoped.logs_dir, PathBuf::from("/work/.warden/repos/api/logs"));
        assert_eq!(scoped.config_path, paths.config_path);
    }
}
