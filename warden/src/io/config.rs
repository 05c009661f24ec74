//! Supervisor configuration stored under `.warden/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::circuit::CircuitThresholds;
use crate::core::retry::RetryPolicy;

/// Supervisor configuration (TOML).
///
/// Edited by humans; every section is optional and missing fields fall back
/// to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct WardenConfig {
    pub retry: RetryPolicy,
    pub circuit: CircuitThresholds,
    pub supervise: SuperviseConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SuperviseConfig {
    /// Hard cap on loops per job, independent of the breaker.
    pub max_loops: u32,
}

impl Default for SuperviseConfig {
    fn default() -> Self {
        Self { max_loops: 50 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker argv; the rendered prompt is written to its stdin.
    pub command: Vec<String>,

    /// Wall-clock budget for a single loop in seconds.
    pub timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "claude".to_string(),
                "--print".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            timeout_secs: 15 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

impl WardenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be > 0"));
        }
        if self.retry.backoff_multiplier == 0 {
            return Err(anyhow!("retry.backoff_multiplier must be > 0"));
        }
        if self.retry.backoff_max_secs < self.retry.backoff_initial_secs {
            return Err(anyhow!(
                "retry.backoff_max_secs must be >= retry.backoff_initial_secs"
            ));
        }
        let circuit = &self.circuit;
        for (name, value) in [
            ("no_progress_threshold", circuit.no_progress_threshold),
            ("same_error_threshold", circuit.same_error_threshold),
            ("output_decline_threshold", circuit.output_decline_threshold),
            ("permission_denial_threshold", circuit.permission_denial_threshold),
        ] {
            if value == 0 {
                return Err(anyhow!("circuit.{name} must be > 0"));
            }
        }
        if circuit.output_decline_threshold > 100 {
            return Err(anyhow!("circuit.output_decline_threshold must be <= 100"));
        }
        if self.supervise.max_loops == 0 {
            return Err(anyhow!("supervise.max_loops must be > 0"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self.worker.timeout_secs == 0 {
            return Err(anyhow!("worker.timeout_secs must be > 0"));
        }
        if self.worker.output_limit_bytes == 0 {
            return Err(anyhow!("worker.output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `WardenConfig::default()`.
pub fn load_config(path: &Path) -> Result<WardenConfig> {
    if !path.exists() {
        let cfg = WardenConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: WardenConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &WardenConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, WardenConfig::default());
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.circuit.cooldown_secs, 1800);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = WardenConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[circuit]\nno_progress_threshold = 7\n\n[supervise]\nmax_loops = 4\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.circuit.no_progress_threshold, 7);
        assert_eq!(cfg.circuit.same_error_threshold, 5);
        assert_eq!(cfg.supervise.max_loops, 4);
        assert_eq!(cfg.retry, RetryPolicy::default());
        assert_eq!(cfg.worker, WorkerConfig::default());
    }

    #[test]
    fn zero_thresholds_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[circuit]\nsame_error_threshold = 0\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("circuit.same_error_threshold must be > 0"));
    }

    #[test]
    fn negative_values_fail_to_parse() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[retry]\nmax_attempts = -1\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn empty_worker_command_is_rejected() {
        let cfg = WardenConfig {
            worker: WorkerConfig {
                command: Vec::new(),
                ..WorkerConfig::default()
            },
            ..WardenConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
