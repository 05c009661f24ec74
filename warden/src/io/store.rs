//! Persistence for supervisor documents and append-only audit logs.
//!
//! Documents are whole-file JSON replaced atomically (temp file + rename).
//! Logs are JSON Lines; each append adds exactly one record.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::io::init::WardenPaths;

pub const RETRY_STATE: &str = "retry_state";
pub const CIRCUIT_BREAKER: &str = "circuit_breaker";
pub const ORCHESTRATION: &str = "orchestration";

pub const RETRY_LOG: &str = "retry_log";
pub const CIRCUIT_HISTORY: &str = "circuit_history";
pub const ORCHESTRATION_EVENTS: &str = "orchestration_events";

/// Named documents plus named append-only logs.
///
/// Implementors only move strings; the provided methods handle JSON.
pub trait StateStore {
    /// Current contents of a document, or `None` if it was never written.
    fn read_raw(&self, name: &str) -> Result<Option<String>>;

    fn write_raw(&self, name: &str, contents: &str) -> Result<()>;

    /// Append one line (without trailing newline) to a log.
    fn append_raw(&self, log: &str, line: &str) -> Result<()>;

    /// All lines of a log in append order; empty if the log does not exist.
    fn read_log_raw(&self, log: &str) -> Result<Vec<String>>;

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let Some(contents) = self.read_raw(name)? else {
            return Ok(None);
        };
        let value = serde_json::from_str(&contents).with_context(|| format!("parse {name}"))?;
        Ok(Some(value))
    }

    fn load_or_default<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        Ok(self.load(name)?.unwrap_or_default())
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let mut buf =
            serde_json::to_string_pretty(value).with_context(|| format!("serialize {name}"))?;
        buf.push('\n');
        self.write_raw(name, &buf)
    }

    fn append<T: Serialize>(&self, log: &str, record: &T) -> Result<()> {
        let line =
            serde_json::to_string(record).with_context(|| format!("serialize {log} record"))?;
        self.append_raw(log, &line)
    }

    fn read_records<T: DeserializeOwned>(&self, log: &str) -> Result<Vec<T>> {
        self.read_log_raw(log)?
            .iter()
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line).with_context(|| format!("parse {log} line {}", i + 1))
            })
            .collect()
    }
}

/// Documents under `state_dir/<name>.json`, logs under `logs_dir/<name>.jsonl`.
#[derive(Debug, Clone)]
pub struct FileStore {
    state_dir: PathBuf,
    logs_dir: PathBuf,
}

impl FileStore {
    pub fn new(state_dir: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            logs_dir: logs_dir.into(),
        }
    }

    pub fn for_paths(paths: &WardenPaths) -> Self {
        Self::new(paths.state_dir.clone(), paths.logs_dir.clone())
    }

    pub fn document_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{name}.json"))
    }

    pub fn log_path(&self, log: &str) -> PathBuf {
        self.logs_dir.join(format!("{log}.jsonl"))
    }
}

impl StateStore for FileStore {
    fn read_raw(&self, name: &str) -> Result<Option<String>> {
        let path = self.document_path(name);
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "loading document");
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        Ok(Some(contents))
    }

    fn write_raw(&self, name: &str, contents: &str) -> Result<()> {
        let path = self.document_path(name);
        debug!(path = %path.display(), "writing document");
        write_atomic(&path, contents)
    }

    fn append_raw(&self, log: &str, line: &str) -> Result<()> {
        let path = self.log_path(log);
        ensure_parent(&path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open log {}", path.display()))?;
        writeln!(file, "{line}").with_context(|| format!("append log {}", path.display()))?;
        Ok(())
    }

    fn read_log_raw(&self, log: &str) -> Result<Vec<String>> {
        let path = self.log_path(log);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read log {}", path.display()))?;
        Ok(contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    ensure_parent(path)?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp document {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace document {}", path.display()))?;
    Ok(())
}

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RefCell<BTreeMap<String, String>>,
    logs: RefCell<BTreeMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn read_raw(&self, name: &str) -> Result<Option<String>> {
        Ok(self.documents.borrow().get(name).cloned())
    }

    fn write_raw(&self, name: &str, contents: &str) -> Result<()> {
        self.documents
            .borrow_mut()
            .insert(name.to_string(), contents.to_string());
        Ok(())
    }

    fn append_raw(&self, log: &str, line: &str) -> Result<()> {
        self.logs
            .borrow_mut()
            .entry(log.to_string())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    fn read_log_raw(&self, log: &str) -> Result<Vec<String>> {
        Ok(self.logs.borrow().get(log).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Doc {
        count: u32,
        label: Option<String>,
    }

    fn exercise(store: &impl StateStore) {
        assert_eq!(store.load::<Doc>("doc").expect("load missing"), None);
        assert_eq!(store.load_or_default::<Doc>("doc").expect("default"), Doc::default());

        let doc = Doc {
            count: 2,
            label: Some("x".to_string()),
        };
        store.save("doc", &doc).expect("save");
        assert_eq!(store.load::<Doc>("doc").expect("load"), Some(doc));

        assert!(store.read_records::<Doc>("events").expect("empty log").is_empty());
        store.append("events", &Doc { count: 1, label: None }).expect("append 1");
        store.append("events", &Doc { count: 2, label: None }).expect("append 2");
        let records: Vec<Doc> = store.read_records("events").expect("records");
        assert_eq!(records.iter().map(|d| d.count).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn memory_store_behaves_like_a_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn file_store_behaves_like_a_store() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path().join("state"), temp.path().join("logs"));
        exercise(&store);

        assert!(temp.path().join("state/doc.json").is_file());
        assert!(!temp.path().join("state/doc.json.tmp").exists());
        let log = fs::read_to_string(temp.path().join("logs/events.jsonl")).expect("read log");
        assert_eq!(log.lines().count(), 2);
    }

    #[test]
    fn corrupt_document_reports_its_name() {
        let store = MemoryStore::new();
        store.write_raw(CIRCUIT_BREAKER, "{not json").expect("write");
        let err = store.load::<Doc>(CIRCUIT_BREAKER).expect_err("corrupt");
        assert!(err.to_string().contains("parse circuit_breaker"));
    }

    #[test]
    fn paths_follow_layout() {
        let paths = WardenPaths::new("/work");
        let store = FileStore::for_paths(&paths);
        assert_eq!(
            store.document_path(ORCHESTRATION),
            PathBuf::from("/work/.warden/state/orchestration.json")
        );
        assert_eq!(
            store.log_path(RETRY_LOG),
            PathBuf::from("/work/.warden/logs/retry_log.jsonl")
        );
    }
}
