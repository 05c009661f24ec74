//! Loading the multi-repo job declaration (`repos.json`).
//!
//! ```json
//! [
//!   { "name": "core", "path": "./core", "deps": [] },
//!   { "name": "api", "path": "./api", "deps": ["core"], "priority": 1 }
//! ]
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;

use crate::core::graph::{RepoGraph, RepoNode};
use crate::error::RepoConfigError;

/// Parse and check a declaration file. Relative paths resolve against the
/// file's directory and must exist.
///
/// Structural graph checks (unknown deps, cycles) are left to
/// [`crate::core::graph::validate_graph`].
pub fn load_repo_config(path: &Path) -> Result<RepoGraph, RepoConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| RepoConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let graph = parse_repo_config(path, &contents, base)?;
    debug!(path = %path.display(), repos = graph.len(), "repo config loaded");
    Ok(graph)
}

/// Parse declaration `contents`; `source` is only used in error messages.
pub fn parse_repo_config(
    source: &Path,
    contents: &str,
    base: &Path,
) -> Result<RepoGraph, RepoConfigError> {
    let value: Value = serde_json::from_str(contents).map_err(|err| RepoConfigError::Parse {
        path: source.to_path_buf(),
        source: err,
    })?;
    let Value::Array(entries) = value else {
        return Err(RepoConfigError::NotAnArray {
            path: source.to_path_buf(),
        });
    };

    let mut nodes = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let fields = EntryFields {
            source,
            index,
            object: entry.as_object().ok_or_else(|| RepoConfigError::InvalidField {
                path: source.to_path_buf(),
                index,
                field: "entry",
                expected: "must be an object",
            })?,
        };
        let name = fields.required_str("name")?;
        let declared_path = fields.required_str("path")?;
        let deps = fields.deps()?;
        let priority = fields.priority()?;

        let repo_path = resolve_path(base, declared_path);
        if !repo_path.exists() {
            return Err(RepoConfigError::PathNotFound {
                path: source.to_path_buf(),
                name: name.to_string(),
                repo_path,
            });
        }

        nodes.push(RepoNode {
            name: name.to_string(),
            path: repo_path,
            deps,
            priority,
        });
    }

    Ok(RepoGraph::new(nodes)?)
}

fn resolve_path(base: &Path, declared: &str) -> PathBuf {
    let declared = Path::new(declared);
    if declared.is_absolute() {
        declared.to_path_buf()
    } else {
        base.join(declared)
    }
}

struct EntryFields<'a> {
    source: &'a Path,
    index: usize,
    object: &'a Map<String, Value>,
}

impl<'a> EntryFields<'a> {
    fn missing(&self, field: &'static str) -> RepoConfigError {
        RepoConfigError::MissingField {
            path: self.source.to_path_buf(),
            index: self.index,
            field,
        }
    }

    fn invalid(&self, field: &'static str, expected: &'static str) -> RepoConfigError {
        RepoConfigError::InvalidField {
            path: self.source.to_path_buf(),
            index: self.index,
            field,
            expected,
        }
    }

    fn required_str(&self, field: &'static str) -> Result<&'a str, RepoConfigError> {
        let value = self.object.get(field).ok_or_else(|| self.missing(field))?;
        let text = value
            .as_str()
            .ok_or_else(|| self.invalid(field, "must be a string"))?;
        if text.trim().is_empty() {
            return Err(self.invalid(field, "must not be empty"));
        }
        Ok(text)
    }

    fn deps(&self) -> Result<BTreeSet<String>, RepoConfigError> {
        let value = self.object.get("deps").ok_or_else(|| self.missing("deps"))?;
        let items = value
            .as_array()
            .ok_or_else(|| self.invalid("deps", "must be an array of repo names"))?;
        items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| self.invalid("deps", "must be an array of repo names"))
            })
            .collect()
    }

    fn priority(&self) -> Result<Option<i64>, RepoConfigError> {
        match self.object.get("priority") {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_i64()
                .map(Some)
                .ok_or_else(|| self.invalid("priority", "must be an integer")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;

    fn workspace(repos: &[&str]) -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        for repo in repos {
            fs::create_dir_all(temp.path().join(repo)).expect("create repo dir");
        }
        temp
    }

    fn write_config(temp: &tempfile::TempDir, contents: &str) -> PathBuf {
        let path = temp.path().join("repos.json");
        fs::write(&path, contents).expect("write config");
        path
    }

    #[test]
    fn loads_declarations_with_relative_paths() {
        let temp = workspace(&["core", "api"]);
        let path = write_config(
            &temp,
            r#"[
                {"name": "core", "path": "core", "deps": []},
                {"name": "api", "path": "./api", "deps": ["core"], "priority": 2}
            ]"#,
        );

        let graph = load_repo_config(&path).expect("load");
        assert_eq!(graph.len(), 2);
        let api = graph.get("api").expect("api");
        assert_eq!(api.path, temp.path().join("./api"));
        assert_eq!(api.deps, BTreeSet::from(["core".to_string()]));
        assert_eq!(api.priority, Some(2));
        assert_eq!(graph.get("core").expect("core").priority, None);
    }

    #[test]
    fn top_level_must_be_an_array() {
        let temp = workspace(&[]);
        let path = write_config(&temp, r#"{"name": "core"}"#);
        assert!(matches!(
            load_repo_config(&path),
            Err(RepoConfigError::NotAnArray { .. })
        ));
    }

    #[test]
    fn missing_field_names_entry_and_field() {
        let temp = workspace(&["core"]);
        let path = write_config(&temp, r#"[{"name": "core", "path": "core"}]"#);
        let err = load_repo_config(&path).expect_err("missing deps");
        assert!(matches!(
            err,
            RepoConfigError::MissingField {
                index: 0,
                field: "deps",
                ..
            }
        ));
        assert!(err.to_string().contains("entry 0 is missing required field 'deps'"));
    }

    #[test]
    fn wrong_types_are_reported() {
        let temp = workspace(&["core"]);
        let path = write_config(
            &temp,
            r#"[{"name": "core", "path": "core", "deps": [], "priority": "high"}]"#,
        );
        assert!(matches!(
            load_repo_config(&path),
            Err(RepoConfigError::InvalidField {
                field: "priority",
                ..
            })
        ));
    }

    #[test]
    fn missing_repo_path_is_reported() {
        let temp = workspace(&[]);
        let path = write_config(&temp, r#"[{"name": "core", "path": "nowhere", "deps": []}]"#);
        let err = load_repo_config(&path).expect_err("missing path");
        assert!(matches!(err, RepoConfigError::PathNotFound { ref name, .. } if name == "core"));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let temp = workspace(&["core"]);
        let path = write_config(
            &temp,
            r#"[
                {"name": "core", "path": "core", "deps": []},
                {"name": "core", "path": "core", "deps": []}
            ]"#,
        );
        assert!(matches!(
            load_repo_config(&path),
            Err(RepoConfigError::Graph(GraphError::DuplicateRepo(name))) if name == "core"
        ));
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let temp = workspace(&[]);
        let path = write_config(&temp, "[{");
        assert!(matches!(
            load_repo_config(&path),
            Err(RepoConfigError::Parse { .. })
        ));
    }

    #[test]
    fn unreadable_file_is_an_io_error() {
        let temp = workspace(&[]);
        assert!(matches!(
            load_repo_config(&temp.path().join("absent.json")),
            Err(RepoConfigError::Io { .. })
        ));
    }
}
