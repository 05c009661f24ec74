//! Repo dependency graph: reference checks, cycle detection, execution order.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// One declared job in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoNode {
    pub name: String,
    pub path: PathBuf,
    pub deps: BTreeSet<String>,
    /// Lower runs first; unset sorts after every explicit priority.
    pub priority: Option<i64>,
}

impl RepoNode {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
            deps: BTreeSet::new(),
            priority: None,
        }
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.deps = deps.iter().map(|dep| dep.to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Sort key for priorities: explicit values ascending, unset last.
pub fn priority_rank(priority: Option<i64>) -> (bool, i64) {
    match priority {
        Some(value) => (false, value),
        None => (true, 0),
    }
}

/// Declared repos in declaration order, with unique names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoGraph {
    nodes: Vec<RepoNode>,
    index: HashMap<String, usize>,
}

impl RepoGraph {
    /// Build a graph, rejecting duplicate names. Dependencies are not checked here.
    pub fn new(nodes: Vec<RepoNode>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateRepo(node.name.clone()));
            }
        }
        Ok(Self { nodes, index })
    }

    pub fn nodes(&self) -> &[RepoNode] {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&RepoNode> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Every dependency must name a declared repo.
pub fn validate_references(graph: &RepoGraph) -> Result<(), GraphError> {
    for node in graph.nodes() {
        if let Some(dep) = node.deps.iter().find(|dep| graph.get(dep).is_none()) {
            return Err(GraphError::UnknownDependency {
                repo: node.name.clone(),
                dep: dep.clone(),
            });
        }
    }
    Ok(())
}

/// Iterative depth-first search for a dependency cycle (self-loops included).
///
/// Returns the cycle as a path that starts and ends on the same repo.
pub fn detect_circular_dependencies(graph: &RepoGraph) -> Result<(), GraphError> {
    let mut resolved: HashSet<&str> = HashSet::new();

    for start in graph.nodes() {
        if resolved.contains(start.name.as_str()) {
            continue;
        }

        let mut path: Vec<&str> = vec![start.name.as_str()];
        let mut on_path: HashSet<&str> = HashSet::from([start.name.as_str()]);
        let mut stack = vec![(start.name.as_str(), start.deps.iter())];

        while let Some(frame) = stack.last_mut() {
            let current = frame.0;
            match frame.1.next() {
                Some(dep) => {
                    let dep = dep.as_str();
                    if on_path.contains(dep) {
                        let from = path.iter().position(|name| *name == dep).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[from..].iter().map(|name| name.to_string()).collect();
                        cycle.push(dep.to_string());
                        return Err(GraphError::CycleDetected(cycle));
                    }
                    if resolved.contains(dep) {
                        continue;
                    }
                    // Unknown deps are reported by `validate_references`.
                    let Some(node) = graph.get(dep) else {
                        continue;
                    };
                    path.push(dep);
                    on_path.insert(dep);
                    stack.push((dep, node.deps.iter()));
                }
                None => {
                    stack.pop();
                    path.pop();
                    on_path.remove(current);
                    resolved.insert(current);
                }
            }
        }
    }

    Ok(())
}

/// Kahn's algorithm. Ready repos are taken by priority, then declaration order.
pub fn resolve_execution_order(graph: &RepoGraph) -> Result<Vec<String>, GraphError> {
    let mut in_degree: Vec<usize> = vec![0; graph.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); graph.len()];

    for (i, node) in graph.nodes().iter().enumerate() {
        for dep in &node.deps {
            if let Some(d) = graph.position(dep) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let rank = |i: usize| {
        let (unset, value) = priority_rank(graph.nodes()[i].priority);
        (unset, value, i)
    };

    let mut ready: BTreeSet<(bool, i64, usize)> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| rank(i))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some((_, _, i)) = ready.pop_first() {
        order.push(graph.nodes()[i].name.clone());
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(rank(dependent));
            }
        }
    }

    if order.len() != graph.len() {
        let remaining = graph
            .nodes()
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, node)| node.name.clone())
            .collect();
        return Err(GraphError::IncompleteOrder(remaining));
    }

    Ok(order)
}

/// Full structural validation: references, cycles, then ordering.
pub fn validate_graph(graph: &RepoGraph) -> Result<Vec<String>, GraphError> {
    validate_references(graph)?;
    detect_circular_dependencies(graph)?;
    resolve_execution_order(graph)
}
