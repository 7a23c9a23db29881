//! Arena-backed dependency graph.
//!
//! Nodes live in a vector; a `node-ID → index` map and per-reader dependency
//! sets sit alongside. This keeps topological sorting and cycle detection as
//! plain index arithmetic with no shared-ownership reference counting.
//!
//! Edges point dependency → dependent: a reader records the writers it
//! references, and those sets are replaced wholesale every time the reader
//! evaluates.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("node {0:?} is already present in the graph")]
    #[diagnostic(code(tributary::graph::duplicate))]
    Duplicate(String),

    #[error("cycle detected between nodes: {}", members.join(", "))]
    #[diagnostic(
        code(tributary::graph::cycle),
        help("Break the reference loop between these nodes.")
    )]
    Cycle { members: Vec<String> },
}

/// Anything with a stable node-ID can live in the arena.
pub trait Identified {
    fn node_id(&self) -> &str;
}

impl Identified for String {
    fn node_id(&self) -> &str {
        self
    }
}

/// A directed acyclic graph of identified payloads.
#[derive(Debug, Clone)]
pub struct Graph<N> {
    nodes: Vec<N>,
    index: FxHashMap<String, usize>,
    /// reader index → indices of the writers it depends on.
    deps: FxHashMap<usize, FxHashSet<usize>>,
}

impl<N> Default for Graph<N> {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            index: FxHashMap::default(),
            deps: FxHashMap::default(),
        }
    }
}

impl<N: Identified> Graph<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn insert(&mut self, node: N) -> Result<usize, GraphError> {
        let id = node.node_id().to_string();
        if self.index.contains_key(&id) {
            return Err(GraphError::Duplicate(id));
        }
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.index.insert(id, idx);
        Ok(idx)
    }

    pub fn get(&self, id: &str) -> Option<&N> {
        self.index.get(id).map(|&idx| &self.nodes[idx])
    }

    pub fn get_by_index(&self, idx: usize) -> &N {
        &self.nodes[idx]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &N> {
        self.nodes.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.node_id())
    }

    /// Replace the dependency set of a reader. Unknown writer IDs are
    /// ignored; the caller validates references before edges are recorded.
    pub fn set_dependencies(&mut self, reader: &str, writers: &[String]) {
        let Some(&reader_idx) = self.index.get(reader) else {
            return;
        };
        let set: FxHashSet<usize> = writers
            .iter()
            .filter_map(|w| self.index.get(w).copied())
            .filter(|&w| w != reader_idx)
            .collect();
        self.deps.insert(reader_idx, set);
    }

    pub fn dependencies_of(&self, id: &str) -> Vec<&str> {
        match self.index.get(id) {
            Some(idx) => self
                .deps
                .get(idx)
                .into_iter()
                .flatten()
                .map(|&w| self.nodes[w].node_id())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Transitive closure of readers downstream of the seed set. The seeds
    /// themselves are not included.
    pub fn dependents_closure(&self, seeds: &FxHashSet<String>) -> FxHashSet<String> {
        // writer → readers adjacency, derived on demand.
        let mut readers: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
        for (&reader, writers) in &self.deps {
            for &writer in writers {
                readers.entry(writer).or_default().push(reader);
            }
        }

        let mut visited: FxHashSet<usize> = FxHashSet::default();
        let mut queue: VecDeque<usize> = seeds
            .iter()
            .filter_map(|id| self.index.get(id).copied())
            .collect();
        let seed_idx: FxHashSet<usize> = queue.iter().copied().collect();
        while let Some(idx) = queue.pop_front() {
            for &reader in readers.get(&idx).into_iter().flatten() {
                if visited.insert(reader) {
                    queue.push_back(reader);
                }
            }
        }
        visited
            .difference(&seed_idx)
            .map(|&idx| self.nodes[idx].node_id().to_string())
            .collect()
    }

    /// Kahn's algorithm over the whole graph. Ties are broken by node-ID
    /// lexicographic order so evaluation is deterministic. A non-empty
    /// leftover means a cycle; its members are reported sorted.
    pub fn topo_order(&self) -> Result<Vec<String>, GraphError> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut readers: FxHashMap<usize, Vec<usize>> = FxHashMap::default();
        for (&reader, writers) in &self.deps {
            in_degree[reader] = writers.len();
            for &writer in writers {
                readers.entry(writer).or_default().push(reader);
            }
        }

        let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        ready.sort_by(|&a, &b| self.nodes[a].node_id().cmp(self.nodes[b].node_id()));
        let mut ready: VecDeque<usize> = ready.into();

        let mut order = Vec::with_capacity(n);
        while let Some(idx) = ready.pop_front() {
            order.push(self.nodes[idx].node_id().to_string());
            let mut unblocked = Vec::new();
            for &reader in readers.get(&idx).into_iter().flatten() {
                in_degree[reader] -= 1;
                if in_degree[reader] == 0 {
                    unblocked.push(reader);
                }
            }
            unblocked.sort_by(|&a, &b| self.nodes[a].node_id().cmp(self.nodes[b].node_id()));
            ready.extend(unblocked);
        }

        if order.len() != n {
            let placed: FxHashSet<&str> = order.iter().map(String::as_str).collect();
            let mut members: Vec<String> = self
                .nodes
                .iter()
                .map(|node| node.node_id())
                .filter(|id| !placed.contains(id))
                .map(str::to_string)
                .collect();
            members.sort();
            return Err(GraphError::Cycle { members });
        }
        Ok(order)
    }

    /// The subset of the full topological order restricted to `ids`.
    pub fn topo_order_subset(
        &self,
        ids: &FxHashSet<String>,
    ) -> Result<Vec<String>, GraphError> {
        Ok(self
            .topo_order()?
            .into_iter()
            .filter(|id| ids.contains(id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(ids: &[&str]) -> Graph<String> {
        let mut graph = Graph::new();
        for id in ids {
            graph.insert(id.to_string()).unwrap();
        }
        graph
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut graph = graph_of(&["a"]);
        assert!(matches!(
            graph.insert("a".to_string()),
            Err(GraphError::Duplicate(_))
        ));
    }

    #[test]
    fn topo_order_respects_dependencies() {
        let mut graph = graph_of(&["sum", "count", "pass"]);
        graph.set_dependencies("pass", &["count".to_string()]);
        graph.set_dependencies("sum", &["pass".to_string()]);
        let order = graph.topo_order().unwrap();
        let pos = |id: &str| order.iter().position(|o| o == id).unwrap();
        assert!(pos("count") < pos("pass"));
        assert!(pos("pass") < pos("sum"));
    }

    #[test]
    fn ties_break_lexicographically() {
        let mut graph = graph_of(&["b", "a", "c"]);
        graph.set_dependencies("c", &["a".to_string(), "b".to_string()]);
        let order = graph.topo_order().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_reported_with_members() {
        let mut graph = graph_of(&["a", "b", "c"]);
        graph.set_dependencies("a", &["b".to_string()]);
        graph.set_dependencies("b", &["a".to_string()]);
        match graph.topo_order() {
            Err(GraphError::Cycle { members }) => {
                assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn dependents_closure_is_transitive_and_excludes_seeds() {
        let mut graph = graph_of(&["a", "b", "c", "d"]);
        graph.set_dependencies("b", &["a".to_string()]);
        graph.set_dependencies("c", &["b".to_string()]);
        graph.set_dependencies("d", &["x".to_string()]); // unknown writer ignored
        let seeds: FxHashSet<String> = ["a".to_string()].into_iter().collect();
        let closure = graph.dependents_closure(&seeds);
        assert!(closure.contains("b"));
        assert!(closure.contains("c"));
        assert!(!closure.contains("a"));
        assert!(!closure.contains("d"));
    }

    #[test]
    fn self_reference_is_dropped() {
        let mut graph = graph_of(&["a"]);
        graph.set_dependencies("a", &["a".to_string()]);
        assert!(graph.topo_order().is_ok());
    }
}
