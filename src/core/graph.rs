//! Dependency graph resolution.
//!
//! Turns "X depends on Y" declarations into ordered execution levels: every
//! node in a level depends only on nodes in strictly lower levels, so all
//! nodes of one level may run concurrently. The same resolver orders specs
//! within a spec set and tasks within a spec.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use crate::core::spec::{Spec, SpecId};
use crate::{sflog_debug, Error, Result};

/// A directed graph where an edge `a -> b` means "b depends on a".
///
/// Node indices follow insertion order, which is the declaration order used
/// to make level contents deterministic.
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    graph: DiGraph<K, ()>,
    index: HashMap<K, NodeIndex>,
}

/// Dependency graph over the specs of a spec set.
pub type SpecGraph = DependencyGraph<SpecId>;

impl<K> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self {
            graph: DiGraph::new(),
            index: HashMap::new(),
        }
    }
}

impl<K> DependencyGraph<K>
where
    K: Clone + Eq + Hash + Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Adding an existing key is a no-op.
    pub fn add_node(&mut self, key: K) -> NodeIndex {
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = self.graph.add_node(key.clone());
        self.index.insert(key, idx);
        idx
    }

    /// Record that `dependent` depends on `dependency`. Both must exist.
    pub fn add_dependency(&mut self, dependent: &K, dependency: &K) -> Result<()> {
        let to = *self
            .index
            .get(dependent)
            .ok_or_else(|| Error::Validation(format!("unknown node '{}'", dependent)))?;
        let from = *self.index.get(dependency).ok_or_else(|| Error::UnknownDependency {
            spec: dependent.to_string(),
            dependency: dependency.to_string(),
        })?;
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
        Ok(())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Keys in declaration order.
    pub fn nodes(&self) -> Vec<&K> {
        self.graph
            .node_indices()
            .filter_map(|i| self.graph.node_weight(i))
            .collect()
    }

    /// Nodes that depend directly on `key`, in declaration order.
    pub fn dependents(&self, key: &K) -> Vec<&K> {
        let Some(&idx) = self.index.get(key) else {
            return Vec::new();
        };
        let mut out: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        out.sort();
        out.into_iter()
            .filter_map(|i| self.graph.node_weight(i))
            .collect()
    }

    /// Number of direct dependencies of `key`.
    pub fn in_degree(&self, key: &K) -> usize {
        self.index
            .get(key)
            .map(|&idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .unwrap_or(0)
    }

    /// Find one dependency cycle, returned as a closed path (`a, b, a`).
    ///
    /// Depth-first search with an explicit recursion stack; a back edge to a
    /// node still on the stack closes a cycle.
    pub fn find_cycle(&self) -> Option<Vec<K>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut path: Vec<NodeIndex> = Vec::new();

        for root in self.graph.node_indices() {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }

            // Stack of (node, remaining successors).
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = Vec::new();
            marks[root.index()] = Mark::OnStack;
            path.push(root);
            stack.push((root, self.successors(root)));

            while let Some((node, pending)) = stack.last_mut() {
                let node = *node;
                match pending.pop() {
                    Some(next) => match marks[next.index()] {
                        Mark::OnStack => {
                            let start = path.iter().position(|&n| n == next).unwrap_or(0);
                            let mut cycle: Vec<K> = path[start..]
                                .iter()
                                .map(|&n| self.graph[n].clone())
                                .collect();
                            cycle.push(self.graph[next].clone());
                            return Some(cycle);
                        }
                        Mark::Unvisited => {
                            marks[next.index()] = Mark::OnStack;
                            path.push(next);
                            stack.push((next, self.successors(next)));
                        }
                        Mark::Done => {}
                    },
                    None => {
                        marks[node.index()] = Mark::Done;
                        path.pop();
                        stack.pop();
                    }
                }
            }
        }
        None
    }

    /// True when the graph contains at least one cycle.
    pub fn detect_cycles(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Decompose the graph into execution levels (Kahn's algorithm).
    ///
    /// Each round collects every remaining node with zero in-degree, in
    /// declaration order. Nodes left over once no zero in-degree node exists
    /// mean the graph is cyclic; that is reported as `CycleDetected`.
    pub fn levels(&self) -> Result<Vec<Vec<K>>> {
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|i| self.graph.neighbors_directed(i, Direction::Incoming).count())
            .collect();
        let mut placed = vec![false; self.graph.node_count()];
        let mut remaining = self.graph.node_count();
        let mut levels = Vec::new();

        while remaining > 0 {
            let ready: Vec<NodeIndex> = self
                .graph
                .node_indices()
                .filter(|i| !placed[i.index()] && in_degree[i.index()] == 0)
                .collect();

            if ready.is_empty() {
                let path = self.find_cycle().unwrap_or_else(|| {
                    self.graph
                        .node_indices()
                        .filter(|i| !placed[i.index()])
                        .map(|i| self.graph[i].clone())
                        .collect()
                });
                return Err(Error::CycleDetected {
                    path: path.iter().map(|k| k.to_string()).collect(),
                });
            }

            for &idx in &ready {
                placed[idx.index()] = true;
                remaining -= 1;
                for dependent in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                    in_degree[dependent.index()] -= 1;
                }
            }
            levels.push(ready.into_iter().map(|i| self.graph[i].clone()).collect());
        }

        Ok(levels)
    }

    fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut next: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        // Popped from the back, so visit lower indices first.
        next.sort_by(|a, b| b.cmp(a));
        next
    }
}

/// A set of specs that may run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLevel {
    pub index: usize,
    pub specs: Vec<SpecId>,
}

/// Build the spec dependency graph. Unknown dependencies are rejected.
pub fn build_graph(specs: &[Spec]) -> Result<SpecGraph> {
    let mut graph = SpecGraph::new();
    for spec in specs {
        graph.add_node(spec.id.clone());
    }
    for spec in specs {
        for dep in spec.dependency_ids() {
            graph.add_dependency(&spec.id, dep)?;
        }
    }
    sflog_debug!(
        "build_graph: {} specs, {} edges",
        graph.len(),
        graph.graph.edge_count()
    );
    Ok(graph)
}

/// True when the spec graph contains a dependency cycle.
pub fn detect_cycles(graph: &SpecGraph) -> bool {
    graph.detect_cycles()
}

/// Resolve the spec graph into execution levels.
///
/// A cyclic graph yields `CycleDetected` and no levels at all.
pub fn resolve_execution_levels(graph: &SpecGraph) -> Result<Vec<ExecutionLevel>> {
    if let Some(path) = graph.find_cycle() {
        return Err(Error::CycleDetected {
            path: path.iter().map(|id| id.to_string()).collect(),
        });
    }

    let levels: Vec<ExecutionLevel> = graph
        .levels()?
        .into_iter()
        .enumerate()
        .map(|(index, specs)| ExecutionLevel { index, specs })
        .collect();

    for level in &levels {
        sflog_debug!(
            "level {}: [{}]",
            level.index,
            level
                .specs
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    Ok(levels)
}

/// Convenience: build, check and resolve in one step.
pub fn plan_levels(specs: &[Spec]) -> Result<Vec<ExecutionLevel>> {
    resolve_execution_levels(&build_graph(specs)?)
}
