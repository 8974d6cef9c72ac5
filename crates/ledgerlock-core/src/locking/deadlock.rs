//! Heuristic deadlock detection
//!
//! Builds a resource-to-resource graph from the `waiting_for` metadata of held
//! locks and looks for cycles with a depth-first search. The graph only knows
//! what callers annotate, so this is a safety valve and not a proof of
//! deadlock freedom.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use super::types::Lock;

/// Edges from a resource with held locks to the resources their owners wait on
#[derive(Debug, Default)]
pub(crate) struct WaitForGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl WaitForGraph {
    /// Build the graph from the held-lock registry
    pub(crate) fn from_held(held: &HashMap<String, Vec<Lock>>) -> Self {
        let mut graph = Self::default();
        for (resource_id, locks) in held {
            for lock in locks.iter().filter(|lock| lock.is_held()) {
                if let Some(target) = lock.metadata.waiting_for() {
                    graph.add_edge(resource_id, target);
                }
            }
        }
        graph
    }

    pub(crate) fn add_edge(&mut self, from: &str, to: &str) {
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    /// Resources from which a cycle was found.
    ///
    /// Starting points are visited in sorted order with a visited set shared
    /// across starts, so one cycle is reported once, at the first resource
    /// on it.
    pub(crate) fn deadlocked_resources(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut found = Vec::new();

        for resource_id in self.edges.keys() {
            if visited.contains(resource_id.as_str()) {
                continue;
            }
            let mut stack = HashSet::new();
            if self.has_cycle(resource_id, &mut visited, &mut stack) {
                found.push(resource_id.clone());
            }
        }

        found
    }

    fn has_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> bool {
        if stack.contains(node) {
            return true;
        }
        if !visited.insert(node) {
            return false;
        }

        stack.insert(node);
        let cyclic = self
            .edges
            .get(node)
            .into_iter()
            .flatten()
            .any(|next| self.has_cycle(next, visited, stack));
        stack.remove(node);

        cyclic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> WaitForGraph {
        let mut graph = WaitForGraph::default();
        for (from, to) in edges {
            graph.add_edge(from, to);
        }
        graph
    }

    #[test]
    fn test_no_edges_no_deadlock() {
        assert!(WaitForGraph::default().deadlocked_resources().is_empty());
    }

    #[test]
    fn test_chain_is_not_a_cycle() {
        let graph = graph(&[("a", "b"), ("b", "c")]);
        assert!(graph.deadlocked_resources().is_empty());
    }

    #[test]
    fn test_two_resource_cycle_reported_once() {
        let graph = graph(&[("b", "a"), ("a", "b")]);
        assert_eq!(graph.deadlocked_resources(), vec!["a".to_string()]);
    }

    #[test]
    fn test_self_wait_is_a_cycle() {
        let graph = graph(&[("a", "a")]);
        assert_eq!(graph.deadlocked_resources(), vec!["a".to_string()]);
    }

    #[test]
    fn test_separate_cycles_each_reported() {
        let graph = graph(&[("a", "b"), ("b", "a"), ("x", "y"), ("y", "x")]);
        assert_eq!(
            graph.deadlocked_resources(),
            vec!["a".to_string(), "x".to_string()]
        );
    }

    #[test]
    fn test_diamond_without_back_edge() {
        let graph = graph(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        assert!(graph.deadlocked_resources().is_empty());
    }
}
