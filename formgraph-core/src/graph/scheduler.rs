//! Update Scheduler
//!
//! The scheduler determines the order in which the expressions of one
//! feedback batch are evaluated. It ensures that an expression writing a
//! field runs before every expression reading that field.
//!
//! # Algorithm
//!
//! 1. Every affected expression becomes a node.
//! 2. An edge `writer -> reader` is added when the reader watches a path the
//!    writer derives.
//! 3. Kahn's algorithm emits nodes whose dependencies are all emitted. Ties
//!    are broken by key order, so the result is deterministic.
//! 4. Nodes left over by a cycle are appended in key order. The cycle then
//!    shows up as another feedback batch and is bounded there.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Orders items of one batch so dependencies come before dependents.
#[derive(Debug, Clone)]
pub struct UpdateScheduler<T: Ord + Copy> {
    /// Direct dependents of every node.
    dependents: BTreeMap<T, BTreeSet<T>>,
    /// Number of distinct dependencies of every node.
    in_degree: BTreeMap<T, usize>,
}

impl<T: Ord + Copy> UpdateScheduler<T> {
    /// Create a new empty scheduler.
    pub fn new() -> Self {
        Self {
            dependents: BTreeMap::new(),
            in_degree: BTreeMap::new(),
        }
    }

    /// Add a node to the batch. Adding it twice is a no-op.
    pub fn add_node(&mut self, node: T) {
        self.dependents.entry(node).or_default();
        self.in_degree.entry(node).or_insert(0);
    }

    /// Add a dependency edge: `dependent` depends on `dependency`.
    ///
    /// Self edges and edges to unknown nodes are ignored.
    pub fn add_edge(&mut self, dependency: T, dependent: T) {
        if dependency == dependent || !self.in_degree.contains_key(&dependent) {
            return;
        }
        let Some(dependents) = self.dependents.get_mut(&dependency) else {
            return;
        };
        if dependents.insert(dependent) {
            if let Some(degree) = self.in_degree.get_mut(&dependent) {
                *degree += 1;
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.in_degree.len()
    }

    /// Consume the scheduler and return its nodes in evaluation order.
    pub fn order(mut self) -> Vec<T> {
        let mut result = Vec::with_capacity(self.in_degree.len());
        let mut queue: VecDeque<T> = self
            .in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();

        // Kahn's algorithm
        while let Some(node) = queue.pop_front() {
            result.push(node);
            self.in_degree.remove(&node);

            if let Some(dependents) = self.dependents.get(&node) {
                for dependent in dependents {
                    if let Some(degree) = self.in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        // Whatever is left sits on a cycle.
        result.extend(self.in_degree.keys().copied());
        result
    }
}

impl<T: Ord + Copy> Default for UpdateScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_nodes_keep_key_order() {
        let mut scheduler = UpdateScheduler::new();
        for node in [3, 1, 2] {
            scheduler.add_node(node);
        }
        scheduler.add_node(1);
        assert_eq!(scheduler.node_count(), 3);
        assert_eq!(scheduler.order(), vec![1, 2, 3]);
    }

    #[test]
    fn dependencies_come_first() {
        // Chain: 3 -> 2 -> 1
        let mut scheduler = UpdateScheduler::new();
        for node in [1, 2, 3] {
            scheduler.add_node(node);
        }
        scheduler.add_edge(3, 2);
        scheduler.add_edge(2, 1);
        scheduler.add_edge(2, 1);

        assert_eq!(scheduler.order(), vec![3, 2, 1]);
    }

    #[test]
    fn cycles_are_appended() {
        let mut scheduler = UpdateScheduler::new();
        for node in [1, 2, 3] {
            scheduler.add_node(node);
        }
        scheduler.add_edge(1, 2);
        scheduler.add_edge(2, 1);
        scheduler.add_edge(3, 3);

        assert_eq!(scheduler.order(), vec![3, 1, 2]);
    }

    #[test]
    fn unknown_nodes_are_ignored() {
        let mut scheduler = UpdateScheduler::new();
        scheduler.add_node(1);
        scheduler.add_edge(1, 9);
        scheduler.add_edge(9, 1);
        assert_eq!(scheduler.order(), vec![1]);
    }
}
