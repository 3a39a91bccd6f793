//! Cycle Detection
//!
//! Tarjan's strongly-connected-components algorithm, written iteratively so
//! long dependency chains cannot overflow the stack.
//!
//! A node that references itself forms a trivial component of size one, so
//! self-loops are collected separately from the multi-node components.

use std::collections::HashSet;

const UNVISITED: usize = usize::MAX;

/// Cycles found in a dependency graph.
///
/// Both lists are sorted by name so reports are deterministic. A node may
/// appear in both when it references itself and is part of a larger cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cycles {
    /// Nodes that reference themselves.
    pub self_loops: Vec<String>,
    /// Strongly connected components with more than one member.
    pub components: Vec<Vec<String>>,
}

impl Cycles {
    pub fn is_empty(&self) -> bool {
        self.self_loops.is_empty() && self.components.is_empty()
    }

    /// Every node that takes part in some cycle.
    pub fn members(&self) -> HashSet<String> {
        self.self_loops
            .iter()
            .chain(self.components.iter().flatten())
            .cloned()
            .collect()
    }

    pub(crate) fn from_parts(mut self_loops: Vec<String>, components: Vec<Vec<String>>) -> Self {
        self_loops.sort();
        let mut components: Vec<Vec<String>> = components
            .into_iter()
            .map(|mut c| {
                c.sort();
                c
            })
            .collect();
        components.sort();
        Self {
            self_loops,
            components,
        }
    }
}

/// Strongly connected components of a graph given as adjacency lists.
///
/// Components are emitted in reverse topological order of the condensation.
pub(crate) fn strongly_connected(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    let n = adjacency.len();
    let mut index = vec![UNVISITED; n];
    let mut low = vec![0; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut next = 0;
    let mut components = Vec::new();

    // (node, position of the next successor to visit)
    let mut work: Vec<(usize, usize)> = Vec::new();

    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        index[root] = next;
        low[root] = next;
        next += 1;
        stack.push(root);
        on_stack[root] = true;
        work.push((root, 0));

        while let Some((v, pos)) = work.last().copied() {
            if let Some(&w) = adjacency[v].get(pos) {
                if let Some(top) = work.last_mut() {
                    top.1 += 1;
                }
                if index[w] == UNVISITED {
                    index[w] = next;
                    low[w] = next;
                    next += 1;
                    stack.push(w);
                    on_stack[w] = true;
                    work.push((w, 0));
                } else if on_stack[w] {
                    low[v] = low[v].min(index[w]);
                }
                continue;
            }

            work.pop();
            if let Some(&(parent, _)) = work.last() {
                low[parent] = low[parent].min(low[v]);
            }
            if low[v] == index[v] {
                let mut component = Vec::new();
                while let Some(w) = stack.pop() {
                    on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                components.push(component);
            }
        }
    }

    components
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut components: Vec<Vec<usize>>) -> Vec<Vec<usize>> {
        for c in &mut components {
            c.sort();
        }
        components.sort();
        components
    }

    #[test]
    fn finds_multi_node_components() {
        // 0 -> 1 -> 2 -> 0, 3 -> 0
        let adjacency = vec![vec![1], vec![2], vec![0], vec![0]];
        let components = sorted(strongly_connected(&adjacency));
        assert_eq!(components, vec![vec![0, 1, 2], vec![3]]);
    }

    #[test]
    fn acyclic_graph_has_singleton_components() {
        let adjacency = vec![vec![1, 2], vec![2], vec![]];
        let components = strongly_connected(&adjacency);
        assert_eq!(components.len(), 3);
        // Reverse topological order: sinks first.
        assert_eq!(components[0], vec![2]);
    }

    #[test]
    fn long_chains_do_not_recurse() {
        let n = 100_000;
        let adjacency: Vec<Vec<usize>> = (0..n)
            .map(|i| if i + 1 < n { vec![i + 1] } else { vec![0] })
            .collect();
        let components = strongly_connected(&adjacency);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].len(), n);
    }

    #[test]
    fn members_unions_both_categories() {
        let cycles = Cycles::from_parts(
            vec!["s".into()],
            vec![vec!["y".into(), "x".into()]],
        );
        assert_eq!(cycles.components, vec![vec!["x".to_string(), "y".to_string()]]);
        let members = cycles.members();
        assert_eq!(members.len(), 3);
        assert!(members.contains("s"));
    }
}
