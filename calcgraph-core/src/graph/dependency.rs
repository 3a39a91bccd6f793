//! Dependency Graph
//!
//! The graph keeps one entry per name. An edge `a -> b` means calculation `a`
//! reads `b`; both directions are stored so that dependents and dependencies
//! can be walked without a scan.
//!
//! Every referenced name has an entry. Names that are referenced but not
//! defined get a [`NodeKind::Missing`](super::NodeKind::Missing) placeholder,
//! which is replaced in place when the real calculation arrives and pruned
//! once nothing refers to it.
//!
//! "Ancestors" of a node are the calculations that (transitively) read it,
//! i.e. the set that must be recomputed when it changes. "Descendants" are
//! the nodes it reads.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use indexmap::{IndexMap, IndexSet};

use crate::error::GraphError;
use crate::expr::StaticContext;

use super::cycles::{strongly_connected, Cycles};
use super::node::CalcNode;

#[derive(Debug, Clone)]
struct Entry {
    node: CalcNode,

    /// Names this node reads.
    dependencies: IndexSet<String>,

    /// Names of the nodes that read this one.
    dependents: IndexSet<String>,
}

impl Entry {
    fn new(node: CalcNode) -> Self {
        Self {
            node,
            dependencies: IndexSet::new(),
            dependents: IndexSet::new(),
        }
    }
}

/// Directed graph over calculation nodes, keyed by name.
///
/// Iteration follows insertion order, which is also the tie-break for
/// topological ordering.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: IndexMap<String, Entry>,
}

impl DependencyGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a list of calculations.
    ///
    /// All nodes are inserted before any edge so that forward references do
    /// not create placeholders.
    pub fn from_calcs(calcs: impl IntoIterator<Item = CalcNode>) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        let mut names = Vec::new();
        for calc in calcs {
            if graph.nodes.contains_key(calc.name()) {
                return Err(GraphError::DuplicateName(calc.name().to_string()));
            }
            names.push(calc.name().to_string());
            graph.nodes.insert(calc.name().to_string(), Entry::new(calc));
        }
        for name in &names {
            graph.add_calc_edges(name);
        }
        Ok(graph)
    }

    /// Add a calculation.
    ///
    /// A `Missing` placeholder with the same name is replaced in place: the
    /// nodes that referenced the placeholder now reference the calculation.
    pub fn add_calc(&mut self, node: CalcNode) -> Result<(), GraphError> {
        let name = node.name().to_string();
        match self.nodes.get_mut(&name) {
            Some(entry) if !entry.node.is_missing() => {
                return Err(GraphError::DuplicateName(name));
            }
            Some(entry) => {
                tracing::debug!(%name, "replacing missing placeholder");
                entry.node = node;
                entry.dependencies.clear();
            }
            None => {
                tracing::debug!(%name, "adding calculation");
                self.nodes.insert(name.clone(), Entry::new(node));
            }
        }
        self.add_calc_edges(&name);
        self.remove_unused_missing();
        Ok(())
    }

    /// Remove a calculation, returning it.
    ///
    /// If other calculations still reference the name, a `Missing`
    /// placeholder takes its place.
    pub fn remove_calc(&mut self, name: &str) -> Result<CalcNode, GraphError> {
        match self.nodes.get(name) {
            Some(entry) if !entry.node.is_missing() => {}
            _ => return Err(GraphError::UnknownNode(name.to_string())),
        }
        let Some(entry) = self.nodes.shift_remove(name) else {
            return Err(GraphError::UnknownNode(name.to_string()));
        };
        tracing::debug!(%name, "removing calculation");

        for dep in &entry.dependencies {
            if let Some(dep_entry) = self.nodes.get_mut(dep) {
                dep_entry.dependents.shift_remove(name);
            }
        }

        let referrers: IndexSet<String> = entry
            .dependents
            .iter()
            .filter(|r| r.as_str() != name)
            .cloned()
            .collect();
        if !referrers.is_empty() {
            let mut placeholder = Entry::new(CalcNode::missing(name));
            placeholder.dependents = referrers;
            self.nodes.insert(name.to_string(), placeholder);
        }

        self.remove_unused_missing();
        Ok(entry.node)
    }

    /// Rename a calculation. Dependents of the old name are left pointing at
    /// a placeholder (if any remain) and placeholders for the new name are
    /// replaced, exactly as a remove followed by an add.
    pub fn rename_calc(&mut self, name: &str, new_name: &str) -> Result<(), GraphError> {
        if name == new_name {
            return if self.is_real(name) {
                Ok(())
            } else {
                Err(GraphError::UnknownNode(name.to_string()))
            };
        }
        if self.is_real(new_name) {
            return Err(GraphError::DuplicateName(new_name.to_string()));
        }
        let mut node = self.remove_calc(name)?;
        node.set_name(new_name);
        self.add_calc(node)
    }

    /// Replace a calculation's expression and recompute its edges.
    pub fn change_calc_expr(&mut self, name: &str, expr: &str) -> Result<(), GraphError> {
        let mut node = self.remove_calc(name)?;
        node.set_expr(expr);
        self.add_calc(node)
    }

    /// Update the enabled flag; no structural change.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<(), GraphError> {
        match self.nodes.get_mut(name) {
            Some(entry) if !entry.node.is_missing() => {
                entry.node.set_enabled(enabled);
                Ok(())
            }
            _ => Err(GraphError::UnknownNode(name.to_string())),
        }
    }

    fn add_calc_edges(&mut self, name: &str) {
        let deps: Vec<String> = match self.nodes.get(name) {
            Some(entry) => entry.node.deps().to_vec(),
            None => return,
        };
        for dep in deps {
            if !self.nodes.contains_key(&dep) {
                self.nodes
                    .insert(dep.clone(), Entry::new(CalcNode::missing(dep.as_str())));
            }
            self.add_edge(name, &dep);
        }
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        if let Some(entry) = self.nodes.get_mut(from) {
            entry.dependencies.insert(to.to_string());
        }
        if let Some(entry) = self.nodes.get_mut(to) {
            entry.dependents.insert(from.to_string());
        }
    }

    fn remove_unused_missing(&mut self) {
        self.nodes
            .retain(|_, entry| !(entry.node.is_missing() && entry.dependents.is_empty()));
    }

    /// Whether any node, real or placeholder, has this name.
    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Whether a real calculation has this name.
    pub fn is_real(&self, name: &str) -> bool {
        self.get(name).is_some_and(|node| !node.is_missing())
    }

    pub fn get(&self, name: &str) -> Option<&CalcNode> {
        self.nodes.get(name).map(|entry| &entry.node)
    }

    /// All nodes in insertion order, placeholders included.
    pub fn nodes(&self) -> impl Iterator<Item = &CalcNode> {
        self.nodes.values().map(|entry| &entry.node)
    }

    /// Real calculations in insertion order.
    pub fn calcs(&self) -> impl Iterator<Item = &CalcNode> {
        self.nodes().filter(|node| !node.is_missing())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of dependency edges.
    pub fn edge_count(&self) -> usize {
        self.nodes.values().map(|entry| entry.dependencies.len()).sum()
    }

    /// Direct dependencies of a node.
    pub fn successor_calcs(&self, name: &str) -> Vec<&str> {
        self.nodes
            .get(name)
            .map(|entry| entry.dependencies.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Direct dependents of a node.
    pub fn predecessor_calcs(&self, name: &str) -> Vec<&str> {
        self.nodes
            .get(name)
            .map(|entry| entry.dependents.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Every node that transitively reads `name` (not including `name`).
    pub fn ancestor_calcs(&self, name: &str) -> IndexSet<String> {
        self.reachable(name, |entry| &entry.dependents)
    }

    /// Every node `name` transitively reads (not including `name`).
    pub fn descendant_calcs(&self, name: &str) -> IndexSet<String> {
        self.reachable(name, |entry| &entry.dependencies)
    }

    fn reachable(&self, name: &str, next: impl Fn(&Entry) -> &IndexSet<String>) -> IndexSet<String> {
        let mut seen = IndexSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(name);

        while let Some(current) = queue.pop_front() {
            if let Some(entry) = self.nodes.get(current) {
                for other in next(entry) {
                    if other != name && seen.insert(other.clone()) {
                        queue.push_back(other.as_str());
                    }
                }
            }
        }
        seen
    }

    /// Self-referencing nodes and multi-node cycles, reported separately.
    pub fn cycles(&self) -> Cycles {
        let adjacency: Vec<Vec<usize>> = self
            .nodes
            .values()
            .map(|entry| {
                entry
                    .dependencies
                    .iter()
                    .filter_map(|dep| self.nodes.get_index_of(dep))
                    .collect()
            })
            .collect();

        let components = strongly_connected(&adjacency)
            .into_iter()
            .filter(|component| component.len() > 1)
            .map(|component| {
                component
                    .into_iter()
                    .filter_map(|i| self.nodes.get_index(i).map(|(name, _)| name.clone()))
                    .collect()
            })
            .collect();

        let self_loops = self
            .nodes
            .iter()
            .filter(|(name, entry)| entry.dependencies.contains(name.as_str()))
            .map(|(name, _)| name.clone())
            .collect();

        Cycles::from_parts(self_loops, components)
    }

    /// Every node that is part of any cycle.
    pub fn nodes_in_cycles(&self) -> HashSet<String> {
        self.cycles().members()
    }

    /// Global validity of one node: statically valid, not in a cycle, and
    /// every transitive dependency valid.
    pub fn node_valid(&self, name: &str, ctx: &StaticContext) -> bool {
        let cycle_members = self.nodes_in_cycles();
        let mut memo = HashMap::new();
        self.valid_inner(name, ctx, &cycle_members, &mut memo)
    }

    /// Global validity of every real calculation, sharing one traversal memo.
    pub fn validity(&self, ctx: &StaticContext) -> IndexMap<String, bool> {
        let cycle_members = self.nodes_in_cycles();
        let mut memo = HashMap::new();
        self.calcs()
            .map(|node| {
                let valid = self.valid_inner(node.name(), ctx, &cycle_members, &mut memo);
                (node.name().to_string(), valid)
            })
            .collect()
    }

    fn valid_inner(
        &self,
        name: &str,
        ctx: &StaticContext,
        cycle_members: &HashSet<String>,
        memo: &mut HashMap<String, bool>,
    ) -> bool {
        if let Some(valid) = memo.get(name) {
            return *valid;
        }
        let Some(entry) = self.nodes.get(name) else {
            return false;
        };

        // Cycle members bail out before recursing, so the walk terminates.
        let valid = entry.node.is_valid(ctx)
            && !cycle_members.contains(name)
            && entry
                .dependencies
                .iter()
                .all(|dep| self.valid_inner(dep, ctx, cycle_members, memo));

        memo.insert(name.to_string(), valid);
        valid
    }

    /// Calculations that transitively read an undefined name.
    pub fn nodes_missing_ancestors(&self) -> HashSet<String> {
        self.nodes
            .iter()
            .filter(|(_, entry)| entry.node.is_missing())
            .flat_map(|(name, _)| self.ancestor_calcs(name))
            .collect()
    }

    /// A disabled calculation still matters if an enabled one reads it.
    pub fn node_enabled_ancestors(&self, name: &str) -> bool {
        match self.get(name) {
            Some(node) if node.enabled() => true,
            Some(_) => self
                .ancestor_calcs(name)
                .iter()
                .any(|a| self.get(a).is_some_and(|n| n.enabled())),
            None => false,
        }
    }

    /// Real calculations ordered so that each comes after all its real
    /// dependencies, restricted to `subset` when given.
    ///
    /// Nodes in `excluded` are dropped together with their edges; anything
    /// still caught in a cycle is never emitted. Ties are broken by
    /// insertion order.
    pub fn topo_order(
        &self,
        subset: Option<&HashSet<String>>,
        excluded: &HashSet<String>,
    ) -> Vec<String> {
        let included = |name: &str| !excluded.contains(name) && self.nodes.contains_key(name);

        let mut remaining: Vec<usize> = self
            .nodes
            .iter()
            .map(|(_, entry)| entry.dependencies.iter().filter(|d| included(d.as_str())).count())
            .collect();

        // Kahn's algorithm, always taking the earliest inserted ready node.
        let mut ready: BTreeSet<usize> = self
            .nodes
            .keys()
            .enumerate()
            .filter(|(i, name)| remaining[*i] == 0 && included(name.as_str()))
            .map(|(i, _)| i)
            .collect();

        let mut order = Vec::new();
        while let Some(i) = ready.pop_first() {
            let Some((name, entry)) = self.nodes.get_index(i) else {
                continue;
            };
            let wanted = !entry.node.is_missing() && subset.map_or(true, |s| s.contains(name));
            if wanted {
                order.push(name.clone());
            }
            for dependent in &entry.dependents {
                if !included(dependent.as_str()) {
                    continue;
                }
                if let Some(j) = self.nodes.get_index_of(dependent) {
                    remaining[j] = remaining[j].saturating_sub(1);
                    if remaining[j] == 0 {
                        ready.insert(j);
                    }
                }
            }
        }
        order
    }

    /// Topological order of every real calculation, cycles excluded.
    pub fn topological_sort(&self) -> Vec<String> {
        self.topo_order(None, &self.nodes_in_cycles())
    }

    /// Independent copy for use off the foreground thread.
    pub fn snapshot(&self) -> Self {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;

    fn calc(name: &str, expr: &str) -> CalcNode {
        CalcNode::new(name, expr, true)
    }

    fn ctx() -> StaticContext {
        StaticContext::new(Vec::<String>::new())
    }

    fn chain() -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        graph.add_calc(calc("a", "1")).unwrap();
        graph.add_calc(calc("b", "res['a'] + 1")).unwrap();
        graph.add_calc(calc("c", "res['b'] + 1")).unwrap();
        graph
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut graph = chain();
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.edge_count(), 2);

        graph.remove_calc("c").unwrap();
        assert_eq!(graph.len(), 2);
        assert!(!graph.contains("c"));
        assert!(graph.predecessor_calcs("b").is_empty());
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut graph = chain();
        assert_eq!(
            graph.add_calc(calc("a", "2")),
            Err(GraphError::DuplicateName("a".into()))
        );
        assert_eq!(graph.remove_calc("zzz"), Err(GraphError::UnknownNode("zzz".into())));
    }

    #[test]
    fn unresolved_reference_creates_placeholder() {
        let mut graph = DependencyGraph::new();
        graph.add_calc(calc("a", "res['x']")).unwrap();
        assert_eq!(graph.get("x").map(CalcNode::kind), Some(NodeKind::Missing));
        assert_eq!(graph.successor_calcs("a"), vec!["x"]);

        graph.add_calc(calc("x", "1")).unwrap();
        assert_eq!(graph.get("x").map(CalcNode::kind), Some(NodeKind::Real));
        assert_eq!(graph.predecessor_calcs("x"), vec!["a"]);
    }

    #[test]
    fn removing_referenced_node_leaves_placeholder() {
        let mut graph = chain();
        graph.remove_calc("a").unwrap();
        assert_eq!(graph.get("a").map(CalcNode::kind), Some(NodeKind::Missing));
        assert_eq!(graph.predecessor_calcs("a"), vec!["b"]);

        // Dropping the last referrer prunes the placeholder.
        graph.remove_calc("b").unwrap();
        assert!(!graph.contains("a"));
    }

    #[test]
    fn rename_rewires_dependents() {
        let mut graph = chain();
        graph.rename_calc("c", "d").unwrap();
        assert!(graph.is_real("d"));
        assert!(!graph.contains("c"));
        assert_eq!(graph.successor_calcs("d"), vec!["b"]);

        // Renaming a referenced node leaves its referrers on a placeholder.
        graph.rename_calc("a", "z").unwrap();
        assert_eq!(graph.get("a").map(CalcNode::kind), Some(NodeKind::Missing));
    }

    #[test]
    fn change_expr_recomputes_edges() {
        let mut graph = chain();
        graph.change_calc_expr("c", "res['a'] * 2").unwrap();
        assert_eq!(graph.successor_calcs("c"), vec!["a"]);
        assert!(graph.predecessor_calcs("b").is_empty());
    }

    #[test]
    fn ancestors_and_descendants() {
        let graph = chain();
        let ancestors: Vec<_> = graph.ancestor_calcs("a").into_iter().collect();
        assert_eq!(ancestors, vec!["b", "c"]);
        let descendants: Vec<_> = graph.descendant_calcs("c").into_iter().collect();
        assert_eq!(descendants, vec!["b", "a"]);
    }

    #[test]
    fn topo_order_puts_dependencies_first() {
        let mut graph = DependencyGraph::new();
        graph.add_calc(calc("c", "res['b'] + 1")).unwrap();
        graph.add_calc(calc("b", "res['a'] + 1")).unwrap();
        graph.add_calc(calc("a", "1")).unwrap();
        graph.add_calc(calc("d", "2")).unwrap();
        assert_eq!(graph.topological_sort(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn topo_order_respects_subset_transitively() {
        let graph = chain();
        let subset: HashSet<String> = ["c".to_string(), "a".to_string()].into();
        assert_eq!(graph.topo_order(Some(&subset), &HashSet::new()), vec!["a", "c"]);
    }

    #[test]
    fn cycles_are_split_by_kind() {
        let mut graph = DependencyGraph::new();
        graph.add_calc(calc("x", "res['y']")).unwrap();
        graph.add_calc(calc("y", "res['z']")).unwrap();
        graph.add_calc(calc("z", "res['x']")).unwrap();
        graph.add_calc(calc("s", "res['s']")).unwrap();

        let cycles = graph.cycles();
        assert_eq!(cycles.self_loops, vec!["s"]);
        assert_eq!(cycles.components, vec![vec!["x", "y", "z"]]);
        assert!(graph.topological_sort().is_empty());
    }

    #[test]
    fn validity_propagates_through_dependencies() {
        let mut graph = chain();
        let ctx = ctx();
        assert!(graph.node_valid("c", &ctx));

        graph.change_calc_expr("a", "1 +").unwrap();
        let validity = graph.validity(&ctx);
        assert_eq!(validity.get("a"), Some(&false));
        assert_eq!(validity.get("c"), Some(&false));

        graph.change_calc_expr("a", "res['c']").unwrap();
        assert!(!graph.node_valid("b", &ctx));
    }

    #[test]
    fn missing_dependency_invalidates() {
        let mut graph = DependencyGraph::new();
        graph.add_calc(calc("a", "res['x']")).unwrap();
        assert!(!graph.node_valid("a", &ctx()));
        assert_eq!(graph.nodes_missing_ancestors(), ["a".to_string()].into());
    }

    #[test]
    fn enabled_ancestors() {
        let mut graph = DependencyGraph::new();
        graph.add_calc(CalcNode::new("tmp", "1", false)).unwrap();
        graph.add_calc(CalcNode::new("out", "res['tmp']", true)).unwrap();
        graph.add_calc(CalcNode::new("unused", "2", false)).unwrap();
        assert!(graph.node_enabled_ancestors("tmp"));
        assert!(!graph.node_enabled_ancestors("unused"));
    }

    #[test]
    fn snapshot_is_independent() {
        let mut graph = chain();
        let snapshot = graph.snapshot();
        graph.remove_calc("c").unwrap();
        assert!(snapshot.contains("c"));
        assert_eq!(snapshot.edge_count(), 2);
    }

    #[test]
    fn from_calcs_resolves_forward_references() {
        let graph = DependencyGraph::from_calcs([calc("b", "res['a']"), calc("a", "1")]).unwrap();
        assert!(graph.is_real("a"));
        assert_eq!(graph.len(), 2);
    }
}
