//! Graph Nodes
//!
//! This module defines the calculation nodes that live in the dependency graph.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::error::StaticError;
use crate::expr::{self, Analysis, StaticContext};

/// Stable handle for a column owned by the model.
///
/// The graph itself keys nodes by name; ids survive renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// The kind of node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A calculation defined by the user.
    Real,

    /// A stand-in for a name that is referenced but not defined.
    /// Pruned as soon as nothing refers to it.
    Missing,
}

/// A named calculation.
///
/// Dependencies and static validity are derived from the expression text on
/// first use and cached until the text changes.
#[derive(Clone)]
pub struct CalcNode {
    name: String,
    expr: String,
    enabled: bool,
    kind: NodeKind,
    analysis: OnceLock<Arc<Analysis>>,
}

impl CalcNode {
    /// Create a real calculation node.
    pub fn new(name: impl Into<String>, expr: impl Into<String>, enabled: bool) -> Self {
        Self {
            name: name.into(),
            expr: expr.into(),
            enabled,
            kind: NodeKind::Real,
            analysis: OnceLock::new(),
        }
    }

    /// Create a placeholder for an undefined name.
    pub fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            expr: String::new(),
            enabled: false,
            kind: NodeKind::Missing,
            analysis: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// Replace the expression text, dropping the cached analysis.
    pub fn set_expr(&mut self, expr: impl Into<String>) {
        self.expr = expr.into();
        self.analysis = OnceLock::new();
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_missing(&self) -> bool {
        self.kind == NodeKind::Missing
    }

    fn analysis(&self) -> &Analysis {
        self.analysis
            .get_or_init(|| Arc::new(expr::analyze(&self.expr)))
    }

    /// Referenced calculation names in first-occurrence order.
    pub fn deps(&self) -> &[String] {
        if self.is_missing() {
            return &[];
        }
        self.analysis().deps()
    }

    /// The reason this node cannot be evaluated, if any.
    pub fn static_error(&self, ctx: &StaticContext) -> Option<StaticError> {
        self.analysis().check(ctx).err()
    }

    /// False on a syntax error or when a read name is not bound in `ctx`.
    pub fn is_valid(&self, ctx: &StaticContext) -> bool {
        !self.is_missing() && self.static_error(ctx).is_none()
    }

    /// True iff the expression is blank.
    pub fn is_empty(&self) -> bool {
        self.expr.trim().is_empty()
    }

    /// Human readable static problem, empty when valid.
    pub fn exception(&self, ctx: &StaticContext) -> String {
        match self.static_error(ctx) {
            Some(StaticError::Syntax(_)) => format!("Analyzing {}: SyntaxError", self.name),
            Some(err) => format!("Analyzing {}: {}", self.name, err),
            None => String::new(),
        }
    }
}

impl PartialEq for CalcNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.expr == other.expr
            && self.enabled == other.enabled
            && self.kind == other.kind
    }
}

impl fmt::Debug for CalcNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalcNode")
            .field("name", &self.name)
            .field("expr", &self.expr)
            .field("enabled", &self.enabled)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for CalcNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res['{}'] = {}", self.name, self.expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> StaticContext {
        StaticContext::new(["len"])
    }

    #[test]
    fn node_ids_are_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn deps_are_memoized_until_expr_changes() {
        let mut node = CalcNode::new("c", "res['a'] + res['b'] + res['a']", true);
        assert_eq!(node.deps(), ["a", "b"]);

        node.set_expr("res['z']");
        assert_eq!(node.deps(), ["z"]);
    }

    #[test]
    fn deeply_nested_expr_is_invalid_not_fatal() {
        let expr = format!("{}res['a']{}", "(".repeat(200_000), ")".repeat(200_000));
        let node = CalcNode::new("b", expr, true);
        assert_eq!(node.deps(), ["a"]);
        assert!(!node.is_valid(&ctx()));
    }

    #[test]
    fn validity_tracks_syntax_and_bindings() {
        let ctx = ctx();
        assert!(CalcNode::new("a", "len(res['x'])", true).is_valid(&ctx));
        assert!(!CalcNode::new("a", "res['x'] +", true).is_valid(&ctx));
        assert!(!CalcNode::new("a", "nope(1)", true).is_valid(&ctx));
        assert_eq!(
            CalcNode::new("a", "nope(1)", true).exception(&ctx),
            "Analyzing a: NameError: nope can't be found"
        );
        assert_eq!(
            CalcNode::new("a", "1 +", true).exception(&ctx),
            "Analyzing a: SyntaxError"
        );
    }

    #[test]
    fn blank_expressions_are_empty_and_invalid() {
        let node = CalcNode::new("a", "  \n\t", true);
        assert!(node.is_empty());
        assert!(!node.is_valid(&ctx()));
        assert!(!CalcNode::new("a", "1", true).is_empty());
    }

    #[test]
    fn missing_placeholder_has_no_deps() {
        let node = CalcNode::missing("x");
        assert_eq!(node.kind(), NodeKind::Missing);
        assert!(node.deps().is_empty());
        assert!(!node.is_valid(&ctx()));
    }

    #[test]
    fn display_shows_assignment() {
        let node = CalcNode::new("a", "1 + 2", true);
        assert_eq!(node.to_string(), "res['a'] = 1 + 2");
    }
}
