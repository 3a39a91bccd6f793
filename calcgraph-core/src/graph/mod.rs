//! Dependency Graph
//!
//! This module tracks which calculations read which others.
//!
//! # Overview
//!
//! - Nodes are named calculations, or `Missing` placeholders for names that
//!   are referenced but not defined
//! - Edges point from a calculation to the calculations it reads
//!
//! When a calculation changes, every node that transitively reads it (its
//! ancestors) has to be recomputed, in an order where dependencies come first.
//!
//! # Design Decisions
//!
//! 1. Nodes are keyed by name. Renames go through remove and add, which
//!    rewires referrers through placeholders.
//!
//! 2. Both directions of every edge are stored so that dependents and
//!    dependencies can be walked without scanning.
//!
//! 3. Cycles are reported rather than rejected. Cyclic nodes are invalid and
//!    left out of every ordering.

mod node;
mod cycles;
mod dependency;

pub use node::{CalcNode, NodeId, NodeKind};
pub use cycles::Cycles;
pub use dependency::DependencyGraph;
