//! Calcgraph Core
//!
//! This crate provides the engine behind calculated columns: named
//! expressions that read input columns and each other. It implements:
//!
//! - A live dependency graph with placeholders for undefined names
//! - Cycle detection and dependency-ordered scheduling
//! - Debounced, incremental recomputation on a cancellable background worker
//! - A small expression language with a static analyzer and an evaluator
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Calculation nodes and the dependency graph
//! - `expr`: Parsing, static analysis and evaluation of expressions
//! - `recompute`: Scheduler, preview jobs and the background worker
//! - `model`: The façade that keeps an ordered column list in sync with the
//!   graph, plus the persisted record format
//!
//! # Example
//!
//! ```rust,ignore
//! use calcgraph_core::config::Environment;
//! use calcgraph_core::model::CalcModel;
//!
//! let mut model = CalcModel::with_builtin_evaluator(Environment::default())?;
//! let a = model.add("a", "1", true)?;
//! let b = model.add("b", "res['a'] + 1", true)?;
//!
//! // Editing `a` recomputes `a` and then `b`.
//! model.set_expr(a, "41")?;
//! model.wait_idle(Duration::from_secs(1))?;
//! assert_eq!(model.column(b).unwrap().value(), Some(&Value::Number(42.0)));
//! ```

pub mod config;
pub mod error;
pub mod expr;
pub mod graph;
pub mod model;
pub mod recompute;

pub use config::{EngineConfig, Environment};
pub use error::{EvalError, GraphError, ModelError, PreviewError};
pub use graph::{CalcNode, DependencyGraph, NodeId};
pub use model::{CalcModel, ModelEvent};
