//! Calculation Expressions
//!
//! Everything the engine knows about expression text lives here:
//!
//! - `parser`: text to syntax tree
//! - `analyze`: free names, `res[...]` dependencies and static validity
//! - `eval`: the [`Evaluator`] seam and the builtin interpreter
//! - `value`: runtime values and tables
//!
//! The graph and the scheduler only ever see the results of `analyze`; the
//! preview worker hands source text to whichever evaluator was injected.

mod ir;
mod parser;
mod analyze;
mod eval;
mod value;

pub use ir::{BinOp, Expr, UnaryOp};
pub use parser::parse;
pub use analyze::{analyze, dependencies, free_names, Analysis, Deps, StaticContext, INPUT_TABLE, RESULT_TABLE};
pub use eval::{bindings, Bindings, BuiltinEvaluator, Evaluator};
pub use value::{Table, Value};
