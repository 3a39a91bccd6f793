//! Static Analysis
//!
//! Two passes over a calculation's text, without evaluating it:
//!
//! - free names: every identifier the expression reads, checked against a
//!   declared binding set ([`StaticContext`]) to decide validity;
//! - dependencies: the calculations it references through `res['name']`
//!   or `res.col('name')`, in first-occurrence order.
//!
//! When the text does not parse, dependencies are still recovered with a
//! textual scan so that the graph keeps its edges while the user is typing.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use smallvec::SmallVec;

use crate::error::{StaticError, SyntaxError};

use super::ir::Expr;
use super::parser;

/// Name of the binding holding computed calculation values.
pub const RESULT_TABLE: &str = "res";

/// Name of the binding holding the input table.
pub const INPUT_TABLE: &str = "arg";

/// Dependency list; most calculations reference only a handful of columns.
pub type Deps = SmallVec<[String; 4]>;

/// The set of names an expression may read without being unbound.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticContext {
    names: HashSet<String>,
}

impl StaticContext {
    /// A context binding `res`, `arg` and the given extra names.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ctx = Self::default();
        ctx.names.insert(RESULT_TABLE.to_string());
        ctx.names.insert(INPUT_TABLE.to_string());
        ctx.extend(names);
        ctx
    }

    pub fn extend<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names.extend(names.into_iter().map(Into::into));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

/// Result of analysing one expression text.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    syntax_error: Option<SyntaxError>,
    free_names: Vec<String>,
    deps: Deps,
}

impl Analysis {
    /// Referenced calculation names, de-duplicated, first occurrence first.
    pub fn deps(&self) -> &[String] {
        &self.deps
    }

    /// Every identifier read by the expression, de-duplicated.
    pub fn free_names(&self) -> &[String] {
        &self.free_names
    }

    pub fn syntax_error(&self) -> Option<&SyntaxError> {
        self.syntax_error.as_ref()
    }

    /// Check the expression against a binding set.
    pub fn check(&self, ctx: &StaticContext) -> Result<(), StaticError> {
        if let Some(err) = &self.syntax_error {
            return Err(err.clone().into());
        }
        let unbound: Vec<String> = self
            .free_names
            .iter()
            .filter(|name| !ctx.contains(name))
            .cloned()
            .collect();
        if unbound.is_empty() {
            Ok(())
        } else {
            Err(StaticError::Unbound(unbound))
        }
    }
}

/// Analyse an expression text.
pub fn analyze(source: &str) -> Analysis {
    match parser::parse(source) {
        Ok(expr) => Analysis {
            syntax_error: None,
            free_names: free_names(&expr),
            deps: dependencies(&expr),
        },
        Err(err) => Analysis {
            syntax_error: Some(err),
            free_names: Vec::new(),
            deps: scan_dependencies(source),
        },
    }
}

/// Identifiers read by `expr`, in source order without repeats.
pub fn free_names(expr: &Expr) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    expr.walk(&mut |e| {
        if let Expr::Name(name) = e {
            if seen.insert(name.as_str()) {
                names.push(name.clone());
            }
        }
    });
    names
}

/// Calculation names referenced through the result table.
pub fn dependencies(expr: &Expr) -> Deps {
    let mut deps = Deps::new();
    expr.walk(&mut |e| {
        if let Some(name) = referenced_column(e) {
            if !deps.iter().any(|d| d == name) {
                deps.push(name.to_string());
            }
        }
    });
    deps
}

/// `res['name']` or `res.col('name')`.
fn referenced_column(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Subscript { value, index } if is_result_table(value) => index.as_text(),
        Expr::Call { func, args } => match (func.as_ref(), args.as_slice()) {
            (Expr::Attribute { value, attr }, [arg]) if attr == "col" && is_result_table(value) => {
                arg.as_text()
            }
            _ => None,
        },
        _ => None,
    }
}

fn is_result_table(expr: &Expr) -> bool {
    matches!(expr, Expr::Name(name) if name == RESULT_TABLE)
}

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"res\s*(?:\[\s*|\.\s*col\s*\(\s*)(?:'([^'\n]*)'|"([^"\n]*)")"#,
        )
        .expect("reference pattern is a valid regex")
    })
}

/// Textual fallback for expressions that do not parse.
fn scan_dependencies(source: &str) -> Deps {
    let mut deps = Deps::new();
    for caps in reference_pattern().captures_iter(source) {
        if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
            let name = name.as_str();
            if !deps.iter().any(|d| d == name) {
                deps.push(name.to_string());
            }
        }
    }
    deps
}
