//! Expression Syntax Tree
//!
//! Defines the tree produced by the parser. The analyzer walks it to find
//! free names and `res[...]` references; the builtin evaluator interprets it.

/// Binary operators, including the short-circuiting boolean ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,

    // Comparison
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,

    // Boolean
    And,
    Or,
}

impl BinOp {
    /// Source spelling of the operator, used in error messages.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "and",
            BinOp::Or => "or",
        }
    }

    /// Map a punctuation token to a binary operator.
    pub(crate) fn from_punct(punct: &str) -> Option<Self> {
        Some(match punct {
            "+" => BinOp::Add,
            "-" => BinOp::Sub,
            "*" => BinOp::Mul,
            "/" => BinOp::Div,
            "//" => BinOp::FloorDiv,
            "%" => BinOp::Mod,
            "**" => BinOp::Pow,
            "<" => BinOp::Lt,
            "<=" => BinOp::Le,
            ">" => BinOp::Gt,
            ">=" => BinOp::Ge,
            "==" => BinOp::Eq,
            "!=" => BinOp::Ne,
            _ => return None,
        })
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Text(String),
    Bool(bool),
    None,

    /// A bare identifier, looked up in the bindings or the builtins.
    Name(String),

    /// `[a, b, c]`
    List(Vec<Expr>),

    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },

    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// `body if test else orelse`
    Conditional {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
    },

    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },

    /// `value[index]`
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },

    /// `value.attr`
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
}

impl Expr {
    /// Visit every sub-expression in source order (pre-order, left to right).
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::Number(_) | Expr::Text(_) | Expr::Bool(_) | Expr::None | Expr::Name(_) => {}
            Expr::List(items) => {
                for item in items {
                    item.walk(visit);
                }
            }
            Expr::Unary { operand, .. } => operand.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            // `body if test else orelse` reads body first.
            Expr::Conditional { test, body, orelse } => {
                body.walk(visit);
                test.walk(visit);
                orelse.walk(visit);
            }
            Expr::Call { func, args } => {
                func.walk(visit);
                for arg in args {
                    arg.walk(visit);
                }
            }
            Expr::Subscript { value, index } => {
                value.walk(visit);
                index.walk(visit);
            }
            Expr::Attribute { value, .. } => value.walk(visit),
        }
    }

    /// Shorthand for a string literal, if this is one.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Expr::Text(s) => Some(s),
            _ => None,
        }
    }
}
