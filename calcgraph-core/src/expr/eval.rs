//! Evaluation
//!
//! The engine never interprets expressions itself; it calls an injected
//! [`Evaluator`] with the source text and the bindings for one calculation.
//! [`BuiltinEvaluator`] is the default implementation: an interpreter for the
//! language accepted by [`parser`](super::parser), with numpy-style
//! element-wise arithmetic on columns.

use indexmap::IndexMap;

use crate::error::{EvalError, StaticError};

use super::analyze::{self, StaticContext};
use super::ir::{BinOp, Expr, UnaryOp};
use super::parser;
use super::value::{Table, Value};

/// Names visible to one evaluation, in resolution order.
pub type Bindings = IndexMap<String, Value>;

/// Evaluates calculation source text against a set of bindings.
///
/// Implementations must be shareable with the preview worker thread.
pub trait Evaluator: Send + Sync {
    /// Evaluate `source`, returning its value or a structured error.
    fn evaluate(&self, source: &str, bindings: &Bindings) -> Result<Value, EvalError>;

    /// Names the evaluator resolves without bindings (functions, constants).
    ///
    /// Used only by the static validity check.
    fn builtins(&self) -> Vec<&'static str> {
        Vec::new()
    }
}

const BUILTINS: &[&str] = &[
    "abs", "bool", "float", "int", "len", "list", "max", "min", "range", "round", "str", "sum",
];

/// Interpreter for the builtin calculation language.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinEvaluator;

impl Evaluator for BuiltinEvaluator {
    fn evaluate(&self, source: &str, bindings: &Bindings) -> Result<Value, EvalError> {
        let expr = parser::parse(source).map_err(StaticError::from)?;

        let mut ctx = StaticContext::new(BUILTINS.iter().copied());
        ctx.extend(bindings.keys().cloned());
        let unbound: Vec<String> = analyze::free_names(&expr)
            .into_iter()
            .filter(|name| !ctx.contains(name))
            .collect();
        if !unbound.is_empty() {
            return Err(StaticError::Unbound(unbound).into());
        }

        Interpreter { bindings }.eval(&expr)
    }

    fn builtins(&self) -> Vec<&'static str> {
        BUILTINS.to_vec()
    }
}

struct Interpreter<'a> {
    bindings: &'a Bindings,
}

impl Interpreter<'_> {
    fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Text(s) => Ok(Value::Text(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Name(name) => match self.bindings.get(name) {
                Some(value) => Ok(value.clone()),
                None if BUILTINS.contains(&name.as_str()) => Err(EvalError::runtime(format!(
                    "TypeError: builtin '{name}' must be called"
                ))),
                None => Err(EvalError::runtime(format!(
                    "NameError: name '{name}' is not defined"
                ))),
            },
            Expr::List(items) => items
                .iter()
                .map(|item| self.eval(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            Expr::Unary { op, operand } => unary(*op, self.eval(operand)?),
            Expr::Binary {
                op: BinOp::And,
                left,
                right,
            } => {
                let left = self.eval(left)?;
                if left.truthy() {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            Expr::Binary {
                op: BinOp::Or,
                left,
                right,
            } => {
                let left = self.eval(left)?;
                if left.truthy() {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Binary { op, left, right } => binary(*op, self.eval(left)?, self.eval(right)?),
            Expr::Conditional { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Subscript { value, index } => subscript(self.eval(value)?, self.eval(index)?),
            Expr::Attribute { value, attr } => match self.eval(value)? {
                Value::Table(table) => table.get(attr).cloned().ok_or_else(|| {
                    EvalError::runtime(format!("AttributeError: table has no attribute '{attr}'"))
                }),
                other => Err(EvalError::runtime(format!(
                    "AttributeError: '{}' object has no attribute '{attr}'",
                    other.type_name()
                ))),
            },
            Expr::Call { func, args } => self.call(func, args),
        }
    }

    fn call(&self, func: &Expr, args: &[Expr]) -> Result<Value, EvalError> {
        match func {
            Expr::Name(name) if !self.bindings.contains_key(name) => {
                let args = self.eval_all(args)?;
                call_builtin(name, args)
            }
            // `table.col(name)` yields an object whose `data` is the column.
            Expr::Attribute { value, attr } if attr == "col" => {
                let table = match self.eval(value)? {
                    Value::Table(table) => table,
                    other => {
                        return Err(EvalError::runtime(format!(
                            "AttributeError: '{}' object has no attribute 'col'",
                            other.type_name()
                        )))
                    }
                };
                let args = self.eval_all(args)?;
                let [Value::Text(name)] = args.as_slice() else {
                    return Err(EvalError::runtime("TypeError: col() takes one column name"));
                };
                let column = table
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EvalError::runtime(format!("KeyError: '{name}'")))?;
                Ok(Value::Table([("data", column)].into_iter().collect()))
            }
            other => {
                let callee = self.eval(other)?;
                Err(EvalError::runtime(format!(
                    "TypeError: '{}' object is not callable",
                    callee.type_name()
                )))
            }
        }
    }

    fn eval_all(&self, args: &[Expr]) -> Result<Vec<Value>, EvalError> {
        args.iter().map(|arg| self.eval(arg)).collect()
    }
}

fn type_error(op: BinOp, left: &Value, right: &Value) -> EvalError {
    EvalError::runtime(format!(
        "TypeError: unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    ))
}

fn unary(op: UnaryOp, value: Value) -> Result<Value, EvalError> {
    match (op, value) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.truthy())),
        (op, Value::List(items)) => items
            .into_iter()
            .map(|item| unary(op, item))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        (op, value) => match value.as_number() {
            Some(n) if op == UnaryOp::Neg => Ok(Value::Number(-n)),
            Some(n) => Ok(Value::Number(n)),
            None => Err(EvalError::runtime(format!(
                "TypeError: bad operand type for unary {}: '{}'",
                if op == UnaryOp::Neg { "-" } else { "+" },
                value.type_name()
            ))),
        },
    }
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::List(l), Value::List(r)) => {
            if l.len() != r.len() {
                return Err(EvalError::runtime(format!(
                    "ValueError: operands could not be broadcast together with shapes ({},) ({},)",
                    l.len(),
                    r.len()
                )));
            }
            l.into_iter()
                .zip(r)
                .map(|(a, b)| binary(op, a, b))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List)
        }
        (Value::List(l), right) => l
            .into_iter()
            .map(|a| binary(op, a, right.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        (left, Value::List(r)) => r
            .into_iter()
            .map(|b| binary(op, left.clone(), b))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        (left, right) => scalar_binary(op, &left, &right),
    }
}

fn scalar_binary(op: BinOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    if let (Some(a), Some(b)) = (left.as_number(), right.as_number()) {
        return numeric(op, a, b);
    }

    match (left, right) {
        (Value::Text(a), Value::Text(b)) => match op {
            BinOp::Add => Ok(Value::Text(format!("{a}{b}"))),
            BinOp::Lt => Ok(Value::Bool(a < b)),
            BinOp::Le => Ok(Value::Bool(a <= b)),
            BinOp::Gt => Ok(Value::Bool(a > b)),
            BinOp::Ge => Ok(Value::Bool(a >= b)),
            BinOp::Eq => Ok(Value::Bool(a == b)),
            BinOp::Ne => Ok(Value::Bool(a != b)),
            _ => Err(type_error(op, left, right)),
        },
        _ => match op {
            BinOp::Eq => Ok(Value::Bool(left == right)),
            BinOp::Ne => Ok(Value::Bool(left != right)),
            _ => Err(type_error(op, left, right)),
        },
    }
}

fn numeric(op: BinOp, a: f64, b: f64) -> Result<Value, EvalError> {
    let zero_division = || EvalError::runtime("ZeroDivisionError: division by zero");
    Ok(match op {
        BinOp::Add => Value::Number(a + b),
        BinOp::Sub => Value::Number(a - b),
        BinOp::Mul => Value::Number(a * b),
        BinOp::Div if b == 0.0 => return Err(zero_division()),
        BinOp::Div => Value::Number(a / b),
        BinOp::FloorDiv if b == 0.0 => return Err(zero_division()),
        BinOp::FloorDiv => Value::Number((a / b).floor()),
        BinOp::Mod if b == 0.0 => return Err(zero_division()),
        // Sign follows the divisor.
        BinOp::Mod => Value::Number(a - b * (a / b).floor()),
        BinOp::Pow => Value::Number(a.powf(b)),
        BinOp::Lt => Value::Bool(a < b),
        BinOp::Le => Value::Bool(a <= b),
        BinOp::Gt => Value::Bool(a > b),
        BinOp::Ge => Value::Bool(a >= b),
        BinOp::Eq => Value::Bool(a == b),
        BinOp::Ne => Value::Bool(a != b),
        BinOp::And | BinOp::Or => unreachable!("boolean operators short-circuit in the interpreter"),
    })
}

fn subscript(value: Value, index: Value) -> Result<Value, EvalError> {
    match (value, index) {
        (Value::Table(table), Value::Text(name)) => table
            .get(&name)
            .cloned()
            .ok_or_else(|| EvalError::runtime(format!("KeyError: '{name}'"))),
        // Boolean mask selects rows.
        (Value::List(items), Value::List(mask)) => {
            if items.len() != mask.len() {
                return Err(EvalError::runtime(format!(
                    "IndexError: boolean index did not match indexed array; dimension is {} but corresponding boolean dimension is {}",
                    items.len(),
                    mask.len()
                )));
            }
            Ok(Value::List(
                items
                    .into_iter()
                    .zip(mask)
                    .filter(|(_, keep)| keep.truthy())
                    .map(|(item, _)| item)
                    .collect(),
            ))
        }
        (Value::List(items), index) => {
            let i = position(&index, items.len())?;
            Ok(items[i].clone())
        }
        (Value::Text(s), index) => {
            let chars: Vec<char> = s.chars().collect();
            let i = position(&index, chars.len())?;
            Ok(Value::Text(chars[i].to_string()))
        }
        (value, index) => Err(EvalError::runtime(format!(
            "TypeError: '{}' object is not subscriptable with '{}'",
            value.type_name(),
            index.type_name()
        ))),
    }
}

/// Resolve a possibly negative index against `len`.
fn position(index: &Value, len: usize) -> Result<usize, EvalError> {
    let Some(n) = index.as_number().filter(|n| n.fract() == 0.0) else {
        return Err(EvalError::runtime(format!(
            "TypeError: indices must be integers, not {}",
            index.type_name()
        )));
    };
    let i = if n < 0.0 { len as f64 + n } else { n };
    if i < 0.0 || i >= len as f64 {
        return Err(EvalError::runtime("IndexError: index out of range"));
    }
    Ok(i as usize)
}

fn numbers(name: &str, value: &Value) -> Result<Vec<f64>, EvalError> {
    let items = match value {
        Value::List(items) => items.as_slice(),
        other => std::slice::from_ref(other),
    };
    items
        .iter()
        .map(|item| {
            item.as_number().ok_or_else(|| {
                EvalError::runtime(format!(
                    "TypeError: {name}() expects numbers, got '{}'",
                    item.type_name()
                ))
            })
        })
        .collect()
}

fn map_numbers(value: Value, f: &impl Fn(f64) -> f64) -> Result<Value, EvalError> {
    match value {
        Value::List(items) => items
            .into_iter()
            .map(|item| map_numbers(item, f))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        other => match other.as_number() {
            Some(n) => Ok(Value::Number(f(n))),
            None => Err(EvalError::runtime(format!(
                "TypeError: bad operand type '{}'",
                other.type_name()
            ))),
        },
    }
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalError> {
    if args.len() < min || args.len() > max {
        return Err(EvalError::runtime(format!(
            "TypeError: {name}() takes {min} to {max} arguments ({} given)",
            args.len()
        )));
    }
    Ok(())
}

fn call_builtin(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
    match name {
        "len" => {
            arity(name, &args, 1, 1)?;
            args[0]
                .len()
                .map(|n| Value::Number(n as f64))
                .ok_or_else(|| {
                    EvalError::runtime(format!(
                        "TypeError: object of type '{}' has no len()",
                        args[0].type_name()
                    ))
                })
        }
        "sum" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Number(numbers(name, &args[0])?.iter().sum()))
        }
        "min" | "max" => {
            arity(name, &args, 1, usize::MAX)?;
            let values = if args.len() == 1 {
                numbers(name, &args[0])?
            } else {
                numbers(name, &Value::List(args))?
            };
            let pick = if name == "min" { f64::min } else { f64::max };
            values
                .into_iter()
                .reduce(pick)
                .map(Value::Number)
                .ok_or_else(|| EvalError::runtime(format!("ValueError: {name}() arg is an empty sequence")))
        }
        "abs" => {
            arity(name, &args, 1, 1)?;
            map_numbers(args[0].clone(), &f64::abs)
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            let digits = match args.get(1) {
                Some(d) => d.as_number().ok_or_else(|| {
                    EvalError::runtime("TypeError: round() ndigits must be a number")
                })?,
                None => 0.0,
            };
            let scale = 10f64.powf(digits);
            map_numbers(args[0].clone(), &|n| (n * scale).round() / scale)
        }
        "float" | "int" => {
            arity(name, &args, 1, 1)?;
            let n = match &args[0] {
                Value::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                    EvalError::runtime(format!(
                        "ValueError: could not convert string to {name}: '{s}'"
                    ))
                })?,
                other => other.as_number().ok_or_else(|| {
                    EvalError::runtime(format!(
                        "TypeError: {name}() argument must be a string or a number, not '{}'",
                        other.type_name()
                    ))
                })?,
            };
            Ok(Value::Number(if name == "int" { n.trunc() } else { n }))
        }
        "str" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Text(match &args[0] {
                Value::Text(s) => s.clone(),
                other => other.to_string(),
            }))
        }
        "bool" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(args[0].truthy()))
        }
        "list" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::List(items) => Ok(Value::List(items.clone())),
                Value::Text(s) => Ok(Value::List(
                    s.chars().map(|c| Value::Text(c.to_string())).collect(),
                )),
                Value::Table(t) => Ok(Value::List(t.names().map(Value::from).collect())),
                other => Err(EvalError::runtime(format!(
                    "TypeError: '{}' object is not iterable",
                    other.type_name()
                ))),
            }
        }
        "range" => {
            arity(name, &args, 1, 3)?;
            let bounds = numbers(name, &Value::List(args))?
                .into_iter()
                .map(integer)
                .collect::<Result<Vec<_>, _>>()?;
            let (start, stop, step) = match bounds.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("arity checked above"),
            };
            if step == 0 {
                return Err(EvalError::runtime("ValueError: range() arg 3 must not be zero"));
            }
            let span = if step > 0 {
                stop.saturating_sub(start)
            } else {
                start.saturating_sub(stop)
            };
            let stride = step.saturating_abs();
            let len = if span <= 0 {
                0
            } else {
                span.saturating_add(stride - 1) / stride
            };
            if len > MAX_RANGE_LEN {
                return Err(EvalError::runtime(format!(
                    "ValueError: range() of {len} items exceeds the limit of {MAX_RANGE_LEN}"
                )));
            }
            Ok(Value::List(
                (0..len)
                    .map(|i| Value::Number((start + i * step) as f64))
                    .collect(),
            ))
        }
        _ => Err(EvalError::runtime(format!("NameError: name '{name}' is not defined"))),
    }
}

/// Longest list `range()` will build.
const MAX_RANGE_LEN: i128 = 1_000_000;

/// An integral argument, as `range()` requires.
fn integer(n: f64) -> Result<i128, EvalError> {
    if n.is_finite() && n.fract() == 0.0 {
        Ok(n as i128)
    } else {
        Err(EvalError::runtime(
            "TypeError: 'float' object cannot be interpreted as an integer",
        ))
    }
}

/// Bindings for one calculation: the environment globals, the input table
/// as `arg`, and the available computed values as `res`.
pub fn bindings(globals: &IndexMap<String, Value>, input: &Table, results: Table) -> Bindings {
    let mut bindings = Bindings::with_capacity(globals.len() + 2);
    for (name, value) in globals {
        bindings.insert(name.clone(), value.clone());
    }
    bindings.insert(analyze::INPUT_TABLE.to_string(), Value::Table(input.clone()));
    bindings.insert(analyze::RESULT_TABLE.to_string(), Value::Table(results));
    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EvalErrorKind;

    fn eval_with(source: &str, res: &[(&str, Value)]) -> Result<Value, EvalError> {
        let results: Table = res.iter().cloned().collect();
        let input: Table = [("x", Value::from(vec![1.0, 2.0, 3.0]))].into_iter().collect();
        BuiltinEvaluator.evaluate(source, &bindings(&IndexMap::new(), &input, results))
    }

    fn eval(source: &str) -> Result<Value, EvalError> {
        eval_with(source, &[])
    }

    #[test]
    fn arithmetic_on_scalars() {
        assert_eq!(eval("1 + 2 * 3").unwrap(), Value::from(7.0));
        assert_eq!(eval("7 // 2").unwrap(), Value::from(3.0));
        assert_eq!(eval("-7 % 3").unwrap(), Value::from(2.0));
        assert_eq!(eval("2 ** 10").unwrap(), Value::from(1024.0));
        assert_eq!(eval("'a' + 'b'").unwrap(), Value::from("ab"));
    }

    #[test]
    fn columns_broadcast_element_wise() {
        assert_eq!(
            eval("arg['x'] * 2 + 1").unwrap(),
            Value::from(vec![3.0, 5.0, 7.0])
        );
        assert_eq!(
            eval("arg['x'] + arg['x']").unwrap(),
            Value::from(vec![2.0, 4.0, 6.0])
        );
        assert_eq!(
            eval("arg['x'][arg['x'] > 1]").unwrap(),
            Value::from(vec![2.0, 3.0])
        );
    }

    #[test]
    fn mismatched_columns_fail() {
        let err = eval("arg['x'] + [1, 2]").unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::Runtime);
        assert!(err.message.starts_with("ValueError"));
    }

    #[test]
    fn reads_results_by_subscript_and_col() {
        let res = [("a", Value::from(vec![10.0, 20.0]))];
        assert_eq!(
            eval_with("res['a'] + res.col('a').data", &res).unwrap(),
            Value::from(vec![20.0, 40.0])
        );
        let err = eval_with("res['b']", &res).unwrap_err();
        assert_eq!(err.message, "KeyError: 'b'");
    }

    #[test]
    fn builtins() {
        assert_eq!(eval("len(arg['x'])").unwrap(), Value::from(3.0));
        assert_eq!(eval("sum(arg['x'])").unwrap(), Value::from(6.0));
        assert_eq!(eval("max(arg['x'])").unwrap(), Value::from(3.0));
        assert_eq!(eval("min(4, 2, 8)").unwrap(), Value::from(2.0));
        assert_eq!(eval("round(2.346, 2)").unwrap(), Value::from(2.35));
        assert_eq!(eval("int('42')").unwrap(), Value::from(42.0));
        assert_eq!(eval("str(1.5)").unwrap(), Value::from("1.5"));
        assert_eq!(eval("range(3)").unwrap(), Value::from(vec![0.0, 1.0, 2.0]));
    }

    #[test]
    fn range_steps_and_bounds() {
        assert_eq!(eval("range(1, 7, 3)").unwrap(), Value::from(vec![1.0, 4.0]));
        assert_eq!(eval("range(3, 0, -1)").unwrap(), Value::from(vec![3.0, 2.0, 1.0]));
        assert_eq!(eval("range(5, 1)").unwrap(), Value::List(Vec::new()));
        assert!(matches!(
            eval("range(2 ** 53, 2 ** 53 + 2)").unwrap(),
            Value::List(items) if items.len() == 2
        ));
    }

    #[test]
    fn range_rejects_fractions_and_huge_lengths() {
        let err = eval("range(0.5, 3)").unwrap_err();
        assert_eq!(
            err.message,
            "TypeError: 'float' object cannot be interpreted as an integer"
        );
        assert!(eval("range(2 ** 60)").unwrap_err().message.starts_with("ValueError"));
        assert!(eval("range(0, 1, 0)").is_err());
    }

    #[test]
    fn boolean_operators_short_circuit() {
        assert_eq!(eval("0 or 'fallback'").unwrap(), Value::from("fallback"));
        // The right side would raise if evaluated.
        assert_eq!(eval("False and 1 / 0").unwrap(), Value::Bool(false));
        assert_eq!(eval("'yes' if 2 > 1 else 'no'").unwrap(), Value::from("yes"));
    }

    #[test]
    fn classifies_failures() {
        assert_eq!(eval("1 +").unwrap_err().kind, EvalErrorKind::Static);
        assert_eq!(eval("unknown + 1").unwrap_err().kind, EvalErrorKind::Static);

        let err = eval("1 / 0").unwrap_err();
        assert_eq!(err.kind, EvalErrorKind::Runtime);
        assert_eq!(err.message, "ZeroDivisionError: division by zero");
    }
}
