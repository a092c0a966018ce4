//! Sandboxed expression evaluator.
//!
//! Evaluates a parsed formula against a binding environment. Pure: the only
//! inputs are the expression and the lookup, the only output is a `Value`
//! or an `EvalError`. There is no access to the host environment - the AST
//! is closed and function dispatch goes through the fixed table in
//! [`super::functions`].

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::cell::{CellRef, Value};

use super::functions;
use super::parser::{self, Expr, Op};

/// Evaluation failure. Always names what went wrong; a failing cell is
/// attached by the recalculation layer, which knows which cell it was
/// evaluating.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown function {0}")]
    UnknownFunction(String),

    #[error("unknown reference {0}")]
    UnknownReference(CellRef),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("division by zero")]
    DivisionByZero,

    #[error("{0}")]
    MathDomain(String),

    #[error("{name} expects {expected} argument(s), got {got}")]
    ArgCount {
        name: String,
        expected: &'static str,
        got: usize,
    },

    #[error("range reference is only valid inside a function argument")]
    RangeOutsideFunction,

    #[error("range {range} spans {cells} cells, exceeding the expansion limit")]
    RangeTooLarge { range: String, cells: usize },
}

/// Binding environment seam. The recalculator supplies a store-backed
/// implementation; validation rules use a one-entry map.
pub trait ValueLookup {
    /// Resolve a reference to its current value, or None if unbound.
    fn lookup(&self, reference: &CellRef) -> Option<Value>;
}

impl ValueLookup for FxHashMap<CellRef, Value> {
    fn lookup(&self, reference: &CellRef) -> Option<Value> {
        self.get(reference).cloned()
    }
}

/// Parse and evaluate a formula string against a binding environment.
pub fn evaluate<L: ValueLookup>(formula: &str, bindings: &L) -> Result<Value, EvalError> {
    let expr = parser::parse(formula)?;
    eval_expr(&expr, bindings)
}

/// Evaluate an already-parsed expression.
pub fn eval_expr<L: ValueLookup>(expr: &Expr, lookup: &L) -> Result<Value, EvalError> {
    match expr {
        Expr::Number(n) => Ok(Value::Number(*n)),
        Expr::Text(s) => Ok(Value::Text(s.clone())),
        Expr::Boolean(b) => Ok(Value::Boolean(*b)),
        Expr::Ref(reference) => lookup
            .lookup(reference)
            .ok_or_else(|| EvalError::UnknownReference(reference.clone())),
        Expr::Range(_) => Err(EvalError::RangeOutsideFunction),
        Expr::Function { name, args } => functions::dispatch(name, args, lookup),
        Expr::Neg(inner) => {
            let n = eval_expr(inner, lookup)?.to_number()?;
            Ok(Value::Number(-n))
        }
        Expr::BinaryOp { op, left, right } => {
            let lhs = eval_expr(left, lookup)?;
            let rhs = eval_expr(right, lookup)?;
            apply_op(*op, &lhs, &rhs)
        }
    }
}

fn apply_op(op: Op, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    match op {
        Op::Add => Ok(Value::Number(lhs.to_number()? + rhs.to_number()?)),
        Op::Sub => Ok(Value::Number(lhs.to_number()? - rhs.to_number()?)),
        Op::Mul => Ok(Value::Number(lhs.to_number()? * rhs.to_number()?)),
        Op::Div => {
            let divisor = rhs.to_number()?;
            if divisor == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            Ok(Value::Number(lhs.to_number()? / divisor))
        }
        Op::Pow => {
            let result = lhs.to_number()?.powf(rhs.to_number()?);
            if !result.is_finite() {
                return Err(EvalError::MathDomain("power result out of range".to_string()));
            }
            Ok(Value::Number(result))
        }
        Op::Lt | Op::Gt | Op::LtEq | Op::GtEq | Op::Eq | Op::NotEq => {
            Ok(Value::Boolean(compare(op, lhs, rhs)))
        }
    }
}

/// Compare two values: numerically when both coerce to numbers, otherwise
/// by text (lexicographic for ordering, exact for equality).
fn compare(op: Op, lhs: &Value, rhs: &Value) -> bool {
    let ordering = match (lhs.to_number(), rhs.to_number()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(lhs.to_text().cmp(&rhs.to_text())),
    };
    let Some(ordering) = ordering else {
        // NaN compares unequal to everything, including itself.
        return matches!(op, Op::NotEq);
    };
    match op {
        Op::Lt => ordering.is_lt(),
        Op::Gt => ordering.is_gt(),
        Op::LtEq => ordering.is_le(),
        Op::GtEq => ordering.is_ge(),
        Op::Eq => ordering.is_eq(),
        Op::NotEq => ordering.is_ne(),
        _ => unreachable!("compare called with arithmetic operator"),
    }
}
