use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use super::{BinaryOp, Expr, UnaryOp};
use crate::value::Value;

/// Names that an expression can refer to.
///
/// A scope contains two kinds of names:
/// - variables, such as the item of a `foreach` block;
/// - the outputs of units, keyed by the global id of the unit (`local.value.source`).
///
/// Outputs are shared with the controller through an [`Arc`], building a scope
/// does not copy them.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    variables: BTreeMap<String, Value>,
    outputs: FxHashMap<String, Arc<Value>>,
}

/// Error that can occur during the evaluation of an expression.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("component {0:?} does not exist or is out of scope")]
    UnknownReference(String),
    #[error("field {field:?} does not exist in {path}")]
    MissingField { path: String, field: String },
    #[error("{path} is null")]
    Null { path: String },
    #[error("invalid operation: {0}")]
    TypeMismatch(String),
    #[error("index {index} out of range for array of length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow in {0}")]
    Overflow(&'static str),
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a variable to the scope, replacing the previous one with the same name.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set_variable(name, value);
        self
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    /// Makes the outputs of the unit `id` visible to expressions.
    pub fn set_outputs(&mut self, id: impl Into<String>, outputs: Arc<Value>) {
        self.outputs.insert(id.into(), outputs);
    }

    pub(crate) fn outputs(&self) -> &FxHashMap<String, Arc<Value>> {
        &self.outputs
    }

    /// Resolves a traversal to a value.
    ///
    /// The prefix of the traversal is matched against the known units, starting with
    /// the shortest prefix: for `a.b.c.d`, the unit `a.b` is tried before `a.b.c`.
    /// The rest of the traversal is then applied as field accesses on the outputs.
    /// If no unit matches, the first identifier is looked up in the variables.
    fn resolve(&self, traversal: &[String]) -> Result<Value, EvalError> {
        for k in 1..=traversal.len() {
            let id = traversal[..k].join(".");
            if let Some(outputs) = self.outputs.get(&id) {
                return access_path(outputs, id, &traversal[k..]);
            }
        }
        if let Some(value) = self.variables.get(&traversal[0]) {
            return access_path(value, traversal[0].clone(), &traversal[1..]);
        }
        Err(EvalError::UnknownReference(traversal.join(".")))
    }
}

fn access_path(value: &Value, mut path: String, fields: &[String]) -> Result<Value, EvalError> {
    let mut current = value;
    for field in fields {
        current = access(current, &path, field)?;
        path.push('.');
        path.push_str(field);
    }
    Ok(current.clone())
}

fn access<'a>(value: &'a Value, path: &str, field: &str) -> Result<&'a Value, EvalError> {
    match value {
        Value::Object(fields) => fields.get(field).ok_or_else(|| EvalError::MissingField {
            path: path.to_owned(),
            field: field.to_owned(),
        }),
        Value::Null => Err(EvalError::Null { path: path.to_owned() }),
        other => Err(EvalError::TypeMismatch(format!(
            "cannot access field {field:?} of {path}, which is of type {}",
            other.type_name()
        ))),
    }
}

/// Evaluates an expression.
pub fn eval(expr: &Expr, scope: &Scope) -> Result<Value, EvalError> {
    if let Some(traversal) = expr.as_traversal() {
        return scope.resolve(&traversal);
    }
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(_) => unreachable!("identifiers are traversals"),
        Expr::Access(base, field) => {
            let base = eval(base, scope)?;
            access(&base, "expression", field).cloned()
        }
        Expr::Index(base, index) => {
            let base = eval(base, scope)?;
            let index = eval(index, scope)?;
            eval_index(base, index)
        }
        Expr::Array(items) => {
            let values = items.iter().map(|e| eval(e, scope)).collect::<Result<Vec<_>, _>>()?;
            Ok(Value::Array(values))
        }
        Expr::Object(fields) => {
            let mut object = BTreeMap::new();
            for (k, e) in fields {
                object.insert(k.clone(), eval(e, scope)?);
            }
            Ok(Value::Object(object))
        }
        Expr::Unary(op, operand) => {
            let v = eval(operand, scope)?;
            match (op, v) {
                (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or(EvalError::Overflow("-")),
                (UnaryOp::Neg, Value::Float(x)) => Ok(Value::Float(-x)),
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (op, v) => Err(EvalError::TypeMismatch(format!(
                    "cannot apply {} to {}",
                    if *op == UnaryOp::Neg { "-" } else { "!" },
                    v.type_name()
                ))),
            }
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => match eval(lhs, scope)? {
            Value::Bool(false) => Ok(Value::Bool(false)),
            Value::Bool(true) => expect_bool(eval(rhs, scope)?, BinaryOp::And),
            other => expect_bool(other, BinaryOp::And),
        },
        Expr::Binary(BinaryOp::Or, lhs, rhs) => match eval(lhs, scope)? {
            Value::Bool(true) => Ok(Value::Bool(true)),
            Value::Bool(false) => expect_bool(eval(rhs, scope)?, BinaryOp::Or),
            other => expect_bool(other, BinaryOp::Or),
        },
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, scope)?;
            let rhs = eval(rhs, scope)?;
            eval_binary(*op, lhs, rhs)
        }
    }
}

fn expect_bool(v: Value, op: BinaryOp) -> Result<Value, EvalError> {
    match v {
        Value::Bool(b) => Ok(Value::Bool(b)),
        other => Err(EvalError::TypeMismatch(format!(
            "operator {} expects bool operands, got {}",
            op.symbol(),
            other.type_name()
        ))),
    }
}

fn eval_index(base: Value, index: Value) -> Result<Value, EvalError> {
    match (base, index) {
        (Value::Array(mut items), Value::Int(i)) => {
            let len = items.len();
            if i < 0 || i as usize >= len {
                return Err(EvalError::IndexOutOfRange { index: i, len });
            }
            Ok(items.swap_remove(i as usize))
        }
        (Value::Object(mut fields), Value::String(key)) => {
            fields.remove(&key).ok_or_else(|| EvalError::MissingField {
                path: String::from("object"),
                field: key,
            })
        }
        (base, index) => Err(EvalError::TypeMismatch(format!(
            "cannot index {} with {}",
            base.type_name(),
            index.type_name()
        ))),
    }
}

fn eval_binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, EvalError> {
    use BinaryOp::*;

    match op {
        Eq => return Ok(Value::Bool(loose_eq(&lhs, &rhs))),
        NotEq => return Ok(Value::Bool(!loose_eq(&lhs, &rhs))),
        Lt | LtEq | Gt | GtEq => {
            let ord = compare(&lhs, &rhs).ok_or_else(|| mismatch(op, &lhs, &rhs))?;
            let res = match op {
                Lt => ord == Ordering::Less,
                LtEq => ord != Ordering::Greater,
                Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            };
            return Ok(Value::Bool(res));
        }
        _ => (),
    }

    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let res = match op {
                Add => a.checked_add(b),
                Sub => a.checked_sub(b),
                Mul => a.checked_mul(b),
                Div | Rem if b == 0 => return Err(EvalError::DivisionByZero),
                Div => a.checked_div(b),
                Rem => a.checked_rem(b),
                _ => unreachable!(),
            };
            res.map(Value::Int).ok_or(EvalError::Overflow(op.symbol()))
        }
        (Value::String(mut a), Value::String(b)) if op == Add => {
            a.push_str(&b);
            Ok(Value::String(a))
        }
        (Value::Array(mut a), Value::Array(b)) if op == Add => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (lhs, rhs) => match (lhs.as_float(), rhs.as_float()) {
            (Some(a), Some(b)) => {
                let res = match op {
                    Add => a + b,
                    Sub => a - b,
                    Mul => a * b,
                    Div => a / b,
                    Rem => a % b,
                    _ => unreachable!(),
                };
                Ok(Value::Float(res))
            }
            _ => Err(mismatch(op, &lhs, &rhs)),
        },
    }
}

fn mismatch(op: BinaryOp, lhs: &Value, rhs: &Value) -> EvalError {
    EvalError::TypeMismatch(format!(
        "cannot apply {} to {} and {}",
        op.symbol(),
        lhs.type_name(),
        rhs.type_name()
    ))
}

/// Equality in expressions considers that `1 == 1.0`.
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => (*a as f64) == *b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (a, b) => a == b,
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (a, b) => a.as_float()?.partial_cmp(&b.as_float()?),
    }
}
