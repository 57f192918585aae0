//! A small expression language for unit arguments.
//!
//! Declarations bind each argument of a unit to an [`Expr`]. Expressions can refer
//! to the outputs of other units (`local.value.source.value * 2`), to variables
//! provided by the enclosing scope (such as the item of a `foreach` block),
//! and combine them with the usual operators.
//!
//! The controller only needs three things from the language:
//! - [`parse`] an expression from its textual form,
//! - list the [`traversals`](Expr::traversals) of an expression, from which the
//!   dependency edges of the graph are derived,
//! - [`eval`] an expression against a [`Scope`] that contains a snapshot of the
//!   upstream outputs.

mod eval;
mod parse;

pub use eval::{EvalError, Scope, eval};
pub use parse::{ParseError, parse};

use crate::value::Value;

/// An uninterrupted sequence of identifiers separated by dots, such as `a.b.c`.
pub type Traversal = Vec<String>;

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant value.
    Literal(Value),
    /// A reference to a variable or to a unit, for example `local`.
    Ident(String),
    /// Field access: `expr.field`.
    Access(Box<Expr>, String),
    /// Indexing: `expr[index]`.
    Index(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

impl Expr {
    /// Lists the traversals that appear in the expression.
    ///
    /// Only uninterrupted sequences of field accessors are included: for
    /// `a.b.c[0].d`, the traversal is `a.b.c`. Indexing and calls interrupt a
    /// traversal, and an access on something that is not an identifier
    /// (like `[x][0].y`) does not start one.
    pub fn traversals(&self) -> Vec<Traversal> {
        let mut out = Vec::new();
        self.collect_traversals(&mut out);
        out
    }

    /// Returns the full traversal if `self` is made only of identifiers and accesses.
    pub(crate) fn as_traversal(&self) -> Option<Traversal> {
        match self {
            Expr::Ident(name) => Some(vec![name.clone()]),
            Expr::Access(base, field) => {
                let mut t = base.as_traversal()?;
                t.push(field.clone());
                Some(t)
            }
            _ => None,
        }
    }

    fn collect_traversals(&self, out: &mut Vec<Traversal>) {
        if let Some(t) = self.as_traversal() {
            out.push(t);
            return;
        }
        match self {
            Expr::Literal(_) | Expr::Ident(_) => (),
            Expr::Access(base, _) => base.collect_traversals(out),
            Expr::Index(base, index) => {
                base.collect_traversals(out);
                index.collect_traversals(out);
            }
            Expr::Array(items) => items.iter().for_each(|e| e.collect_traversals(out)),
            Expr::Object(fields) => fields.iter().for_each(|(_, e)| e.collect_traversals(out)),
            Expr::Unary(_, e) => e.collect_traversals(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_traversals(out);
                rhs.collect_traversals(out);
            }
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Literal(value)
    }
}
