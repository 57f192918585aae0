//! Resolution of the arguments of a node against the outputs of its dependencies.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use super::node::Node;
use crate::config::Declaration;
use crate::graph::{Dag, NodeIndex};
use crate::syntax::{self, EvalError, Scope};
use crate::value::Value;

/// An argument of a declaration could not be evaluated.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("argument {argument:?}: {error}")]
pub struct ArgumentError {
    pub argument: String,
    pub error: EvalError,
}

/// Builds the scope in which the expressions of node `v` are evaluated:
/// the external scope, plus the current outputs of the dependencies of `v`.
///
/// A dependency that has not published anything yet is seen as `null`.
pub(crate) fn node_scope(external: &Scope, dag: &Dag<Arc<Node>>, v: NodeIndex) -> Scope {
    let mut scope = external.clone();
    for d in dag.dependencies(v) {
        let dependency = dag.data(d);
        let outputs = dependency.outputs().unwrap_or_else(|| Arc::new(Value::Null));
        scope.set_outputs(dependency.local_id.clone(), outputs);
    }
    scope
}

/// Evaluates every argument of `decl`. Returns an object keyed by argument name.
pub(crate) fn resolve_arguments(decl: &Declaration, scope: &Scope) -> Result<Value, ArgumentError> {
    let mut resolved = BTreeMap::new();
    for (name, expr) in &decl.arguments {
        let value = syntax::eval(expr, scope).map_err(|error| ArgumentError {
            argument: name.clone(),
            error,
        })?;
        resolved.insert(name.clone(), value);
    }
    Ok(Value::Object(resolved))
}
