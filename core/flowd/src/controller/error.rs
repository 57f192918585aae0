use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::registry::StabilityError;

/// A configuration could not be loaded. The previous configuration, if any, is still running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub diagnostics: Vec<Diagnostic>,
}

/// One problem found while loading a configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{block}: {kind}")]
pub struct Diagnostic {
    /// Id of the block that has the problem.
    pub block: String,
    pub kind: DiagnosticKind,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DiagnosticKind {
    #[error("unknown component type {0:?}")]
    UnknownType(String),
    #[error(transparent)]
    Stability(#[from] StabilityError),
    #[error("block declared more than once")]
    Duplicate,
    #[error("invalid foreach arguments: {0}")]
    InvalidForEach(String),
    #[error("argument {argument:?}: component {reference:?} does not exist or is out of scope")]
    UnresolvedReference { argument: String, reference: String },
    #[error("dependency cycle between {}", .0.join(", "))]
    Cycle(Vec<String>),
}

impl LoadError {
    pub(crate) fn new(diagnostics: Vec<Diagnostic>) -> Self {
        Self { diagnostics }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration ({} problems)", self.diagnostics.len())?;
        for d in &self.diagnostics {
            write!(f, "\n  - {d}")?;
        }
        Ok(())
    }
}

impl std::error::Error for LoadError {}

/// Error returned by the operations of the [`Controller`](super::Controller).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ControllerError {
    /// The control loop is not available.
    /// This happens when the controller is shut down before processing the request.
    #[error("controller not available")]
    NotAvailable,
    /// The configuration has been rejected.
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// A running unit could not apply new arguments. It keeps running with the previous ones.
#[derive(Debug, Error)]
pub enum ReconfigureError {
    #[error("the component is not running")]
    NotRunning,
    #[error("the component stopped before applying the update")]
    Dropped,
    #[error("the component rejected its new arguments")]
    Rejected(#[source] anyhow::Error),
    #[error("the component did not apply its new arguments within {0:?}")]
    Timeout(Duration),
}

/// Error returned by [`Controller::node`](super::Controller::node).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("component {0:?} does not exist")]
    NotFound(String),
    /// The unit did not answer in time: it has not reached its event-handling step.
    #[error("component {0:?} did not answer in time")]
    Timeout(String),
}
