use std::fmt;

use tokio::sync::{mpsc, oneshot};

use crate::config::Block;
use crate::controller::error::LoadError;
use crate::controller::scheduler::PassReport;
use crate::syntax::Scope;

pub(crate) type Sender = mpsc::Sender<ControlMessage>;
pub(crate) type Receiver = mpsc::Receiver<ControlMessage>;
pub(crate) type ResponseSender<R> = oneshot::Sender<R>;

/// Capacity of the message queue of a control loop.
pub(crate) const QUEUE_SIZE: usize = 64;

/// Message sent to the control loop of a controller.
pub(crate) enum ControlMessage {
    Request(Request),
    /// Stops every unit, then the control loop.
    ///
    /// The passes in progress are interrupted.
    Shutdown { response_tx: ResponseSender<()> },
}

/// Work that waits for the passes in progress to complete.
pub(crate) enum Request {
    /// Loads a new configuration and evaluates it.
    Apply {
        blocks: Vec<Block>,
        scope: Scope,
        response_tx: ResponseSender<Result<PassReport, LoadError>>,
    },
    /// Processes the pending output notifications.
    Settle { response_tx: ResponseSender<()> },
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Apply { blocks, scope, .. } => f
                .debug_struct("Apply")
                .field("blocks", &blocks.len())
                .field("variables", &scope.variables().keys().collect::<Vec<_>>())
                .finish_non_exhaustive(),
            Request::Settle { .. } => f.write_str("Settle"),
        }
    }
}
