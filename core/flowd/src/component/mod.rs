//! Contract between the controller and the units it runs.
//!
//! A unit is created by its factory (see [`Registration`](crate::registry::Registration)),
//! then its [`Component::run`] method is called exactly once, on a dedicated task.
//!
//! The controller never calls into a running unit directly. Updates of the arguments
//! and queries (health, debug info) are sent as [`Request`]s to the unit, which answers
//! them from its own task, between two pieces of work. Units that have no work of their
//! own can simply call [`RunContext::serve`].
//!
//! ```ignore
//! impl Component for MyUnit {
//!     fn run(mut self: Box<Self>, mut ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>> {
//!         Box::pin(async move { ctx.serve(&mut *self).await })
//!     }
//! }
//! ```

mod health;
mod options;

pub use health::{Health, HealthType};
pub use options::{MetricsRegisterer, Options, PublishFn};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::value::Value;

/// A running unit.
pub trait Component: Send + 'static {
    /// Runs the unit until the cancellation token of `ctx` is cancelled.
    ///
    /// Returning before the cancellation (with or without an error) means
    /// that the unit has exited. It will not be restarted automatically.
    fn run(self: Box<Self>, ctx: RunContext) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Reaction of a unit to the requests of the controller.
pub trait Handler {
    /// Applies new arguments.
    ///
    /// Never called concurrently with itself.
    fn update(&mut self, args: Value) -> anyhow::Result<()>;

    /// Reports the health of the unit. `None` if the unit does not report its health.
    fn health(&self) -> Option<Health> {
        None
    }

    /// Reports debug information. `None` if the unit has no debug information.
    fn debug_info(&self) -> Option<Value> {
        None
    }
}

/// Request sent by the controller to a running unit.
#[derive(Debug)]
pub enum Request {
    Update {
        args: Value,
        response_tx: oneshot::Sender<anyhow::Result<()>>,
    },
    Health {
        response_tx: oneshot::Sender<Option<Health>>,
    },
    DebugInfo {
        response_tx: oneshot::Sender<Option<Value>>,
    },
}

impl Request {
    /// Answers the request with the given handler.
    ///
    /// If the sender has stopped waiting for the response, the response is dropped.
    pub fn handle<H: Handler + ?Sized>(self, handler: &mut H) {
        match self {
            Request::Update { args, response_tx } => {
                let _ = response_tx.send(handler.update(args));
            }
            Request::Health { response_tx } => {
                let _ = response_tx.send(handler.health());
            }
            Request::DebugInfo { response_tx } => {
                let _ = response_tx.send(handler.debug_info());
            }
        }
    }
}

/// Context given to [`Component::run`].
pub struct RunContext {
    token: CancellationToken,
    requests: mpsc::Receiver<Request>,
}

impl RunContext {
    pub(crate) fn new(token: CancellationToken, requests: mpsc::Receiver<Request>) -> Self {
        Self { token, requests }
    }

    /// Token that is cancelled when the unit must stop.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for the next request.
    ///
    /// Returns `None` when the unit must stop. This future is cancel-safe and can
    /// be used in a `tokio::select!` loop.
    pub async fn next_request(&mut self) -> Option<Request> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            req = self.requests.recv() => req,
        }
    }

    /// Returns the next request if one is immediately available.
    pub fn try_next_request(&mut self) -> Option<Request> {
        if self.token.is_cancelled() {
            return None;
        }
        self.requests.try_recv().ok()
    }

    /// Answers the requests with `handler` until the unit must stop.
    pub async fn serve<H: Handler + ?Sized>(&mut self, handler: &mut H) -> anyhow::Result<()> {
        while let Some(req) = self.next_request().await {
            req.handle(handler);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::{mpsc, oneshot};
    use tokio_util::sync::CancellationToken;

    use super::{Handler, Health, Request, RunContext};
    use crate::value::Value;

    #[derive(Default)]
    struct Counter {
        updates: i64,
    }

    impl Handler for Counter {
        fn update(&mut self, args: Value) -> anyhow::Result<()> {
            anyhow::ensure!(args.as_int().is_some(), "expected an int, got {}", args.type_name());
            self.updates += 1;
            Ok(())
        }

        fn health(&self) -> Option<Health> {
            Some(Health::healthy("ok"))
        }
    }

    #[tokio::test]
    async fn serve_requests_until_cancelled() {
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(4);
        let mut ctx = RunContext::new(token.clone(), rx);
        let task = tokio::spawn(async move {
            let mut counter = Counter::default();
            ctx.serve(&mut counter).await.unwrap();
            counter.updates
        });

        let (response_tx, response_rx) = oneshot::channel();
        tx.send(Request::Update {
            args: Value::Int(1),
            response_tx,
        })
        .await
        .unwrap();
        response_rx.await.unwrap().unwrap();

        let (response_tx, response_rx) = oneshot::channel();
        tx.send(Request::Update {
            args: Value::Null,
            response_tx,
        })
        .await
        .unwrap();
        assert!(response_rx.await.unwrap().is_err());

        let (response_tx, response_rx) = oneshot::channel();
        tx.send(Request::DebugInfo { response_tx }).await.unwrap();
        assert_eq!(response_rx.await.unwrap(), None);

        let (response_tx, response_rx) = oneshot::channel();
        tx.send(Request::Health { response_tx }).await.unwrap();
        assert!(response_rx.await.unwrap().unwrap().is_healthy());

        token.cancel();
        assert_eq!(task.await.unwrap(), 1);
    }
}
