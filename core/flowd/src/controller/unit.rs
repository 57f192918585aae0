//! Lifecycle of the units: build, start, reconfigure, terminate.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use anyhow::anyhow;
use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ControllerOptions;
use super::error::ReconfigureError;
use super::node::{Lifecycle, Node};
use super::scheduler::Outcome;
use crate::component::{Component, Health, HealthType, MetricsRegisterer, Options, PublishFn, Request, RunContext};
use crate::registry::Registration;
use crate::value::Value;

/// Everything that the lifecycle manager needs to build and run the units of one graph.
pub(crate) struct UnitContext {
    pub options: ControllerOptions,
    /// Prefix of the global ids of the nodes.
    pub prefix: String,
    /// Registerer given to the units.
    pub metrics: MetricsRegisterer,
    /// Receives the local id of the nodes whose outputs changed.
    pub notify_tx: mpsc::UnboundedSender<String>,
    /// Parent of the cancellation tokens of the units.
    pub token: CancellationToken,
}

/// A live unit, running on its own task.
pub(crate) struct Instance {
    requests: mpsc::Sender<Request>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Serializes the reconfigurations.
    update_lock: tokio::sync::Mutex<()>,
    exited: AtomicBool,
}

impl Instance {
    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::Acquire)
    }

    /// Delivers new arguments to the unit and waits for it to apply them, at most `timeout`.
    ///
    /// Concurrent calls wait for their turn, and the unit handles its requests one
    /// at a time: two updates never overlap, even when one of them timed out.
    pub async fn update(&self, args: Value, timeout: Duration) -> Result<(), ReconfigureError> {
        let request = async {
            let _guard = self.update_lock.lock().await;
            let (response_tx, response_rx) = oneshot::channel();
            self.requests
                .send(Request::Update { args, response_tx })
                .await
                .map_err(|_| ReconfigureError::NotRunning)?;
            match response_rx.await {
                Ok(res) => res.map_err(ReconfigureError::Rejected),
                Err(_) => Err(ReconfigureError::Dropped),
            }
        };
        tokio::time::timeout(timeout, request)
            .await
            .map_err(|_| ReconfigureError::Timeout(timeout))?
    }

    /// Asks the unit for its health. `None` if the unit does not report its health
    /// or is not running anymore.
    pub async fn health(&self) -> Option<Health> {
        let (response_tx, response_rx) = oneshot::channel();
        self.requests.send(Request::Health { response_tx }).await.ok()?;
        response_rx.await.ok().flatten()
    }

    /// Asks the unit for its debug info.
    pub async fn debug_info(&self) -> Option<Value> {
        let (response_tx, response_rx) = oneshot::channel();
        self.requests.send(Request::DebugInfo { response_tx }).await.ok()?;
        response_rx.await.ok().flatten()
    }

    /// Cancels the unit and waits for its run method to return, at most `grace`.
    pub async fn stop(&self, id: &str, grace: Duration) {
        self.token.cancel();
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(())) => log::trace!("component {id} stopped"),
                Ok(Err(e)) => log::error!("the task of component {id} failed: {e}"),
                Err(_) => log::error!(
                    "component {id} did not stop within {grace:?} after being cancelled, its task is leaked"
                ),
            }
        }
    }
}

fn publisher(node: &Arc<Node>, notify_tx: mpsc::UnboundedSender<String>) -> PublishFn {
    let node = Arc::downgrade(node);
    Arc::new(move |outputs| {
        if let Some(node) = node.upgrade() {
            if node.publish(outputs) {
                log::trace!("outputs of {} changed", node.id);
                let _ = notify_tx.send(node.local_id.clone());
            }
        }
    })
}

/// Builds the unit of `node` with `args` and starts it.
pub(crate) async fn build(node: Arc<Node>, registration: Registration, args: Value, ctx: Arc<UnitContext>) -> Outcome {
    let opts = Options::new(
        node.id.clone(),
        ctx.options.data_dir.join(&node.id),
        publisher(&node, ctx.notify_tx.clone()),
        ctx.metrics.with_label("component_id", node.id.clone()),
        Arc::clone(&ctx.options.services),
    );

    let build_args = args.clone();
    let t0 = Instant::now();
    let res = tokio::task::spawn_blocking(move || registration.build(opts, build_args)).await;
    let elapsed = t0.elapsed();

    let component = match res {
        Ok(Ok(component)) => component,
        Ok(Err(e)) => return build_failed(&node, e),
        Err(e) => return build_failed(&node, anyhow!("the factory panicked: {e}")),
    };
    node.set_lifecycle(Lifecycle::Built);

    let threshold = ctx.options.construction_warning;
    let message = if elapsed > threshold {
        log::warn!(
            "construction of component {} took {elapsed:?}, more than {threshold:?}: factories should not perform blocking operations",
            node.id
        );
        format!("component built, but construction took {elapsed:?} (warning threshold: {threshold:?})")
    } else {
        String::from("component built")
    };

    let token = ctx.token.child_token();
    let (requests, requests_rx) = mpsc::channel(ctx.options.request_queue_size.max(1));
    let instance = Arc::new(Instance {
        requests,
        token: token.clone(),
        task: Mutex::new(None),
        update_lock: tokio::sync::Mutex::new(()),
        exited: AtomicBool::new(false),
    });

    let previous = {
        let mut state = node.state();
        state.inputs = Some(args);
        state.eval_health = Health::healthy(message);
        state.run_health = None;
        state.eval_failed = false;
        state.last_update = SystemTime::now();
        state.instance.replace(Arc::clone(&instance))
    };
    if let Some(previous) = previous {
        // it has exited, otherwise the node would have been reconfigured
        previous.token.cancel();
    }
    node.set_lifecycle(Lifecycle::Running);

    let run_ctx = RunContext::new(token, requests_rx);
    let task = tokio::spawn(run(component, run_ctx, Arc::clone(&node), Arc::clone(&instance)));
    *instance.task.lock().unwrap() = Some(task);
    log::debug!("component {} built and started", node.id);
    Outcome::Built
}

fn build_failed(node: &Node, error: anyhow::Error) -> Outcome {
    let error = error.context(format!("building component {} failed", node.id));
    log::error!("{error:#}");
    {
        let mut state = node.state();
        state.eval_health = Health::unhealthy(format!("{error:#}"));
        state.last_update = SystemTime::now();
    }
    node.set_lifecycle(Lifecycle::Failed);
    Outcome::BuildFailed
}

/// Dedicated task of a unit.
async fn run(component: Box<dyn Component>, ctx: RunContext, node: Arc<Node>, instance: Arc<Instance>) {
    let res = AssertUnwindSafe(component.run(ctx)).catch_unwind().await;
    let cancelled = instance.token.is_cancelled();
    let health = match res {
        Ok(Ok(())) if cancelled => Health::new(HealthType::Exited, "component stopped"),
        Ok(Ok(())) => {
            log::warn!("component {} exited", node.id);
            Health::new(HealthType::Exited, "component exited")
        }
        Ok(Err(e)) => {
            let e = e.context(format!("component {} failed", node.id));
            log::error!("{e:#}");
            Health::unhealthy(format!("{e:#}"))
        }
        Err(_) => {
            log::error!("component {} panicked", node.id);
            Health::unhealthy("component panicked")
        }
    };
    // only record the exit of the current instance
    let current = {
        let mut state = node.state();
        let current = state.instance.as_ref().is_some_and(|i| Arc::ptr_eq(i, &instance));
        if current {
            state.run_health = Some(health);
        }
        current
    };
    if current && !cancelled {
        node.set_lifecycle(Lifecycle::Failed);
    }
    instance.exited.store(true, Ordering::Release);
}

/// Delivers new arguments to the running unit of `node`.
pub(crate) async fn reconfigure(node: Arc<Node>, instance: Arc<Instance>, args: Value, timeout: Duration) -> Outcome {
    node.set_lifecycle(Lifecycle::Updating);
    let res = instance.update(args.clone(), timeout).await;
    let outcome = {
        let mut state = node.state();
        state.last_update = SystemTime::now();
        match res {
            Ok(()) => {
                log::debug!("component {} updated", node.id);
                state.inputs = Some(args);
                state.eval_health = Health::healthy("component updated");
                state.eval_failed = false;
                Outcome::Reconfigured
            }
            Err(e) => {
                let e = anyhow::Error::from(e).context(format!("updating component {} failed", node.id));
                log::error!("{e:#}");
                state.eval_health = Health::unhealthy(format!("{e:#}"));
                Outcome::ReconfigureFailed
            }
        }
    };
    if node.lifecycle() == Lifecycle::Updating {
        node.set_lifecycle(Lifecycle::Running);
    }
    outcome
}

/// Stops the unit of `node`, or the instances of a `foreach` node, and marks it as removed.
pub(crate) async fn terminate(node: &Node, grace: Duration) {
    node.set_lifecycle(Lifecycle::Terminating);
    let (instance, children) = {
        let mut state = node.state();
        (state.instance.take(), std::mem::take(&mut state.children))
    };
    for (key, child) in children.into_iter().rev() {
        log::trace!("stopping instance {key} of {}", node.id);
        child.shutdown().await;
    }
    if let Some(instance) = instance {
        instance.stop(&node.id, grace).await;
    }
    node.set_lifecycle(Lifecycle::Removed);
}

/// Stops groups of nodes concurrently. The nodes of a group are stopped one after the other.
pub(crate) async fn terminate_groups(groups: Vec<Vec<Arc<Node>>>, grace: Duration) {
    join_all(groups.into_iter().map(|group| async move {
        for node in group {
            terminate(&node, grace).await;
        }
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::future::join_all;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::Instance;
    use crate::component::Request;
    use crate::controller::error::ReconfigureError;
    use crate::value::Value;

    fn new_instance() -> (Instance, mpsc::Receiver<Request>) {
        let (requests, requests_rx) = mpsc::channel(4);
        let instance = Instance {
            requests,
            token: CancellationToken::new(),
            task: Mutex::new(None),
            update_lock: tokio::sync::Mutex::new(()),
            exited: AtomicBool::new(false),
        };
        (instance, requests_rx)
    }

    #[tokio::test]
    async fn updates_never_overlap() {
        let (instance, mut requests_rx) = new_instance();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let (in_flight2, max_in_flight2) = (Arc::clone(&in_flight), Arc::clone(&max_in_flight));
        // answers each update on its own task
        tokio::spawn(async move {
            while let Some(req) = requests_rx.recv().await {
                let Request::Update { response_tx, .. } = req else {
                    continue;
                };
                let (in_flight, max_in_flight) = (Arc::clone(&in_flight2), Arc::clone(&max_in_flight2));
                tokio::spawn(async move {
                    let n = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(n, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = response_tx.send(Ok(()));
                });
            }
        });

        let updates = (0..4).map(|i| instance.update(Value::Int(i), Duration::from_secs(5)));
        let results = join_all(updates).await;
        assert!(results.iter().all(Result::is_ok), "{results:?}");
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unanswered_update_times_out() {
        let (instance, _requests_rx) = new_instance();
        let res = instance.update(Value::Int(1), Duration::from_millis(20)).await;
        assert!(matches!(res, Err(ReconfigureError::Timeout(_))), "{res:?}");

        // the next update waits for its own deadline, not for the unanswered one
        let res = instance.update(Value::Int(2), Duration::from_millis(20)).await;
        assert!(matches!(res, Err(ReconfigureError::Timeout(_))), "{res:?}");
    }

    #[tokio::test]
    async fn update_of_a_stopped_unit() {
        let (instance, requests_rx) = new_instance();
        drop(requests_rx);
        let res = instance.update(Value::Int(1), Duration::from_secs(1)).await;
        assert!(matches!(res, Err(ReconfigureError::NotRunning)), "{res:?}");
    }
}
