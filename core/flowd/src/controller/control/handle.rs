use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use indexmap::IndexMap;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry as MetricsRegistry;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::main_loop::ControlLoop;
use super::messages::{self, ControlMessage, Request};
use crate::component::{Health, MetricsRegisterer};
use crate::config::Block;
use crate::controller::ControllerOptions;
use crate::controller::error::{ControllerError, QueryError};
use crate::controller::metrics::ControllerMetrics;
use crate::controller::node::Node;
use crate::controller::query::{NodeDetail, NodeInfo};
use crate::controller::scheduler::PassReport;
use crate::controller::unit::UnitContext;
use crate::service::PeerOwnership;
use crate::syntax::Scope;
use crate::value::Value;

/// Handle to a controller.
///
/// The controller runs on its own task. Every handle talks to it by message passing,
/// except the introspection methods, which read a snapshot of the nodes.
/// Cloning the handle is cheap.
#[derive(Clone)]
pub struct Controller {
    tx: messages::Sender,
    shared: Arc<Shared>,
}

/// State shared by the control loop and the handles.
pub(crate) struct Shared {
    /// Nodes of the current graph, by local id, in declaration order.
    pub nodes: RwLock<IndexMap<String, Arc<Node>>>,
    pub options: ControllerOptions,
}

impl Controller {
    /// Starts a controller with an empty configuration.
    ///
    /// The metrics of the controller are registered in `options.metrics`.
    ///
    /// # Panics
    /// If called outside of a Tokio runtime.
    pub fn new(options: ControllerOptions) -> Self {
        let metrics = ControllerMetrics::new();
        metrics.register(&mut options.metrics.lock().unwrap());
        let unit_metrics = MetricsRegisterer::new(Arc::clone(&options.metrics));
        Self::spawn(options, String::new(), unit_metrics, Some(metrics), CancellationToken::new())
    }

    /// Starts the controller of an instance of a `foreach` block.
    pub(crate) fn spawn_child(parent: &UnitContext, prefix: String, enable_metrics: bool) -> Self {
        let unit_metrics = if enable_metrics {
            parent.metrics.clone()
        } else {
            MetricsRegisterer::new(Arc::new(Mutex::new(MetricsRegistry::default())))
        };
        Self::spawn(
            parent.options.clone(),
            prefix,
            unit_metrics,
            None,
            parent.token.child_token(),
        )
    }

    fn spawn(
        options: ControllerOptions,
        prefix: String,
        unit_metrics: MetricsRegisterer,
        metrics: Option<ControllerMetrics>,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(messages::QUEUE_SIZE);
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            nodes: RwLock::new(IndexMap::new()),
            options: options.clone(),
        });
        let ctx = Arc::new(UnitContext {
            options,
            prefix,
            metrics: unit_metrics,
            notify_tx,
            token,
        });
        let control = ControlLoop::new(ctx, Arc::clone(&shared), metrics, notify_rx);
        tokio::spawn(control.run(rx));
        Self { tx, shared }
    }

    /// Loads a configuration and evaluates it.
    ///
    /// The nodes that are not declared anymore are stopped, the new ones are built,
    /// and the nodes whose arguments changed are reconfigured. If the configuration
    /// is invalid, the previous one keeps running and a [`ControllerError::Load`] is returned.
    pub async fn apply(&self, blocks: Vec<Block>) -> Result<PassReport, ControllerError> {
        self.apply_with_scope(blocks, Scope::new()).await
    }

    /// Like [`apply`](Self::apply), with variables that the expressions can use.
    pub async fn apply_with_variables(
        &self,
        blocks: Vec<Block>,
        variables: BTreeMap<String, Value>,
    ) -> Result<PassReport, ControllerError> {
        let mut scope = Scope::new();
        for (name, value) in variables {
            scope.set_variable(name, value);
        }
        self.apply_with_scope(blocks, scope).await
    }

    pub(crate) async fn apply_with_scope(&self, blocks: Vec<Block>, scope: Scope) -> Result<PassReport, ControllerError> {
        let (response_tx, response_rx) = oneshot::channel();
        let msg = ControlMessage::Request(Request::Apply {
            blocks,
            scope,
            response_tx,
        });
        self.tx.send(msg).await.map_err(|_| ControllerError::NotAvailable)?;
        let res = response_rx.await.map_err(|_| ControllerError::NotAvailable)?;
        Ok(res?)
    }

    /// Waits until the outputs that have been published so far are propagated.
    pub async fn settle(&self) -> Result<(), ControllerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(ControlMessage::Request(Request::Settle { response_tx }))
            .await
            .map_err(|_| ControllerError::NotAvailable)?;
        response_rx.await.map_err(|_| ControllerError::NotAvailable)
    }

    /// Stops every unit, dependents first, then the controller.
    ///
    /// Each unit is given the shutdown grace period to return from its run method.
    /// Shutting down a controller that is already stopped does nothing.
    pub async fn shutdown(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self.tx.send(ControlMessage::Shutdown { response_tx }).await.is_ok() {
            // the loop may have stopped before answering, which is fine
            let _ = response_rx.await;
        }
    }

    /// Lists the nodes of the current graph, in declaration order.
    ///
    /// This never waits for the units.
    pub fn list_nodes(&self) -> Vec<NodeInfo> {
        self.nodes().iter().map(|node| NodeInfo::of(node)).collect()
    }

    /// Returns everything that is known about a node, including what its unit reports.
    ///
    /// The id of a node inside a `foreach` instance is the path to it, for instance
    /// `foreach.targets/foreach_a_1/local.log.print`. The unit is asked for its health
    /// and its debug info; if it does not answer within `timeout`, a
    /// [`QueryError::Timeout`] is returned.
    pub async fn node(&self, id: &str, timeout: Duration) -> Result<NodeDetail, QueryError> {
        let not_found = || QueryError::NotFound(id.to_owned());
        let (local, rest) = match id.split_once('/') {
            Some((local, rest)) => (local, Some(rest)),
            None => (id, None),
        };
        let node = self.shared.nodes.read().unwrap().get(local).cloned().ok_or_else(not_found)?;

        if let Some(rest) = rest {
            let (key, rest) = rest.split_once('/').ok_or_else(not_found)?;
            let child = node.state().children.get(key).cloned().ok_or_else(not_found)?;
            return Box::pin(child.node(rest, timeout)).await.map_err(|e| match e {
                QueryError::NotFound(_) => not_found(),
                QueryError::Timeout(_) => QueryError::Timeout(id.to_owned()),
            });
        }

        let mut detail = NodeDetail::of(&node);
        let instance = node.state().instance.clone().filter(|i| i.is_alive());
        if let Some(instance) = instance {
            let query = async { (instance.health().await, instance.debug_info().await) };
            let (health, debug_info) = tokio::time::timeout(timeout, query)
                .await
                .map_err(|_| QueryError::Timeout(id.to_owned()))?;
            if let Some(health) = health {
                detail.info.health = Health::least_healthy(detail.info.health, health);
            }
            detail.debug_info = debug_info;
        }
        Ok(detail)
    }

    /// Reports which part of the work each peer of the cluster owns.
    pub fn peer_ownership(&self) -> Vec<PeerOwnership> {
        self.shared
            .options
            .services
            .cluster()
            .map(|cluster| cluster.ownership())
            .unwrap_or_default()
    }

    /// Renders the metrics of the controller and of its units in the Prometheus text format.
    pub fn encode_metrics(&self) -> Result<String, fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.shared.options.metrics.lock().unwrap())?;
        Ok(buf)
    }

    fn nodes(&self) -> Vec<Arc<Node>> {
        self.shared.nodes.read().unwrap().values().cloned().collect()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nodes: Vec<String> = self.shared.nodes.read().unwrap().keys().cloned().collect();
        f.debug_struct("Controller").field("nodes", &nodes).finish_non_exhaustive()
    }
}
