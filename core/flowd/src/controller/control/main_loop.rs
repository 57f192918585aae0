//! Control loop of a controller.
//!
//! The loop owns the graph. It starts passes and keeps receiving messages and
//! notifications while they run:
//! - a notification starts a pass right away when the nodes it makes dirty are
//!   not part of a pass in progress, otherwise it waits for that pass;
//! - `Apply` and `Settle` wait for every pass in progress;
//! - `Shutdown` interrupts the passes in progress.
use std::collections::VecDeque;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use indexmap::IndexSet;
use rustc_hash::FxHashSet;
use tokio::sync::mpsc;

use super::handle::Shared;
use super::messages::{self, ControlMessage, Request, ResponseSender};
use crate::config::Block;
use crate::controller::error::LoadError;
use crate::controller::load::{LoadedGraph, Names, Rebuilt, analyze, build_graph, changed_externals};
use crate::controller::metrics::ControllerMetrics;
use crate::controller::scheduler::{Pass, PassReport, Seeds};
use crate::controller::unit::{self, UnitContext};
use crate::graph::NodeIndex;
use crate::syntax::Scope;

/// State owned by the control loop. Nothing else modifies the graph.
pub(crate) struct ControlLoop {
    ctx: Arc<UnitContext>,
    graph: Arc<LoadedGraph>,
    /// Names visible to the expressions, in addition to the nodes of the graph.
    scope: Arc<Scope>,
    shared: Arc<Shared>,
    metrics: Option<ControllerMetrics>,
    /// Local ids of the nodes whose outputs changed.
    notify_rx: mpsc::UnboundedReceiver<String>,
    /// Passes in progress.
    running: FuturesUnordered<BoxFuture<'static, Finished>>,
    /// Dirty nodes of the passes in progress. The dirty sets of two passes never overlap.
    busy: FxHashSet<NodeIndex>,
    /// Local ids of the nodes whose outputs changed while a pass that depends on them was in progress.
    waiting: IndexSet<String>,
    /// Work that waits until no pass is in progress.
    deferred: VecDeque<Deferred>,
    /// Callers of `Shutdown`.
    shutdown: Vec<ResponseSender<()>>,
}

enum Deferred {
    Request(Request),
    /// A `Settle` whose notifications are being processed.
    Settling(ResponseSender<()>),
}

/// A pass that has completed.
struct Finished {
    dirty: FxHashSet<NodeIndex>,
    report: PassReport,
    /// Set if the pass applies a configuration.
    reply: Option<ApplyReply>,
}

struct ApplyReply {
    response_tx: ResponseSender<Result<PassReport, LoadError>>,
    removed: Vec<String>,
}

impl ControlLoop {
    pub fn new(
        ctx: Arc<UnitContext>,
        shared: Arc<Shared>,
        metrics: Option<ControllerMetrics>,
        notify_rx: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            ctx,
            graph: Arc::default(),
            scope: Arc::new(Scope::new()),
            shared,
            metrics,
            notify_rx,
            running: FuturesUnordered::new(),
            busy: FxHashSet::default(),
            waiting: IndexSet::new(),
            deferred: VecDeque::new(),
            shutdown: Vec::new(),
        }
    }

    /// Main loop of the controller.
    ///
    /// Returns when the controller is shut down, or when every handle has been dropped.
    pub async fn run(mut self, mut rx: messages::Receiver) {
        while self.shutdown.is_empty() {
            if self.running.is_empty() {
                if let Some(work) = self.deferred.pop_front() {
                    match work {
                        Deferred::Request(request) => {
                            log::trace!("handling {request:?}");
                            self.handle_request(request).await;
                        }
                        Deferred::Settling(response_tx) => self.settled(response_tx).await,
                    }
                    self.start_waiting();
                    continue;
                }
            }
            tokio::select! {
                biased;
                message = rx.recv() => match message {
                    Some(ControlMessage::Shutdown { response_tx }) => self.shutdown.push(response_tx),
                    Some(ControlMessage::Request(request)) => self.deferred.push_back(Deferred::Request(request)),
                    None => {
                        log::debug!("every handle of controller {:?} has been dropped", self.ctx.prefix);
                        break;
                    }
                },
                Some(finished) = self.running.next(), if !self.running.is_empty() => {
                    self.finished(finished);
                },
                Some(id) = self.notify_rx.recv() => {
                    let mut changed = vec![id];
                    while let Ok(id) = self.notify_rx.try_recv() {
                        changed.push(id);
                    }
                    self.outputs_changed(changed);
                },
            }
        }

        if !self.running.is_empty() {
            log::debug!("interrupting {} passes of controller {:?}", self.running.len(), self.ctx.prefix);
        }
        // dropping a pass aborts its jobs, and the callers of `Apply` get `NotAvailable`
        self.running.clear();
        self.busy.clear();
        self.shutdown().await;
        for response_tx in self.shutdown.drain(..) {
            let _ = response_tx.send(());
        }
    }

    /// Handles a request. There is no pass in progress.
    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Apply {
                blocks,
                scope,
                response_tx,
            } => match self.load(blocks, scope).await {
                Ok((seeds, removed)) => {
                    let pass = self.new_pass(Seeds { reload: seeds, outputs: Vec::new() });
                    self.start(pass, Some(ApplyReply { response_tx, removed }));
                }
                Err(e) => {
                    log::error!("{e}");
                    if response_tx.send(Err(e)).is_err() {
                        log::debug!("the configuration has been rejected, but nobody waits for the result");
                    }
                }
            },
            Request::Settle { response_tx } => {
                while let Ok(id) = self.notify_rx.try_recv() {
                    self.waiting.insert(id);
                }
                self.start_outputs();
                if self.running.is_empty() {
                    self.settled(response_tx).await;
                } else {
                    // answered once the passes that it started are over
                    self.deferred.push_front(Deferred::Settling(response_tx));
                }
            }
        }
    }

    /// Loads a configuration and stops the nodes that are not declared anymore.
    ///
    /// Returns the nodes to evaluate and the ids of the removed nodes.
    /// If the configuration is invalid, nothing changes.
    async fn load(&mut self, blocks: Vec<Block>, scope: Scope) -> Result<(Vec<NodeIndex>, Vec<String>), LoadError> {
        let options = &self.ctx.options;
        let analysis = analyze(&blocks, &Names::of(&scope), &options.registry, options.min_stability)?;
        let changed = changed_externals(&self.scope, &scope);
        let Rebuilt { graph, removed, seeds } = build_graph(analysis, &self.graph, &self.ctx.prefix, &changed);

        let removed_ids: Vec<String> = removed.iter().flatten().map(|node| node.id.clone()).collect();
        for id in &removed_ids {
            log::info!("removing {id}");
        }
        let removed_local_ids: Vec<String> = removed.iter().flatten().map(|node| node.local_id.clone()).collect();
        unit::terminate_groups(removed, options.shutdown_grace).await;
        if let Some(metrics) = &self.metrics {
            for id in &removed_ids {
                metrics.remove_node(id);
            }
        }
        for id in &removed_local_ids {
            self.waiting.shift_remove(id);
        }

        self.graph = Arc::new(graph);
        self.scope = Arc::new(scope);
        self.publish_nodes();
        Ok((seeds, removed_ids))
    }

    fn new_pass(&self, seeds: Seeds) -> Pass {
        Pass::new(
            Arc::clone(&self.graph),
            Arc::clone(&self.scope),
            Arc::clone(&self.ctx),
            self.metrics.clone(),
            seeds,
        )
    }

    fn start(&mut self, pass: Pass, reply: Option<ApplyReply>) {
        let dirty = pass.dirty().clone();
        self.busy.extend(dirty.iter().copied());
        if let Some(metrics) = &self.metrics {
            metrics.set_evaluating(true);
        }
        self.running.push(Box::pin(async move {
            let report = pass.run().await;
            Finished { dirty, report, reply }
        }));
    }

    fn finished(&mut self, finished: Finished) {
        let Finished { dirty, report, reply } = finished;
        for v in &dirty {
            self.busy.remove(v);
        }
        if self.running.is_empty() {
            if let Some(metrics) = &self.metrics {
                metrics.set_evaluating(false);
            }
        }
        match reply {
            Some(ApplyReply { response_tx, removed }) => {
                let mut report = report;
                report.removed = removed;
                log::debug!("configuration applied: {report:?}");
                if response_tx.send(Ok(report)).is_err() {
                    log::debug!("the configuration has been applied, but nobody waits for the result");
                }
            }
            None if !report.is_noop() => log::debug!("outputs changed: {report:?}"),
            None => (),
        }
        self.start_waiting();
    }

    fn outputs_changed(&mut self, ids: Vec<String>) {
        self.waiting.extend(ids);
        self.start_waiting();
    }

    /// Starts a pass for the waiting nodes, unless a request waits for the passes in progress.
    fn start_waiting(&mut self) {
        if self.deferred.is_empty() {
            self.start_outputs();
        }
    }

    /// Starts a pass for the waiting nodes that do not affect a pass in progress.
    fn start_outputs(&mut self) {
        if self.waiting.is_empty() {
            return;
        }
        let dag = &self.graph.dag;
        let mut outputs = Vec::new();
        let mut blocked = IndexSet::new();
        for id in self.waiting.drain(..) {
            let Some(v) = dag.index_of(&id) else {
                continue;
            };
            if dag.reachable_from([v]).is_disjoint(&self.busy) {
                outputs.push(v);
            } else {
                blocked.insert(id);
            }
        }
        self.waiting = blocked;
        if !outputs.is_empty() {
            outputs.sort_unstable();
            let pass = self.new_pass(Seeds { reload: Vec::new(), outputs });
            self.start(pass, None);
        }
    }

    /// Settles the `foreach` instances, then answers a `Settle`.
    async fn settled(&mut self, response_tx: ResponseSender<()>) {
        let children: Vec<_> = self
            .graph
            .dag
            .iter()
            .flat_map(|(_, _, node)| node.state().children.values().cloned().collect::<Vec<_>>())
            .collect();
        for child in children {
            if let Err(e) = child.settle().await {
                log::trace!("could not settle a foreach instance: {e}");
            }
        }
        let _ = response_tx.send(());
    }

    /// Stops every unit, dependents first.
    async fn shutdown(&mut self) {
        log::debug!("shutting down controller {:?}", self.ctx.prefix);
        let dag = &self.graph.dag;
        let groups: Vec<Vec<_>> = dag
            .stop_groups()
            .unwrap_or_default()
            .into_iter()
            .map(|group| group.into_iter().map(|v| Arc::clone(dag.data(v))).collect())
            .collect();
        unit::terminate_groups(groups, self.ctx.options.shutdown_grace).await;
        self.graph = Arc::default();
        self.publish_nodes();
        if let Some(metrics) = &self.metrics {
            metrics.set_evaluating(false);
        }
        self.ctx.token.cancel();
    }

    /// Makes the nodes of the current graph visible to the handles.
    fn publish_nodes(&self) {
        let nodes = self
            .graph
            .dag
            .iter()
            .map(|(_, id, node)| (id.to_owned(), Arc::clone(node)))
            .collect();
        *self.shared.nodes.write().unwrap() = nodes;
    }
}
