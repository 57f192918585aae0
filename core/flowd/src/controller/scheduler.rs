//! Reactive re-evaluation of the graph.
//!
//! A pass starts from seeds: the nodes whose declaration changed, and the nodes
//! whose outputs changed. Every node that transitively depends on a seed is dirty.
//! The dirty nodes are processed in topological order, ties broken by declaration
//! order. A node whose arguments resolve to the same value as before is not
//! touched, and its dependents are not re-evaluated because of it.
//!
//! The decisions are taken by the pass itself, one node at a time. The builds
//! and reconfigurations run on a bounded set of tasks, so that independent
//! branches of the graph progress concurrently.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tokio::task::JoinSet;

use super::foreach;
use super::load::LoadedGraph;
use super::metrics::ControllerMetrics;
use super::node::{Node, NodeKind};
use super::resolve::{node_scope, resolve_arguments};
use super::unit::{self, UnitContext};
use crate::config::Block;
use crate::graph::NodeIndex;
use crate::syntax::{self, Scope};
use crate::value::Value;

/// What happened to a node during a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// The node was dirty, but none of its dependencies changed.
    Skipped,
    /// The node was not re-evaluated, but its outputs changed.
    Published,
    /// The arguments resolved to the same value as before.
    Unchanged,
    /// The arguments resolved to the same value as before, after a failed evaluation.
    Recovered,
    Built,
    Reconfigured,
    /// The arguments could not be evaluated.
    Failed,
    BuildFailed,
    ReconfigureFailed,
    /// A dependency failed to evaluate.
    Blocked,
}

impl Outcome {
    /// Whether the dependents of the node cannot be evaluated.
    fn blocks(self) -> bool {
        matches!(self, Outcome::Failed | Outcome::Blocked)
    }

    /// Whether the dependents of the node must be re-evaluated.
    fn propagates(self, outputs_changed: bool) -> bool {
        match self {
            Outcome::Built | Outcome::Reconfigured | Outcome::Recovered => true,
            other => outputs_changed && !other.blocks(),
        }
    }
}

/// Summary of a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Dirty nodes, in the order in which they were processed.
    pub visited: Vec<String>,
    pub built: Vec<String>,
    pub reconfigured: Vec<String>,
    pub unchanged: Vec<String>,
    /// Nodes whose evaluation, construction or reconfiguration failed.
    pub failed: Vec<String>,
    /// Nodes that were not evaluated because a dependency failed.
    pub blocked: Vec<String>,
    pub removed: Vec<String>,
}

impl PassReport {
    /// Whether the pass left every unit as it was.
    pub fn is_noop(&self) -> bool {
        self.built.is_empty()
            && self.reconfigured.is_empty()
            && self.failed.is_empty()
            && self.blocked.is_empty()
            && self.removed.is_empty()
    }

    fn record(&mut self, id: &str, outcome: Outcome) {
        let list = match outcome {
            Outcome::Skipped | Outcome::Published => return,
            Outcome::Unchanged | Outcome::Recovered => &mut self.unchanged,
            Outcome::Built => &mut self.built,
            Outcome::Reconfigured => &mut self.reconfigured,
            Outcome::Failed | Outcome::BuildFailed | Outcome::ReconfigureFailed => &mut self.failed,
            Outcome::Blocked => &mut self.blocked,
        };
        list.push(id.to_owned());
    }
}

/// Where a pass starts.
#[derive(Debug, Default)]
pub(crate) struct Seeds {
    /// Nodes to re-evaluate unconditionally.
    pub reload: Vec<NodeIndex>,
    /// Nodes whose outputs changed.
    pub outputs: Vec<NodeIndex>,
}

enum Step {
    Done(Outcome),
    Job(BoxFuture<'static, Outcome>),
}

/// One run of the re-evaluation algorithm on a graph.
///
/// A pass owns what it reads, so that passes whose dirty sets do not overlap
/// can run at the same time.
pub(crate) struct Pass {
    graph: Arc<LoadedGraph>,
    scope: Arc<Scope>,
    ctx: Arc<UnitContext>,
    metrics: Option<ControllerMetrics>,
    reload: FxHashSet<NodeIndex>,
    published: FxHashSet<NodeIndex>,
    /// The seeds and every node that transitively depends on them.
    dirty: FxHashSet<NodeIndex>,
}

struct PassState {
    /// Number of dirty dependencies that have not been processed yet.
    pending: FxHashMap<NodeIndex, usize>,
    /// Nodes whose dependencies have been processed, by topological rank.
    ready: BinaryHeap<Reverse<(usize, NodeIndex)>>,
    outcomes: FxHashMap<NodeIndex, Outcome>,
    report: PassReport,
}

impl Pass {
    pub fn new(
        graph: Arc<LoadedGraph>,
        scope: Arc<Scope>,
        ctx: Arc<UnitContext>,
        metrics: Option<ControllerMetrics>,
        seeds: Seeds,
    ) -> Self {
        let reload: FxHashSet<NodeIndex> = seeds.reload.into_iter().collect();
        let published: FxHashSet<NodeIndex> = seeds.outputs.into_iter().collect();
        let dirty = graph.dag.reachable_from(reload.iter().chain(published.iter()).copied());
        Self {
            graph,
            scope,
            ctx,
            metrics,
            reload,
            published,
            dirty,
        }
    }

    pub fn dirty(&self) -> &FxHashSet<NodeIndex> {
        &self.dirty
    }

    pub async fn run(self) -> PassReport {
        let dag = &self.graph.dag;
        if self.dirty.is_empty() {
            return PassReport::default();
        }

        let pending: FxHashMap<NodeIndex, usize> = self
            .dirty
            .iter()
            .map(|&v| {
                let n = dag.dependencies(v).iter().filter(|d| self.dirty.contains(*d)).count();
                (v, n)
            })
            .collect();
        let ready = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(&v, _)| Reverse((self.graph.rank[v], v)))
            .collect();
        let mut state = PassState {
            pending,
            ready,
            outcomes: FxHashMap::default(),
            report: PassReport::default(),
        };
        log::trace!("evaluating {} dirty nodes", self.dirty.len());

        let workers = self.ctx.options.workers.max(1);
        let slow = self.ctx.options.slow_evaluation;
        let start = Instant::now();
        let mut jobs: JoinSet<(NodeIndex, Outcome, Duration)> = JoinSet::new();
        let metrics = self.metrics.as_ref();

        loop {
            while jobs.len() < workers {
                let Some(Reverse((_, v))) = state.ready.pop() else {
                    break;
                };
                let node = dag.data(v);
                state.report.visited.push(node.id.clone());
                if let Some(metrics) = metrics {
                    metrics.observe_wait(start.elapsed());
                }
                let t0 = Instant::now();
                match self.decide(v, &state) {
                    Step::Done(outcome) => {
                        if let Some(metrics) = metrics {
                            metrics.observe_evaluation(&node.id, t0.elapsed(), slow);
                        }
                        self.complete(&mut state, v, outcome);
                    }
                    Step::Job(job) => {
                        let node = Arc::clone(node);
                        jobs.spawn(async move {
                            let outcome = match AssertUnwindSafe(job).catch_unwind().await {
                                Ok(outcome) => outcome,
                                Err(_) => {
                                    log::error!("evaluation of {} panicked", node.id);
                                    node.mark_failed(String::from("evaluation panicked"));
                                    Outcome::Failed
                                }
                            };
                            (v, outcome, t0.elapsed())
                        });
                    }
                }
                if let Some(metrics) = metrics {
                    metrics.set_queue_size(state.ready.len() + jobs.len());
                }
            }

            match jobs.join_next().await {
                None => break,
                Some(Ok((v, outcome, elapsed))) => {
                    if let Some(metrics) = metrics {
                        metrics.observe_evaluation(&dag.data(v).id, elapsed, slow);
                    }
                    self.complete(&mut state, v, outcome);
                }
                Some(Err(e)) => log::error!("evaluation task failed: {e}"),
            }
        }

        if let Some(metrics) = metrics {
            metrics.set_queue_size(0);
            metrics.update_nodes(dag.iter().map(|(_, _, node)| &**node));
        }
        state.report
    }

    /// Records the outcome of `v` and schedules its dependents.
    fn complete(&self, state: &mut PassState, v: NodeIndex, outcome: Outcome) {
        let dag = &self.graph.dag;
        log::trace!("{}: {outcome:?}", dag.data(v).id);
        state.outcomes.insert(v, outcome);
        state.report.record(&dag.data(v).id, outcome);
        for d in dag.dependents(v) {
            if !self.dirty.contains(&d) {
                continue;
            }
            if let Some(n) = state.pending.get_mut(&d) {
                *n -= 1;
                if *n == 0 {
                    state.ready.push(Reverse((self.graph.rank[d], d)));
                }
            }
        }
    }

    fn decide(&self, v: NodeIndex, state: &PassState) -> Step {
        let dag = &self.graph.dag;
        let node = dag.data(v);
        let dependencies = dag.dependencies(v);

        let failed_dependency = dependencies
            .iter()
            .find(|d| state.outcomes.get(*d).is_some_and(|o| o.blocks()));
        if let Some(&d) = failed_dependency {
            let message = format!("dependency {} failed", dag.id(d));
            log::warn!("{}: {message}", node.id);
            node.mark_failed(message);
            return Step::Done(Outcome::Blocked);
        }

        let triggered = self.reload.contains(&v)
            || dependencies.iter().any(|d| {
                state
                    .outcomes
                    .get(d)
                    .is_some_and(|o| o.propagates(self.published.contains(d)))
            });
        if !triggered {
            let outcome = if self.published.contains(&v) {
                Outcome::Published
            } else {
                Outcome::Skipped
            };
            return Step::Done(outcome);
        }
        self.evaluate(v)
    }

    fn evaluate(&self, v: NodeIndex) -> Step {
        let dag = &self.graph.dag;
        let node = Arc::clone(dag.data(v));
        let scope = node_scope(&self.scope, dag, v);
        let block = node.state().block.clone();

        match block {
            Block::Component(decl) => {
                let NodeKind::Component(registration) = &node.kind else {
                    return fail(&node, format!("{} is not a component", decl.id()));
                };
                let registration = registration.clone();
                let args = match resolve_arguments(&decl, &scope) {
                    Ok(args) => args,
                    Err(e) => return fail(&node, e.to_string()),
                };
                let (instance, unchanged, was_failed) = {
                    let state = node.state();
                    let instance = state.instance.clone().filter(|i| i.is_alive());
                    (instance, state.inputs.as_ref() == Some(&args), state.eval_failed)
                };
                match instance {
                    Some(_) if unchanged => {
                        if was_failed {
                            node.mark_recovered();
                            Step::Done(Outcome::Recovered)
                        } else {
                            Step::Done(Outcome::Unchanged)
                        }
                    }
                    Some(instance) => {
                        let timeout = self.ctx.options.update_timeout;
                        Step::Job(Box::pin(unit::reconfigure(node, instance, args, timeout)))
                    }
                    None => Step::Job(Box::pin(unit::build(node, registration, args, Arc::clone(&self.ctx)))),
                }
            }
            Block::ForEach(decl) => {
                let items = match syntax::eval(&decl.arguments.collection, &scope) {
                    Ok(Value::Array(items)) => items,
                    Ok(other) => {
                        let message = format!(
                            "argument \"collection\": expected an array, got a {}",
                            other.type_name()
                        );
                        return fail(&node, message);
                    }
                    Err(e) => return fail(&node, format!("argument \"collection\": {e}")),
                };
                let instances = foreach::instance_keys(&node.id, items, &decl.arguments);
                Step::Job(Box::pin(foreach::apply(node, decl, instances, scope, Arc::clone(&self.ctx))))
            }
        }
    }
}

fn fail(node: &Node, message: String) -> Step {
    log::warn!("evaluation of {} failed: {message}", node.id);
    node.mark_failed(message);
    Step::Done(Outcome::Failed)
}

#[cfg(test)]
mod tests {
    use super::{Outcome, PassReport};

    #[test]
    fn propagation() {
        assert!(Outcome::Built.propagates(false));
        assert!(Outcome::Recovered.propagates(false));
        assert!(!Outcome::Unchanged.propagates(false));
        assert!(Outcome::Unchanged.propagates(true));
        assert!(Outcome::Published.propagates(true));
        assert!(!Outcome::Failed.propagates(true));
        assert!(!Outcome::Skipped.propagates(false));
    }

    #[test]
    fn report() {
        let mut report = PassReport::default();
        report.record("a", Outcome::Skipped);
        report.record("b", Outcome::Recovered);
        assert!(report.is_noop());
        report.record("c", Outcome::BuildFailed);
        report.record("d", Outcome::Blocked);
        assert!(!report.is_noop());
        assert_eq!(report.unchanged, vec!["b"]);
        assert_eq!(report.failed, vec!["c"]);
        assert_eq!(report.blocked, vec!["d"]);
    }
}
