//! Load-time validation of a configuration and construction of its graph.
//!
//! Loading happens in two steps. [`analyze`] checks the blocks without touching
//! the running state: if it fails, the previous configuration keeps running.
//! [`build_graph`] then reuses the nodes of the previous graph that are still
//! declared, and decides which nodes must be re-evaluated.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use super::error::{Diagnostic, DiagnosticKind, LoadError};
use super::node::{Node, NodeKind};
use crate::config::{Block, ForEachDeclaration, is_identifier};
use crate::graph::{Dag, NodeIndex};
use crate::registry::{Registry, Stability, check_allowed};
use crate::syntax::{Scope, Traversal};

/// Something that an expression refers to, outside of the graph being loaded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ExternalRef {
    Variable(String),
    Outputs(String),
}

/// Names visible to a graph, in addition to its own nodes.
#[derive(Debug, Clone, Default)]
pub(crate) struct Names {
    pub variables: FxHashSet<String>,
    pub outputs: FxHashSet<String>,
}

impl Names {
    pub fn of(scope: &Scope) -> Self {
        Self {
            variables: scope.variables().keys().cloned().collect(),
            outputs: scope.outputs().keys().cloned().collect(),
        }
    }
}

/// A configuration that passed the load-time checks.
pub(crate) struct Analysis {
    pub dag: Dag<Block>,
    pub kinds: Vec<NodeKind>,
    pub externals: Vec<FxHashSet<ExternalRef>>,
    /// Position of each node in the topological order.
    pub rank: Vec<usize>,
}

#[cfg(test)]
impl std::fmt::Debug for Analysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analysis")
            .field("dag", &self.dag)
            .field("externals", &self.externals)
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// Graph of a loaded configuration.
#[derive(Default)]
pub(crate) struct LoadedGraph {
    pub dag: Dag<Arc<Node>>,
    pub rank: Vec<usize>,
    pub externals: Vec<FxHashSet<ExternalRef>>,
}

enum Reference {
    Local(NodeIndex),
    External(ExternalRef),
}

/// Resolves a traversal like the evaluator does: the nodes of the graph first,
/// then the outputs visible from outside, then the variables.
fn resolve(traversal: &Traversal, dag: &Dag<Block>, names: &Names) -> Option<Reference> {
    for k in 1..=traversal.len() {
        if let Some(v) = dag.index_of(&traversal[..k].join(".")) {
            return Some(Reference::Local(v));
        }
    }
    for k in 1..=traversal.len() {
        let id = traversal[..k].join(".");
        if names.outputs.contains(&id) {
            return Some(Reference::External(ExternalRef::Outputs(id)));
        }
    }
    let first = traversal.first()?;
    names
        .variables
        .contains(first)
        .then(|| Reference::External(ExternalRef::Variable(first.clone())))
}

/// Checks a configuration and computes its dependency graph.
///
/// Every problem is collected in the returned [`LoadError`].
pub(crate) fn analyze(
    blocks: &[Block],
    names: &Names,
    registry: &Registry,
    min_stability: Stability,
) -> Result<Analysis, LoadError> {
    let mut diagnostics = Vec::new();
    let mut dag: Dag<Block> = Dag::new();
    for block in blocks {
        let id = block.id();
        if dag.add_node(id.clone(), block.clone()).is_none() {
            diagnostics.push(Diagnostic {
                block: id,
                kind: DiagnosticKind::Duplicate,
            });
        }
    }

    let mut kinds = Vec::with_capacity(dag.len());
    let mut externals = vec![FxHashSet::default(); dag.len()];
    let mut edges = Vec::new();
    for (v, id, block) in dag.iter() {
        let mut problem = |kind: DiagnosticKind| {
            diagnostics.push(Diagnostic {
                block: id.to_owned(),
                kind,
            })
        };

        // references of the block itself
        for (argument, expr) in block.expressions() {
            for traversal in expr.traversals() {
                match resolve(&traversal, &dag, names) {
                    Some(Reference::Local(dependency)) => edges.push((v, dependency)),
                    Some(Reference::External(r)) => {
                        externals[v].insert(r);
                    }
                    None => problem(DiagnosticKind::UnresolvedReference {
                        argument: argument.to_owned(),
                        reference: traversal.join("."),
                    }),
                }
            }
        }

        match block {
            Block::Component(decl) => match registry.get(&decl.type_name) {
                None => problem(DiagnosticKind::UnknownType(decl.type_name.clone())),
                Some(registration) => {
                    let what = format!("component {:?}", registration.name);
                    match check_allowed(registration.stability, min_stability, &what) {
                        Ok(()) => kinds.push(NodeKind::Component(registration.clone())),
                        Err(e) => problem(e.into()),
                    }
                }
            },
            Block::ForEach(decl) => {
                let what = format!("block {:?}", crate::config::FOREACH);
                if let Err(e) = check_allowed(Stability::Experimental, min_stability, &what) {
                    problem(e.into());
                    continue;
                }
                match analyze_template(decl, &dag, names, registry, min_stability) {
                    Ok(outer) => {
                        // the template uses the outputs of this graph through the foreach node
                        for r in outer {
                            let local = match &r {
                                ExternalRef::Outputs(id) => dag.index_of(id),
                                ExternalRef::Variable(_) => None,
                            };
                            match local {
                                Some(dependency) => edges.push((v, dependency)),
                                None => {
                                    externals[v].insert(r);
                                }
                            }
                        }
                        kinds.push(NodeKind::ForEach);
                    }
                    Err(template_diagnostics) => {
                        for d in template_diagnostics {
                            let block = if d.block.is_empty() {
                                id.to_owned()
                            } else {
                                format!("{id}/{}", d.block)
                            };
                            diagnostics.push(Diagnostic { block, kind: d.kind });
                        }
                    }
                }
            }
        }
    }
    for (dependent, dependency) in edges {
        dag.add_edge(dependent, dependency);
    }

    let order = dag.topological_order();
    if order.is_none() {
        for cycle in dag.cycles() {
            let ids: Vec<String> = cycle.iter().map(|v| dag.id(*v).to_owned()).collect();
            diagnostics.push(Diagnostic {
                block: ids[0].clone(),
                kind: DiagnosticKind::Cycle(ids),
            });
        }
    }
    match order {
        Some(order) if diagnostics.is_empty() => {
            let mut rank = vec![0; dag.len()];
            for (position, v) in order.into_iter().enumerate() {
                rank[v] = position;
            }
            Ok(Analysis {
                dag,
                kinds,
                externals,
                rank,
            })
        }
        _ => Err(LoadError::new(diagnostics)),
    }
}

/// Checks the template of a `foreach` block, in the scope that its instances will see.
///
/// Returns the references of the template to names outside of the template.
/// The diagnostics about the `foreach` block itself have an empty block id.
fn analyze_template(
    decl: &ForEachDeclaration,
    dag: &Dag<Block>,
    names: &Names,
    registry: &Registry,
    min_stability: Stability,
) -> Result<FxHashSet<ExternalRef>, Vec<Diagnostic>> {
    let args = &decl.arguments;
    let mut invalid = Vec::new();
    if !is_identifier(&args.var) {
        invalid.push(format!("var {:?} is not a valid identifier", args.var));
    }
    if args.id.as_deref() == Some("") {
        invalid.push(String::from("id must not be empty"));
    }
    if !invalid.is_empty() {
        return Err(invalid
            .into_iter()
            .map(|message| Diagnostic {
                block: String::new(),
                kind: DiagnosticKind::InvalidForEach(message),
            })
            .collect());
    }

    let mut inner = names.clone();
    inner.variables.insert(args.var.clone());
    inner.outputs.extend(dag.iter().map(|(_, id, _)| id.to_owned()));
    let analysis = analyze(&decl.template, &inner, registry, min_stability).map_err(|e| e.diagnostics)?;
    Ok(analysis
        .externals
        .into_iter()
        .flatten()
        .filter(|r| r != &ExternalRef::Variable(args.var.clone()))
        .collect())
}

/// Result of [`build_graph`].
pub(crate) struct Rebuilt {
    pub graph: LoadedGraph,
    /// Nodes that are not declared anymore, in groups that can be stopped concurrently.
    /// Each group is in the order in which its nodes must be stopped.
    pub removed: Vec<Vec<Arc<Node>>>,
    /// Nodes that must be re-evaluated.
    pub seeds: Vec<NodeIndex>,
}

/// Turns an analysis into the graph of nodes, reusing the nodes of `previous`.
///
/// A node is re-evaluated if it is new, if its declaration changed, if one of
/// the external names it uses changed, or if it is not running properly.
pub(crate) fn build_graph(
    analysis: Analysis,
    previous: &LoadedGraph,
    prefix: &str,
    changed: &FxHashSet<ExternalRef>,
) -> Rebuilt {
    let Analysis {
        dag,
        kinds,
        externals,
        rank,
    } = analysis;
    let mut seeds = Vec::new();

    let dag = dag.map(|v, id, block| {
        match previous.dag.get(id) {
            Some(node) => {
                let mut state = node.state();
                let declaration_changed = state.block != block;
                if declaration_changed {
                    state.block = block;
                }
                let retry = state.eval_failed
                    || match node.kind {
                        NodeKind::Component(_) => !state.instance.as_ref().is_some_and(|i| i.is_alive()),
                        // the instances retry their own failures
                        NodeKind::ForEach => true,
                    };
                let external_changed = externals[v].iter().any(|r| changed.contains(r));
                if declaration_changed || retry || external_changed {
                    seeds.push(v);
                }
                Arc::clone(node)
            }
            None => {
                seeds.push(v);
                Arc::new(Node::new(format!("{prefix}{id}"), id.to_owned(), kinds[v].clone(), block))
            }
        }
    });

    for (v, _, node) in dag.iter() {
        let mut state = node.state();
        state.dependencies = dag.dependencies(v).into_iter().map(|d| dag.id(d).to_owned()).collect();
        state.dependents = dag.dependents(v).into_iter().map(|d| dag.id(d).to_owned()).collect();
    }

    let removed = previous
        .dag
        .stop_groups()
        .unwrap_or_default()
        .into_iter()
        .map(|group| {
            group
                .into_iter()
                .filter(|v| dag.index_of(previous.dag.id(*v)).is_none())
                .map(|v| Arc::clone(previous.dag.data(v)))
                .collect::<Vec<_>>()
        })
        .filter(|group| !group.is_empty())
        .collect();

    Rebuilt {
        graph: LoadedGraph { dag, rank, externals },
        removed,
        seeds,
    }
}

/// Lists the external names whose value differs between two scopes.
pub(crate) fn changed_externals(old: &Scope, new: &Scope) -> FxHashSet<ExternalRef> {
    let mut changed = FxHashSet::default();
    let (old_vars, new_vars) = (old.variables(), new.variables());
    for name in old_vars.keys().chain(new_vars.keys()) {
        if old_vars.get(name) != new_vars.get(name) {
            changed.insert(ExternalRef::Variable(name.clone()));
        }
    }
    let (old_outputs, new_outputs) = (old.outputs(), new.outputs());
    for id in old_outputs.keys().chain(new_outputs.keys()) {
        if old_outputs.get(id).map(|v| &**v) != new_outputs.get(id).map(|v| &**v) {
            changed.insert(ExternalRef::Outputs(id.clone()));
        }
    }
    changed
}
