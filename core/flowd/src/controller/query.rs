//! Read path of the introspection surface.

use std::sync::Arc;

use serde::Serialize;

use super::node::{Lifecycle, Node, NodeKind};
use crate::component::Health;
use crate::value::Value;

/// Summary of a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeInfo {
    /// Global id.
    pub id: String,
    /// Id in the enclosing graph.
    pub local_id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub label: String,
    pub lifecycle: Lifecycle,
    pub health: Health,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

/// Everything that is known about a node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDetail {
    #[serde(flatten)]
    pub info: NodeInfo,
    /// Last arguments applied successfully.
    pub arguments: Option<Value>,
    /// Current outputs.
    pub exports: Option<Value>,
    /// Debug information reported by the unit.
    pub debug_info: Option<Value>,
    /// Instances of a `foreach` node.
    pub children: Vec<NodeInfo>,
}

impl NodeInfo {
    /// Builds the summary of a node without asking anything to its unit.
    ///
    /// The health of a `foreach` node includes the health of its instances.
    pub(crate) fn of(node: &Node) -> Self {
        let mut health = node.health();
        let children: Vec<_> = node.state().children.values().cloned().collect();
        if matches!(node.kind, NodeKind::ForEach) {
            for child in children {
                for info in child.list_nodes() {
                    health = Health::least_healthy(health, info.health);
                }
            }
        }
        let state = node.state();
        Self {
            id: node.id.clone(),
            local_id: node.local_id.clone(),
            type_name: node.type_name().to_owned(),
            label: state.block.label().to_owned(),
            lifecycle: node.lifecycle(),
            health,
            dependencies: state.dependencies.clone(),
            dependents: state.dependents.clone(),
        }
    }
}

impl NodeDetail {
    /// Builds the detail of a node from its state, without the information that
    /// only the unit can give.
    pub(crate) fn of(node: &Arc<Node>) -> Self {
        let info = NodeInfo::of(node);
        let state = node.state();
        let children = state
            .children
            .values()
            .flat_map(|child| child.list_nodes())
            .collect();
        Self {
            info,
            arguments: state.inputs.clone(),
            exports: state.outputs.as_deref().cloned(),
            debug_info: None,
            children,
        }
    }
}
