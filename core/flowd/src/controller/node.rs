use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use indexmap::IndexMap;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::Serialize;

use super::Controller;
use super::unit::Instance;
use crate::component::Health;
use crate::config::Block;
use crate::registry::Registration;
use crate::value::Value;

/// Lifecycle state of a node.
#[derive(Clone, Debug, PartialEq, Eq, Copy, IntoPrimitive, FromPrimitive, Serialize)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    /// The arguments have never been resolved successfully.
    #[num_enum(default)]
    Unresolved,
    /// The unit has been constructed but does not run yet.
    Built,
    Running,
    /// The unit is applying new arguments.
    Updating,
    /// The unit is being stopped.
    Terminating,
    Removed,
    /// The construction of the unit failed, or its run method returned.
    /// The node is retried the next time that it is evaluated.
    Failed,
}

/// What a node manages.
#[derive(Clone)]
pub(crate) enum NodeKind {
    Component(Registration),
    ForEach,
}

/// Bookkeeping record of one declaration.
pub(crate) struct Node {
    /// Global id, prefixed by the ids of the enclosing `foreach` instances.
    pub id: String,
    /// Id in the enclosing graph, which is the name that expressions use.
    pub local_id: String,
    pub kind: NodeKind,
    lifecycle: AtomicU8,
    state: Mutex<NodeState>,
}

pub(crate) struct NodeState {
    pub block: Block,
    /// Last arguments applied successfully.
    pub inputs: Option<Value>,
    pub outputs: Option<Arc<Value>>,
    /// Health of the evaluation, construction and reconfiguration of the unit.
    pub eval_health: Health,
    /// How the run method of the current instance returned, `None` while it runs.
    pub run_health: Option<Health>,
    pub last_update: SystemTime,
    /// The last evaluation failed, or was blocked by a failed dependency.
    pub eval_failed: bool,
    pub instance: Option<Arc<Instance>>,
    /// Instances of a `foreach` block, by key.
    pub children: IndexMap<String, Controller>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
}

impl Node {
    pub fn new(id: String, local_id: String, kind: NodeKind, block: Block) -> Self {
        Self {
            id,
            local_id,
            kind,
            lifecycle: AtomicU8::new(Lifecycle::Unresolved.into()),
            state: Mutex::new(NodeState {
                block,
                inputs: None,
                outputs: None,
                eval_health: Health::unknown(),
                run_health: None,
                last_update: SystemTime::now(),
                eval_failed: false,
                instance: None,
                children: IndexMap::new(),
                dependencies: Vec::new(),
                dependents: Vec::new(),
            }),
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from(self.lifecycle.load(Ordering::Acquire))
    }

    pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle.into(), Ordering::Release);
    }

    pub fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap()
    }

    pub fn type_name(&self) -> &str {
        match &self.kind {
            NodeKind::Component(registration) => &registration.name,
            NodeKind::ForEach => crate::config::FOREACH,
        }
    }

    /// Whether the node has a unit whose run method has not returned.
    pub fn is_alive(&self) -> bool {
        self.state().instance.as_ref().is_some_and(|i| i.is_alive())
    }

    pub fn outputs(&self) -> Option<Arc<Value>> {
        self.state().outputs.clone()
    }

    /// Stores new outputs. Returns `true` if they differ from the previous ones.
    pub fn publish(&self, outputs: Value) -> bool {
        if matches!(self.lifecycle(), Lifecycle::Terminating | Lifecycle::Removed) {
            return false;
        }
        let mut state = self.state();
        if state.outputs.as_deref() == Some(&outputs) {
            return false;
        }
        state.outputs = Some(Arc::new(outputs));
        state.last_update = SystemTime::now();
        true
    }

    /// Marks the evaluation as failed. The outputs are kept.
    pub fn mark_failed(&self, message: String) {
        let mut state = self.state();
        state.eval_health = Health::unhealthy(message);
        state.eval_failed = true;
        state.last_update = SystemTime::now();
    }

    /// Clears a previous evaluation failure.
    pub fn mark_recovered(&self) {
        let mut state = self.state();
        state.eval_health = Health::healthy("evaluation succeeded");
        state.eval_failed = false;
        state.last_update = SystemTime::now();
    }

    /// Health of the node: the least healthy of its evaluation and of its run method.
    pub fn health(&self) -> Health {
        let state = self.state();
        match &state.run_health {
            Some(run) => Health::least_healthy(state.eval_health.clone(), run.clone()),
            None => state.eval_health.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Lifecycle, Node, NodeKind};
    use crate::component::HealthType;
    use crate::config::{Block, Declaration};
    use crate::value::Value;

    fn node() -> Node {
        let block = Block::from(Declaration::new("test.a", "x"));
        Node::new(String::from("test.a.x"), String::from("test.a.x"), NodeKind::ForEach, block)
    }

    #[test]
    fn lifecycle_roundtrip() {
        let node = node();
        assert_eq!(node.lifecycle(), Lifecycle::Unresolved);
        node.set_lifecycle(Lifecycle::Updating);
        assert_eq!(node.lifecycle(), Lifecycle::Updating);
        assert_eq!(Lifecycle::from(200u8), Lifecycle::Unresolved);
    }

    #[test]
    fn publish_only_changes() {
        let node = node();
        assert!(node.publish(Value::Int(1)));
        let first = node.outputs().unwrap();
        assert!(!node.publish(Value::Int(1)));
        // the previous value is not replaced when nothing changes
        assert!(std::sync::Arc::ptr_eq(&first, &node.outputs().unwrap()));
        assert!(node.publish(Value::Int(2)));
        assert_eq!(*first, Value::Int(1));

        node.set_lifecycle(Lifecycle::Removed);
        assert!(!node.publish(Value::Int(3)));
    }

    #[test]
    fn failure_keeps_outputs() {
        let node = node();
        node.publish(Value::Int(1));
        node.mark_failed(String::from("boom"));
        assert_eq!(node.health().health, HealthType::Unhealthy);
        assert_eq!(node.outputs().as_deref(), Some(&Value::Int(1)));
        node.mark_recovered();
        assert_eq!(node.health().health, HealthType::Healthy);
    }
}
