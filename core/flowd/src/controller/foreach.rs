//! Dynamic fan-out: one sub-controller per item of a collection.
//!
//! Each instance is identified by a key derived from the item (or from its
//! identity field), not from its position, so that reordering the collection
//! does not rebuild the instances.

use std::sync::Arc;
use std::time::SystemTime;

use futures::future::join_all;
use indexmap::IndexMap;
use rustc_hash::FxHashSet;
use sha2::{Digest, Sha256};

use super::Controller;
use super::node::{Lifecycle, Node};
use super::scheduler::Outcome;
use super::unit::UnitContext;
use crate::component::Health;
use crate::config::{ForEachArguments, ForEachDeclaration};
use crate::syntax::Scope;
use crate::value::Value;

/// Computes the part of an instance key that identifies an item.
pub fn fingerprint(item: &Value, hash_string_id: bool) -> String {
    match item {
        Value::String(s) if hash_string_id => sha256_hex(s),
        Value::String(s) => s
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect(),
        Value::Int(i) => i.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Float(f) => format!("{f:.6}").replace('.', "_"),
        other => sha256_hex(&other.to_string()),
    }
}

fn sha256_hex(s: &str) -> String {
    format!("{:x}", Sha256::digest(s.as_bytes()))
}

/// Computes the key of every item of the collection.
///
/// Items that have the same fingerprint are told apart by a counter:
/// `[1, 2, 1]` gives `foreach_1_1`, `foreach_2_1` and `foreach_1_2`.
pub(crate) fn instance_keys(id: &str, items: Vec<Value>, args: &ForEachArguments) -> Vec<(String, Value)> {
    let mut counts: IndexMap<String, usize> = IndexMap::new();
    items
        .into_iter()
        .map(|item| {
            let identity = match &args.id {
                Some(field) => match item.get(field) {
                    Some(value) => value,
                    None => {
                        log::warn!(
                            "{id}: item {item} has no field {field:?}, the whole item is used as its identity"
                        );
                        &item
                    }
                },
                None => &item,
            };
            let fingerprint = fingerprint(identity, args.hash_string_id);
            let count = counts.entry(fingerprint.clone()).or_insert(0);
            *count += 1;
            let key = format!("foreach_{fingerprint}_{count}");
            (key, item)
        })
        .collect()
}

/// Brings the instances of a `foreach` node in line with the collection.
///
/// The instances whose key disappeared are shut down, the new ones are created,
/// then the template is applied to every instance, concurrently.
pub(crate) async fn apply(
    node: Arc<Node>,
    decl: ForEachDeclaration,
    instances: Vec<(String, Value)>,
    scope: Scope,
    ctx: Arc<UnitContext>,
) -> Outcome {
    let first = node.lifecycle() == Lifecycle::Unresolved;
    // the instances stay visible to the queries while they are brought in line
    let previous = node.state().children.clone();

    let keys: FxHashSet<&str> = instances.iter().map(|(key, _)| key.as_str()).collect();
    let stale: Vec<String> = previous
        .keys()
        .filter(|key| !keys.contains(key.as_str()))
        .cloned()
        .collect();
    for key in &stale {
        log::debug!("{}: removing instance {key}", node.id);
        previous[key].shutdown().await;
        node.state().children.shift_remove(key);
    }

    let mut children: IndexMap<String, Controller> = IndexMap::with_capacity(instances.len());
    for (key, _) in &instances {
        let child = match previous.get(key) {
            Some(child) => child.clone(),
            None => {
                log::debug!("{}: creating instance {key}", node.id);
                let prefix = format!("{}/{key}/", node.id);
                let child = Controller::spawn_child(&ctx, prefix, decl.arguments.enable_metrics);
                node.state().children.insert(key.clone(), child.clone());
                child
            }
        };
        children.insert(key.clone(), child);
    }

    let applies = instances.iter().map(|(key, item)| {
        let child = children[key].clone();
        let scope = scope.clone().with_variable(decl.arguments.var.clone(), item.clone());
        let template = decl.template.clone();
        async move { (key.clone(), child.apply_with_scope(template, scope).await) }
    });
    let results = join_all(applies).await;

    let mut changed = !stale.is_empty();
    let mut errors = Vec::new();
    for (key, res) in results {
        match res {
            Ok(report) => changed |= !report.is_noop(),
            Err(e) => errors.push(format!("instance {key}: {e}")),
        }
    }

    let n = children.len();
    {
        let mut state = node.state();
        state.children = children;
        state.inputs = Some(Value::Array(instances.into_iter().map(|(_, item)| item).collect()));
        state.last_update = SystemTime::now();
        if errors.is_empty() {
            state.eval_health = Health::healthy(format!("{n} instances"));
            state.eval_failed = false;
        } else {
            log::error!("{}: {}", node.id, errors.join("; "));
            state.eval_health = Health::unhealthy(errors.join("; "));
            state.eval_failed = true;
        }
    }
    node.set_lifecycle(Lifecycle::Running);

    match (errors.is_empty(), first, changed) {
        (false, _, _) => Outcome::Failed,
        (true, true, _) => Outcome::Built,
        (true, false, true) => Outcome::Reconfigured,
        (true, false, false) => Outcome::Unchanged,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::{fingerprint, instance_keys};
    use crate::config::ForEachArguments;
    use crate::syntax::parse;
    use crate::value::Value;

    fn args(id: Option<&str>, hash_string_id: bool) -> ForEachArguments {
        ForEachArguments {
            collection: parse("[]").unwrap(),
            var: String::from("item"),
            id: id.map(str::to_owned),
            hash_string_id,
            enable_metrics: false,
        }
    }

    fn keys(items: Vec<Value>, args: &ForEachArguments) -> Vec<String> {
        instance_keys("foreach.test", items, args).into_iter().map(|(k, _)| k).collect()
    }

    #[test]
    fn fingerprints() {
        assert_eq!(fingerprint(&Value::from("a.b-c"), false), "a_b_c");
        assert_eq!(fingerprint(&Value::Int(42), false), "42");
        assert_eq!(fingerprint(&Value::Bool(true), false), "true");
        assert_eq!(fingerprint(&Value::Float(2.5), false), "2_500000");
        assert_eq!(
            fingerprint(&Value::from("abc"), true),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        // composite values are hashed
        let object = fingerprint(&Value::object([("a", Value::Int(1))]), false);
        assert_eq!(object.len(), 64);
        assert_ne!(object, fingerprint(&Value::object([("a", Value::Int(2))]), false));
    }

    #[test]
    fn duplicates() {
        let items = vec![Value::Int(1), Value::Int(2), Value::Int(1)];
        assert_eq!(keys(items, &args(None, false)), vec!["foreach_1_1", "foreach_2_1", "foreach_1_2"]);
    }

    #[test]
    fn identity_field() {
        let item = |name: &str, port: i64| Value::object([("name", Value::from(name)), ("port", Value::Int(port))]);
        let args = args(Some("name"), false);
        assert_eq!(
            keys(vec![item("a", 80), item("b", 81)], &args),
            vec!["foreach_a_1", "foreach_b_1"]
        );
        // the other fields do not change the identity
        assert_eq!(keys(vec![item("b", 90)], &args), vec!["foreach_b_1"]);
        // items without the field are identified by their whole value
        assert_eq!(keys(vec![Value::Int(3)], &args), vec!["foreach_3_1"]);
    }
}
