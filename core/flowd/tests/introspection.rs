use std::sync::Arc;
use std::time::Duration;

use flowd::controller::{Controller, ControllerOptions, QueryError};
use flowd::registry::Stability;
use flowd::service::{ServiceRegistry, SingleNodeCluster};
use flowd::value::Value;
use indoc::indoc;
use pretty_assertions::assert_eq;

mod common;
use common::{Recorder, TestController, blocks, registry};

#[tokio::test]
async fn debug_info_of_a_unit() {
    let t = TestController::with_stability(Stability::PublicPreview);
    let config = indoc! {r#"
        [[component]]
        type = "local.log"
        label = "print"
        arguments = { message = "hello" }
    "#};
    t.controller.apply(blocks(config)).await.unwrap();
    t.controller
        .apply(blocks(&config.replace("hello", "bye")))
        .await
        .unwrap();

    let detail = t.controller.node("local.log.print", Duration::from_secs(1)).await.unwrap();
    assert_eq!(
        detail.debug_info,
        Some(Value::object([
            ("updates", Value::Int(1)),
            ("message", Value::from("bye")),
        ]))
    );
    assert_eq!(detail.arguments, Some(Value::object([("message", Value::from("bye"))])));
    assert_eq!(detail.exports, None);
    t.controller.shutdown().await;
}

#[tokio::test]
async fn dependencies_and_dependents() {
    let t = TestController::new();
    let config = indoc! {r#"
        [[component]]
        type = "test.recorder"
        label = "a"
        arguments = { input = 1 }

        [[component]]
        type = "test.recorder"
        label = "b"
        expressions = { input = "test.recorder.a.input + 1" }
    "#};
    t.controller.apply(blocks(config)).await.unwrap();
    let nodes = t.controller.list_nodes();
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].id, "test.recorder.a");
    assert_eq!(nodes[0].type_name, "test.recorder");
    assert_eq!(nodes[0].label, "a");
    assert!(nodes[0].dependencies.is_empty());
    assert_eq!(nodes[0].dependents, vec!["test.recorder.b"]);
    assert_eq!(nodes[1].dependencies, vec!["test.recorder.a"]);
    t.controller.shutdown().await;
}

#[tokio::test]
async fn unanswered_query() {
    let t = TestController::new();
    let config = indoc! {r#"
        [[component]]
        type = "test.deaf"
        label = "x"
    "#};
    t.controller.apply(blocks(config)).await.unwrap();

    let res = t.controller.node("test.deaf.x", Duration::from_millis(50)).await;
    assert_eq!(res.unwrap_err(), QueryError::Timeout(String::from("test.deaf.x")));
    // the summary never waits for the unit
    assert_eq!(t.controller.list_nodes().len(), 1);
    t.controller.shutdown().await;
}

#[tokio::test]
async fn unknown_nodes() {
    let t = TestController::new();
    for id in ["nope", "test.recorder.a/foreach_1_1/x", "test.recorder.a/"] {
        let res = t.controller.node(id, Duration::from_secs(1)).await;
        assert_eq!(res.unwrap_err(), QueryError::NotFound(id.to_owned()));
    }
    t.controller.shutdown().await;
}

#[tokio::test]
async fn cluster_ownership_and_metrics() {
    let recorder = Arc::new(Recorder::default());
    let mut services = ServiceRegistry::new();
    services.set_cluster(Arc::new(SingleNodeCluster {
        name: String::from("agent-1"),
        address: String::from("127.0.0.1:12345"),
    }));
    let data_dir = tempfile::tempdir().unwrap();
    let mut options = ControllerOptions::new(Arc::new(registry(&recorder)));
    options.services = Arc::new(services);
    options.data_dir = data_dir.path().to_owned();
    let controller = Controller::new(options);

    let peers = controller.peer_ownership();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer, "agent-1");
    assert!(peers[0].is_self);

    let config = indoc! {r#"
        [[component]]
        type = "test.recorder"
        label = "a"
    "#};
    controller.apply(blocks(config)).await.unwrap();
    let metrics = controller.encode_metrics().unwrap();
    assert!(metrics.contains("controller_running_components 1"), "{metrics}");
    assert!(metrics.contains("component_evaluation_seconds_count"), "{metrics}");
    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn debug_info_is_never_torn() {
    let t = TestController::with_stability(Stability::PublicPreview);
    let config = |i: i64| {
        format!(
            r#"
            [[component]]
            type = "local.log"
            label = "print"
            arguments = {{ message = "m{i}", level = "debug" }}
            "#
        )
    };
    t.controller.apply(blocks(&config(0))).await.unwrap();

    let controller = t.controller.clone();
    let reader = tokio::spawn(async move {
        let mut snapshots = 0;
        loop {
            let detail = controller.node("local.log.print", Duration::from_secs(1)).await.unwrap();
            let info = detail.debug_info.expect("no debug info");
            let updates = info.get("updates").and_then(Value::as_int).unwrap();
            let message = info.get("message").and_then(Value::as_str).unwrap();
            // a snapshot is taken before or after an update, never during one
            assert_eq!(message, format!("m{updates}"));
            snapshots += 1;
            if updates == 20 {
                return snapshots;
            }
            tokio::task::yield_now().await;
        }
    });
    for i in 1..=20 {
        t.controller.apply(blocks(&config(i))).await.unwrap();
    }
    let snapshots = tokio::time::timeout(Duration::from_secs(5), reader).await.unwrap().unwrap();
    assert!(snapshots > 0);
    t.controller.shutdown().await;
}
