mod common;
use crate::common::{chain_template, init_tracing, names, scripted};

use serde_json::json;

use convergent::errors::ConvergeError;
use convergent::store::Store;
use convergent::types::{ResourceAction, ResourceStatus, StackAction, StackStatus};
use convergent_test_utils::builders::{get_resource, TemplateBuilder};
use convergent_test_utils::harness::TestEngine;

fn two_resources(b_size: i64) -> convergent::template::Template {
    TemplateBuilder::new()
        .resource("a", scripted().property("size", json!(1)))
        .resource("b", scripted().depends_on("a").property("size", json!(b_size)))
        .build()
}

#[tokio::test]
async fn create_then_update_only_touches_the_changed_resource() {
    init_tracing();
    let t = TestEngine::start();

    let view = t.converge("s", two_resources(1)).await;
    assert_eq!(view.action, StackAction::Create);
    assert_eq!(view.status, StackStatus::Complete);
    assert_eq!(names(&view), vec!["a", "b"]);
    assert!(view.resources.iter().all(|r| r.physical_id.is_some()));
    assert!(t.plugin.position("create", "a") < t.plugin.position("create", "b"));

    let a_before = t.row("s", "a").await;
    let b_before = t.row("s", "b").await;

    t.update("s", two_resources(2)).await.unwrap();
    let view = t.settle("s").await;
    assert_eq!(view.action, StackAction::Update);
    assert_eq!(view.status, StackStatus::Complete);

    assert_eq!(t.plugin.count("update", "a"), 0);
    assert_eq!(t.plugin.count("update", "b"), 1);
    assert_eq!(t.plugin.count("create", "a"), 1);

    let a_after = t.row("s", "a").await;
    let b_after = t.row("s", "b").await;
    assert_eq!(a_after.physical_id, a_before.physical_id);
    assert_eq!(b_after.physical_id, b_before.physical_id);
    assert_eq!(b_after.action, ResourceAction::Update);
    assert_eq!(b_after.properties["size"], json!(2));
    t.shutdown().await;
}

#[tokio::test]
async fn references_resolve_to_predecessor_data() {
    init_tracing();
    let t = TestEngine::start();
    let view = t.converge("s", chain_template()).await;
    assert_eq!(view.status, StackStatus::Complete);

    let net = t.row("s", "net").await;
    let subnet = t.row("s", "subnet").await;
    let server = t.row("s", "server").await;
    assert_eq!(subnet.properties["network"], json!(net.physical_id.unwrap()));
    assert_eq!(server.properties["subnet"], json!(subnet.physical_id.unwrap()));
    assert_eq!(server.properties["network_name"], json!("net"));

    // Traversal bookkeeping is gone once the action completed.
    assert_eq!(t.store.graph_count("s").unwrap(), 0);
    assert_eq!(t.store.sync_point_count().unwrap(), 0);
    let stack = t.store.get_stack("s").await.unwrap().unwrap();
    assert!(stack.known_good.is_some());
    assert!(t.store.get_lock("s").await.unwrap().is_none());
    t.shutdown().await;
}

#[tokio::test]
async fn unchanged_update_runs_no_operations() {
    init_tracing();
    let t = TestEngine::start();
    t.converge("s", chain_template()).await;
    let calls = t.plugin.calls().len();

    t.update("s", chain_template()).await.unwrap();
    let view = t.settle("s").await;
    assert_eq!(view.status, StackStatus::Complete);
    assert_eq!(t.plugin.calls().len(), calls);
    t.shutdown().await;
}

#[tokio::test]
async fn removing_a_resource_deletes_it_after_its_dependents_let_go() {
    init_tracing();
    let t = TestEngine::start();
    t.converge("s", chain_template()).await;

    // server stops referencing subnet, subnet leaves the template.
    let template = TemplateBuilder::new()
        .resource("net", scripted().property("cidr", json!("10.0.0.0/16")))
        .resource(
            "server",
            scripted()
                .property("network", get_resource("net"))
                .property("flavor", json!("small")),
        )
        .build();
    t.update("s", template).await.unwrap();
    let view = t.settle("s").await;

    assert_eq!(view.status, StackStatus::Complete);
    assert_eq!(names(&view), vec!["net", "server"]);
    assert!(t.plugin.position("update", "server") < t.plugin.position("delete", "subnet"));
    assert!(t.rows("s").await.iter().all(|r| r.name != "subnet"));
    t.shutdown().await;
}

#[tokio::test]
async fn delete_removes_everything_in_reverse_order() {
    init_tracing();
    let t = TestEngine::start();
    t.converge("s", chain_template()).await;
    assert_eq!(t.plugin.live().len(), 3);

    t.engine.delete_stack("s").await.unwrap();
    let view = t.settle("s").await;
    assert_eq!(view.action, StackAction::Delete);
    assert_eq!(view.status, StackStatus::Complete);
    assert!(view.resources.is_empty());
    assert!(t.plugin.live().is_empty());

    let order = [
        t.plugin.position("delete", "server").unwrap(),
        t.plugin.position("delete", "subnet").unwrap(),
        t.plugin.position("delete", "net").unwrap(),
    ];
    assert!(order[0] < order[1] && order[1] < order[2]);

    let stack = t.store.get_stack("s").await.unwrap().unwrap();
    assert!(stack.is_deleted());

    // A deleted stack name can be created again.
    let view = t.converge("s", chain_template()).await;
    assert_eq!(view.status, StackStatus::Complete);
    t.shutdown().await;
}

#[tokio::test]
async fn lifecycle_errors_are_reported_to_the_caller() {
    init_tracing();
    let t = TestEngine::start();
    t.converge("s", chain_template()).await;

    let err = t.create("s", chain_template()).await.unwrap_err();
    assert!(matches!(err, ConvergeError::InvalidState(_)));

    let err = t.update("missing", chain_template()).await.unwrap_err();
    assert!(matches!(err, ConvergeError::StackNotFound(_)));

    let cyclic = TemplateBuilder::new()
        .resource("x", scripted().depends_on("y"))
        .resource("y", scripted().depends_on("x"))
        .build();
    let err = t.update("s", cyclic).await.unwrap_err();
    assert!(matches!(err, ConvergeError::Validation(_)));
    // Nothing was dispatched and the stack is untouched.
    assert_eq!(t.plugin.count("create", "x"), 0);
    let view = t.engine.status("s").await.unwrap();
    assert_eq!(view.action, StackAction::Create);
    assert_eq!(view.status, StackStatus::Complete);

    let events = t.engine.events("s").await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.resource_name == "server" && e.status == ResourceStatus::Complete.to_string()));
    t.shutdown().await;
}
