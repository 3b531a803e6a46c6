mod common;
use crate::common::{init_tracing, names, scripted};

use serde_json::json;

use convergent::engine::StackRequest;
use convergent::store::Store;
use convergent::template::Template;
use convergent::types::{ResourceAction, ResourceStatus, StackAction, StackStatus};
use convergent_test_utils::builders::{get_resource, TemplateBuilder};
use convergent_test_utils::fake_plugin::Script;
use convergent_test_utils::harness::TestEngine;

fn version(n: i64) -> Template {
    TemplateBuilder::new()
        .resource("a", scripted().property("size", json!(1)))
        .resource(
            "b",
            scripted()
                .property("parent", get_resource("a"))
                .property("size", json!(n)),
        )
        .build()
}

fn failing(create: bool, update: bool, delete: bool) -> Script {
    Script {
        fail_create: create,
        fail_update: update,
        fail_delete: delete,
        ..Default::default()
    }
}

#[tokio::test]
async fn failed_update_rolls_back_to_the_last_good_template() {
    init_tracing();
    let t = TestEngine::start();
    t.converge("s", version(1)).await;
    let a_before = t.row("s", "a").await;

    t.plugin.script("b", failing(false, true, false));
    t.engine
        .update_stack("s", StackRequest::new(version(2)).with_rollback(true))
        .await
        .unwrap();
    let view = t.settle("s").await;

    assert_eq!(view.action, StackAction::Rollback);
    assert_eq!(view.status, StackStatus::Complete);
    assert_eq!(names(&view), vec!["a", "b"]);

    // b failed mid-update, so the rollback put a fresh one in its place.
    let b = t.row("s", "b").await;
    assert_eq!(b.properties["size"], json!(1));
    assert_eq!(b.generation, 1);
    assert_eq!(t.plugin.count("create", "b"), 2);

    let a = t.row("s", "a").await;
    assert_eq!(a.physical_id, a_before.physical_id);
    assert_eq!(t.plugin.count("update", "a"), 0);
    assert_eq!(t.plugin.live().len(), 2);

    let events = t.engine.events("s").await.unwrap();
    let stack_events: Vec<(String, String)> = events
        .iter()
        .filter(|e| e.resource_name == "s")
        .map(|e| (e.action.clone(), e.status.clone()))
        .collect();
    assert!(stack_events.contains(&("UPDATE".into(), "FAILED".into())));
    assert!(stack_events.contains(&("ROLLBACK".into(), "COMPLETE".into())));
    t.shutdown().await;
}

#[tokio::test]
async fn failed_create_rolls_back_to_nothing() {
    init_tracing();
    let t = TestEngine::start();
    t.plugin.script("b", failing(true, false, false));
    t.engine
        .create_stack("s", StackRequest::new(version(1)).with_rollback(true))
        .await
        .unwrap();
    let view = t.settle("s").await;

    assert_eq!(view.action, StackAction::Rollback);
    assert_eq!(view.status, StackStatus::Complete);
    assert!(view.resources.is_empty());
    assert!(t.plugin.live().is_empty());
    assert_eq!(t.plugin.count("delete", "a"), 1);
    // b never got a physical resource, so there was nothing to delete.
    assert_eq!(t.plugin.count("delete", "b"), 0);
    t.shutdown().await;
}

#[tokio::test]
async fn failed_update_without_rollback_can_be_rolled_back_later() {
    init_tracing();
    let t = TestEngine::start();
    t.converge("s", version(1)).await;

    t.plugin.script("b", failing(false, true, false));
    t.update("s", version(2)).await.unwrap();
    let view = t.settle("s").await;
    assert_eq!(view.action, StackAction::Update);
    assert_eq!(view.status, StackStatus::Failed);

    t.engine.rollback_stack("s").await.unwrap();
    let view = t.settle("s").await;
    assert_eq!(view.action, StackAction::Rollback);
    assert_eq!(view.status, StackStatus::Complete);
    assert_eq!(t.row("s", "b").await.properties["size"], json!(1));

    let stack = t.store.get_stack("s").await.unwrap().unwrap();
    let known_good = stack.known_good.unwrap();
    assert_eq!(known_good.template.resources["b"].properties["size"], json!(1));
    t.shutdown().await;
}

#[tokio::test]
async fn failed_rollback_is_not_rolled_back_again() {
    init_tracing();
    let t = TestEngine::start();
    t.converge("s", version(1)).await;

    // The update adds c, which then refuses to go away.
    let mut with_c = version(2);
    with_c
        .resources
        .insert("c".to_string(), scripted().build());
    t.plugin.script("b", failing(false, true, false));
    t.plugin.script("c", failing(false, false, true));
    t.engine
        .update_stack("s", StackRequest::new(with_c).with_rollback(true))
        .await
        .unwrap();
    let view = t.settle("s").await;

    assert_eq!(view.action, StackAction::Rollback);
    assert_eq!(view.status, StackStatus::Failed);
    assert!(view.status_reason.contains("c delete failed"), "{}", view.status_reason);
    assert_eq!(t.plugin.count("delete", "c"), 1);
    assert!(t.store.get_lock("s").await.unwrap().is_none());
    t.shutdown().await;
}

#[tokio::test]
async fn failed_delete_leaves_the_stack_failed() {
    init_tracing();
    let t = TestEngine::start();
    t.plugin.script("a", failing(false, false, true));
    let view = t.converge("s", version(1)).await;
    assert_eq!(view.status, StackStatus::Complete);

    t.engine.delete_stack("s").await.unwrap();
    let view = t.settle("s").await;

    assert_eq!(view.action, StackAction::Delete);
    assert_eq!(view.status, StackStatus::Failed);
    // b went first and is gone; a is still there.
    let b = view.resource("b").unwrap();
    assert_eq!((b.action, b.status), (ResourceAction::Delete, ResourceStatus::Complete));
    let a = view.resource("a").unwrap();
    assert_eq!((a.action, a.status), (ResourceAction::Delete, ResourceStatus::Failed));
    assert_eq!(t.plugin.live().len(), 1);

    let stack = t.store.get_stack("s").await.unwrap().unwrap();
    assert!(!stack.is_deleted());
    t.shutdown().await;
}
