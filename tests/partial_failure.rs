mod common;
use crate::common::{init_tracing, names, scripted};

use serde_json::json;

use convergent::store::Store;
use convergent::types::{ResourceStatus, StackAction, StackStatus};
use convergent_test_utils::builders::{get_attr, get_resource, TemplateBuilder};
use convergent_test_utils::fake_plugin::Script;
use convergent_test_utils::harness::TestEngine;

/// `a` with two dependents, all healthy.
fn base() -> TemplateBuilder {
    TemplateBuilder::new()
        .resource("a", scripted().property("size", json!(1)))
        .resource("b", scripted().property("parent", get_resource("a")))
        .resource("c", scripted().property("parent", get_resource("a")))
}

/// Adds `d` (scripted to fail) and `e` which needs it.
fn extended() -> convergent::template::Template {
    base()
        .resource("d", scripted().depends_on("b"))
        .resource("e", scripted().property("parent", get_resource("d")))
        .build()
}

#[tokio::test]
async fn failed_node_fails_the_stack_and_blocks_its_dependents() {
    init_tracing();
    let t = TestEngine::start();
    let view = t.converge("s", base().build()).await;
    assert_eq!(view.status, StackStatus::Complete);

    t.plugin.script(
        "d",
        Script {
            fail_create: true,
            ..Default::default()
        },
    );
    t.update("s", extended()).await.unwrap();
    let view = t.settle("s").await;

    assert_eq!(view.action, StackAction::Update);
    assert_eq!(view.status, StackStatus::Failed);
    assert!(view.status_reason.contains("d: d create failed"), "{}", view.status_reason);

    let failures = t.engine.failures("s").await.unwrap();
    assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["d"]);
    assert_eq!(failures["d"], "d create failed");

    // e was never attempted and has no row.
    assert_eq!(t.plugin.count("create", "e"), 0);
    assert!(view.resource("e").is_none());
    assert_eq!(view.resource("d").unwrap().status, ResourceStatus::Failed);

    // Healthy resources are untouched.
    for name in ["a", "b", "c"] {
        assert_eq!(t.plugin.count("create", name), 1);
        assert_eq!(t.plugin.count("update", name), 0);
        assert_eq!(view.resource(name).unwrap().status, ResourceStatus::Complete);
    }

    // The last good template is still the one without d.
    let stack = t.store.get_stack("s").await.unwrap().unwrap();
    let known_good = stack.known_good.unwrap();
    assert_eq!(known_good.template.resources.len(), 3);
    assert!(t.store.get_lock("s").await.unwrap().is_none());
    t.shutdown().await;
}

#[tokio::test]
async fn next_update_retries_the_failed_resource() {
    init_tracing();
    let t = TestEngine::start();
    t.plugin.script(
        "d",
        Script {
            fail_create: true,
            ..Default::default()
        },
    );
    let view = t.converge("s", extended()).await;
    assert_eq!(view.status, StackStatus::Failed);

    t.plugin.script("d", Script::default());
    t.update("s", extended()).await.unwrap();
    let view = t.settle("s").await;

    assert_eq!(view.status, StackStatus::Complete);
    assert_eq!(names(&view), vec!["a", "b", "c", "d", "e"]);
    assert_eq!(t.plugin.count("create", "d"), 2);
    assert_eq!(t.plugin.count("create", "e"), 1);
    assert!(t.engine.failures("s").await.unwrap().is_empty());
    t.shutdown().await;
}

#[tokio::test]
async fn independent_branches_keep_converging_after_a_failure() {
    init_tracing();
    let t = TestEngine::start();
    t.plugin.script(
        "bad",
        Script {
            fail_create: true,
            ..Default::default()
        },
    );
    let template = TemplateBuilder::new()
        .resource("bad", scripted())
        .resource("after_bad", scripted().depends_on("bad"))
        .resource("good", scripted())
        .resource("after_good", scripted().property("parent", get_resource("good")))
        .build();
    let view = t.converge("s", template).await;

    assert_eq!(view.status, StackStatus::Failed);
    assert_eq!(t.plugin.count("create", "after_good"), 1);
    assert_eq!(t.plugin.count("create", "after_bad"), 0);
    assert_eq!(
        view.resource("after_good").unwrap().status,
        ResourceStatus::Complete
    );
    t.shutdown().await;
}

#[tokio::test]
async fn failure_before_any_row_is_touched_is_still_reported() {
    init_tracing();
    let t = TestEngine::start();
    let template = TemplateBuilder::new()
        .resource("a", scripted().property("size", json!(1)))
        .resource("b", scripted().property("zone", get_attr("a", "no_such_attr")))
        .build();

    let view = t.converge("s", template).await;
    assert_eq!(view.status, StackStatus::Failed);
    assert_eq!(t.plugin.count("create", "b"), 0);
    assert!(view.resource("b").is_none());

    let failures = t.engine.failures("s").await.unwrap();
    assert_eq!(failures.keys().collect::<Vec<_>>(), vec!["b"]);
    assert!(failures["b"].contains("no_such_attr"), "{}", failures["b"]);
    t.shutdown().await;
}
