mod common;
use crate::common::{init_tracing, names, scripted};

use serde_json::json;

use convergent::template::Template;
use convergent::types::{ReplacementPolicy, StackStatus};
use convergent_test_utils::builders::{get_resource, TemplateBuilder};
use convergent_test_utils::fake_plugin::{Script, ScriptedPlugin};
use convergent_test_utils::harness::{test_config, TestEngine};

fn with_key(key: &str) -> Template {
    TemplateBuilder::new()
        .resource("net", scripted().property("replace_key", json!(key)))
        .resource(
            "server",
            scripted()
                .property("network", get_resource("net"))
                .property("flavor", json!("small")),
        )
        .build()
}

fn index(log: &[String], entry: &str) -> usize {
    log.iter()
        .rposition(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} not in {log:?}"))
}

#[tokio::test]
async fn create_before_delete_moves_dependents_first() {
    init_tracing();
    let t = TestEngine::start();
    t.converge("s", with_key("v1")).await;
    let old = t.row("s", "net").await;

    t.update("s", with_key("v2")).await.unwrap();
    let view = t.settle("s").await;
    assert_eq!(view.status, StackStatus::Complete);
    assert_eq!(names(&view), vec!["net", "server"]);

    let log = t.plugin.call_log();
    let created = index(&log, "create:net");
    let moved = index(&log, "update:server");
    let deleted = index(&log, "delete:net");
    assert!(created < moved && moved < deleted, "{log:?}");

    let new = t.row("s", "net").await;
    assert_eq!(new.generation, old.generation + 1);
    assert_ne!(new.physical_id, old.physical_id);
    let server = t.row("s", "server").await;
    assert_eq!(server.properties["network"], json!(new.physical_id.clone().unwrap()));

    // The old generation row is gone, and so is its physical resource.
    let rows = t.rows("s").await;
    assert_eq!(rows.iter().filter(|r| r.name == "net").count(), 1);
    assert!(!t.plugin.live().contains(old.physical_id.as_deref().unwrap()));
    assert_eq!(t.plugin.live().len(), 2);
    t.shutdown().await;
}

#[tokio::test]
async fn delete_before_create_removes_the_old_resource_first() {
    init_tracing();
    let plugin = ScriptedPlugin::new().with_policy(ReplacementPolicy::DeleteBeforeCreate);
    let t = TestEngine::start_with(test_config("engine-a"), plugin);
    t.converge("s", with_key("v1")).await;
    let old = t.row("s", "net").await;

    t.update("s", with_key("v2")).await.unwrap();
    let view = t.settle("s").await;
    assert_eq!(view.status, StackStatus::Complete);

    let log = t.plugin.call_log();
    assert!(index(&log, "delete:net") < index(&log, "create:net"), "{log:?}");

    let new = t.row("s", "net").await;
    assert_eq!(new.generation, old.generation + 1);
    let rows = t.rows("s").await;
    assert_eq!(rows.iter().filter(|r| r.name == "net").count(), 1);
    assert_eq!(t.plugin.live().len(), 2);
    t.shutdown().await;
}

#[tokio::test]
async fn template_policy_overrides_the_plugin_default() {
    init_tracing();
    let t = TestEngine::start();
    let template = |key: &str| {
        TemplateBuilder::new()
            .resource(
                "net",
                scripted()
                    .property("replace_key", json!(key))
                    .replacement_policy(ReplacementPolicy::DeleteBeforeCreate),
            )
            .build()
    };
    t.converge("s", template("v1")).await;
    t.update("s", template("v2")).await.unwrap();
    assert_eq!(t.settle("s").await.status, StackStatus::Complete);

    let log = t.plugin.call_log();
    assert_eq!(log, vec!["create:net", "delete:net", "create:net"]);
    t.shutdown().await;
}

#[tokio::test]
async fn failed_update_is_replaced_by_the_next_update() {
    init_tracing();
    let t = TestEngine::start();
    t.plugin.script(
        "net",
        Script {
            fail_update: true,
            ..Default::default()
        },
    );
    let template = |cidr: &str| {
        TemplateBuilder::new()
            .resource("net", scripted().property("cidr", json!(cidr)))
            .build()
    };
    t.converge("s", template("10.0.0.0/16")).await;
    t.update("s", template("10.1.0.0/16")).await.unwrap();
    assert_eq!(t.settle("s").await.status, StackStatus::Failed);
    let failed = t.row("s", "net").await;

    // A failed row with a physical resource gets a fresh generation.
    t.plugin.script("net", Script::default());
    t.update("s", template("10.2.0.0/16")).await.unwrap();
    assert_eq!(t.settle("s").await.status, StackStatus::Complete);

    let new = t.row("s", "net").await;
    assert_eq!(new.generation, failed.generation + 1);
    assert_eq!(t.plugin.count("create", "net"), 2);
    assert_eq!(t.plugin.count("delete", "net"), 1);
    assert_eq!(t.plugin.live().len(), 1);
    t.shutdown().await;
}
