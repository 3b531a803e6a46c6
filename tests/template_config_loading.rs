mod common;
use crate::common::init_tracing;

use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use convergent::config::{load_and_validate, load_or_default, parse_duration};
use convergent::engine::StackRequest;
use convergent::errors::{ConvergeError, ValidationError};
use convergent::template::{
    load_environment, load_template, parse_template, StandardResolver, TemplateResolver,
};
use convergent::types::{ReplacementPolicy, StackStatus};
use convergent_test_utils::harness::TestEngine;

const TEMPLATE: &str = r#"
description = "two tier"

[parameters.size]
default = "small"

[parameters.zone]

[resources.net]
type = "My::Network"
properties = { cidr = "10.0.0.0/16" }

[resources.server]
type = "Convergent::Test"
depends_on = ["net"]
replacement_policy = "delete_before_create"
properties = { value = { get_param = "size" }, zone = { get_param = "zone" }, net = { get_resource = "net" } }
"#;

const ENVIRONMENT: &str = r#"
[parameters]
zone = "eu-1"
size = "large"

[resource_registry]
"My::Network" = "My::BaseNetwork"
"My::BaseNetwork" = "Convergent::None"
"#;

fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn template_and_environment_resolve_from_files() {
    let dir = TempDir::new().unwrap();
    let template = load_template(write(&dir, "stack.toml", TEMPLATE)).unwrap();
    let environment = load_environment(write(&dir, "env.toml", ENVIRONMENT)).unwrap();

    assert_eq!(template.description.as_deref(), Some("two tier"));
    assert_eq!(template.resources.len(), 2);

    let overrides = BTreeMap::from([("size".to_string(), json!("xl"))]);
    let resolved = StandardResolver
        .resolve(&template, &environment, &overrides)
        .unwrap();

    let net = &resolved.resources["net"];
    assert_eq!(net.resource_type, "Convergent::None");
    assert!(net.requires.is_empty());

    let server = &resolved.resources["server"];
    assert_eq!(server.resource_type, "Convergent::Test");
    assert_eq!(server.properties["value"], json!("xl"));
    assert_eq!(server.properties["zone"], json!("eu-1"));
    // Resource references stay for the worker to resolve.
    assert_eq!(server.properties["net"], json!({ "get_resource": "net" }));
    assert_eq!(server.requires.iter().collect::<Vec<_>>(), vec!["net"]);
    assert_eq!(
        server.replacement_policy,
        Some(ReplacementPolicy::DeleteBeforeCreate)
    );
}

#[test]
fn resolver_rejects_bad_templates() {
    let template = parse_template(TEMPLATE).unwrap();
    let err = StandardResolver
        .resolve(&template, &Default::default(), &BTreeMap::new())
        .unwrap_err();
    assert!(matches!(
        err,
        ConvergeError::Validation(ValidationError::MissingParameter { ref parameter }) if parameter == "zone"
    ));

    let mut environment = load_env(ENVIRONMENT);
    environment
        .resource_registry
        .insert("Convergent::None".to_string(), "My::Network".to_string());
    let err = StandardResolver
        .resolve(&template, &environment, &BTreeMap::new())
        .unwrap_err();
    assert!(matches!(
        err,
        ConvergeError::Validation(ValidationError::AliasLoop { .. })
    ));

    let selfish = parse_template(
        r#"
[resources.a]
type = "Convergent::None"
properties = { me = { get_attr = ["a", "name"] } }
"#,
    )
    .unwrap();
    let err = StandardResolver
        .resolve(&selfish, &Default::default(), &BTreeMap::new())
        .unwrap_err();
    assert!(matches!(
        err,
        ConvergeError::Validation(ValidationError::SelfReference { .. })
    ));

    let err = parse_template("[resources.a]\nproperties = {}\n").unwrap_err();
    assert!(matches!(err, ConvergeError::Toml(_)));
}

fn load_env(contents: &str) -> convergent::template::Environment {
    toml::from_str(contents).unwrap()
}

#[test]
fn config_file_is_parsed_and_validated() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "Convergent.toml",
        r#"
[engine]
engine_id = "engine-a"
lock_lease = "20s"
heartbeat_interval = "2s"
poll_interval = "50ms"
max_poll_interval = "1s"
stack_timeout = "1h"

[retry]
max_attempts = 5
base_delay = "10ms"
max_delay = "1s"

[resource_type."Convergent::Test"]
replacement_policy = "delete_before_create"
max_attempts = 2
node_timeout = "30s"
"#,
    );
    let config = load_and_validate(&path).unwrap();

    assert_eq!(config.engine_id, "engine-a");
    assert_eq!(config.lock_lease, Duration::from_secs(20));
    assert_eq!(config.heartbeat_interval, Duration::from_secs(2));
    assert_eq!(config.poll_interval, Duration::from_millis(50));
    assert_eq!(config.stack_timeout, Some(Duration::from_secs(3600)));
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.retry.base_delay, Duration::from_millis(10));

    let test = &config.type_overrides["Convergent::Test"];
    assert_eq!(
        test.replacement_policy,
        Some(ReplacementPolicy::DeleteBeforeCreate)
    );
    assert_eq!(test.max_attempts, Some(2));
    assert_eq!(test.node_timeout, Some(Duration::from_secs(30)));

    assert_eq!(config.poll_delay(0), Duration::from_millis(50));
    assert_eq!(config.poll_delay(2), Duration::from_millis(200));
    assert_eq!(config.poll_delay(10), Duration::from_secs(1));
}

#[test]
fn invalid_configs_are_rejected() {
    let dir = TempDir::new().unwrap();
    let cases = [
        ("[engine]\nlock_lease = \"1s\"\nheartbeat_interval = \"5s\"\n", "heartbeat_interval"),
        ("[engine]\npoll_interval = \"10x\"\n", "engine.poll_interval"),
        ("[engine]\nengine_id = \"  \"\n", "engine_id"),
        ("[retry]\nmax_attempts = 0\n", "max_attempts"),
        ("[retry]\nbase_delay = \"2s\"\nmax_delay = \"1s\"\n", "max_delay"),
        ("[resource_type.\"X\"]\nmax_attempts = 0\n", "resource_type"),
    ];
    for (i, (contents, needle)) in cases.iter().enumerate() {
        let path = write(&dir, &format!("bad-{i}.toml"), contents);
        match load_and_validate(&path) {
            Err(ConvergeError::Config(msg)) => assert!(msg.contains(needle), "{msg}"),
            other => panic!("case {i}: expected config error, got {other:?}"),
        }
    }

    let path = write(&dir, "garbage.toml", "[engine\n");
    assert!(matches!(load_and_validate(&path), Err(ConvergeError::Toml(_))));
}

#[test]
fn explicit_config_path_must_exist() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.toml");
    assert!(matches!(
        load_or_default(Some(missing.as_path())),
        Err(ConvergeError::Io(_))
    ));
}

#[test]
fn durations_need_a_known_unit() {
    assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
    assert_eq!(parse_duration(" 3s "), Ok(Duration::from_secs(3)));
    assert_eq!(parse_duration("2m"), Ok(Duration::from_secs(120)));
    assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
    assert!(parse_duration("").is_err());
    assert!(parse_duration("10").is_err());
    assert!(parse_duration("5d").is_err());
}

#[tokio::test]
async fn loaded_template_converges_with_aliases() {
    init_tracing();
    let template = parse_template(TEMPLATE).unwrap();
    let environment = load_env(ENVIRONMENT);
    let t = TestEngine::start();

    t.engine
        .create_stack("s", StackRequest::new(template).with_environment(environment))
        .await
        .unwrap();
    let view = t.settle("s").await;
    assert_eq!(view.status, StackStatus::Complete);

    let net = t.row("s", "net").await;
    let server = t.row("s", "server").await;
    assert_eq!(net.resource_type, "Convergent::None");
    assert_eq!(server.properties["net"], json!(net.physical_id.unwrap()));
    assert_eq!(server.attributes["output"], json!("large"));
    t.shutdown().await;
}
