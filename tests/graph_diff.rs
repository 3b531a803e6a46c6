mod common;
use crate::common::{chain_template, init_tracing, scripted};

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use convergent::dag::digest::input_digest;
use convergent::dag::{DeployedGraph, GraphBuilder, NodeChange};
use convergent::plugin::PluginRegistry;
use convergent::store::ResourceRecord;
use convergent::template::{
    Environment, ResolvedTemplate, StandardResolver, Template, TemplateResolver,
};
use convergent::types::{ResourceAction, ResourceStatus};
use convergent_test_utils::builders::{get_resource, TemplateBuilder};
use convergent_test_utils::fake_plugin::ScriptedPlugin;

fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    registry.register(Arc::new(ScriptedPlugin::new()));
    registry
}

fn resolve(template: &Template) -> ResolvedTemplate {
    StandardResolver
        .resolve(template, &Environment::default(), &BTreeMap::new())
        .expect("template resolves")
}

fn deployed(template: &Template) -> Vec<ResourceRecord> {
    resolve(template)
        .resources
        .values()
        .enumerate()
        .map(|(i, spec)| {
            let mut row = ResourceRecord::new("stack", &spec.name, &spec.resource_type);
            row.id = i as u64 + 1;
            row.action = ResourceAction::Create;
            row.status = ResourceStatus::Complete;
            row.physical_id = Some(format!("{}-pid", spec.name));
            row.template_properties = spec.properties.clone();
            row.requires = spec.requires.clone();
            row.template_digest = Some(input_digest(spec));
            row
        })
        .collect()
}

#[test]
fn converged_stack_diffs_as_noop() {
    init_tracing();
    let registry = registry();
    let rows = deployed(&chain_template());
    let built = GraphBuilder::new(&registry)
        .build(&resolve(&chain_template()), &rows)
        .unwrap();

    assert!(built.diff.is_noop());
    assert_eq!(built.diff.unchanged.len(), 3);
}

#[test]
fn changes_are_classified_per_resource() {
    init_tracing();
    let registry = registry();
    let mut rows = deployed(&chain_template());
    // subnet's last update failed: it has to be replaced.
    let subnet = rows.iter_mut().find(|r| r.name == "subnet").unwrap();
    subnet.action = ResourceAction::Update;
    subnet.status = ResourceStatus::Failed;

    let mut template = chain_template();
    template
        .resources
        .get_mut("server")
        .unwrap()
        .properties
        .insert("flavor".into(), json!("large"));
    template
        .resources
        .insert("volume".into(), scripted().property("server", get_resource("server")).build());

    let built = GraphBuilder::new(&registry)
        .build(&resolve(&template), &rows)
        .unwrap();
    let diff = &built.diff;

    assert_eq!(diff.change_of("net"), Some(NodeChange::Unchanged));
    assert_eq!(diff.change_of("subnet"), Some(NodeChange::Replaced));
    assert_eq!(diff.change_of("server"), Some(NodeChange::Changed));
    assert_eq!(diff.change_of("volume"), Some(NodeChange::Added));
    assert!(diff.cleanup.contains("subnet"));
    assert!(!diff.is_noop());
}

#[test]
fn deployed_graph_only_sees_live_generations() {
    let mut rows = deployed(&chain_template());
    let mut old = rows[0].clone();
    old.id = 99;
    old.current = false;
    old.template_digest = Some("stale".into());
    rows.push(old);
    let mut gone = ResourceRecord::new("stack", "gone", "Test::Scripted");
    gone.action = ResourceAction::Delete;
    gone.status = ResourceStatus::Complete;
    rows.push(gone);

    let graph = DeployedGraph::from_records(&rows);
    assert_eq!(graph.names().collect::<Vec<_>>(), vec!["net", "server", "subnet"]);
    assert_ne!(graph.get("net").unwrap().digest.as_deref(), Some("stale"));
    assert!(graph.get("server").unwrap().requires.contains("subnet"));
}

fn fanout_template(width: usize, flavors: &[u8]) -> Template {
    let mut builder = TemplateBuilder::new().resource("root", scripted());
    for i in 0..width {
        let flavor = flavors.get(i).copied().unwrap_or(0);
        builder = builder.resource(
            &format!("leaf{i}"),
            scripted()
                .property("root", get_resource("root"))
                .property("flavor", json!(flavor)),
        );
    }
    builder.build()
}

#[test]
fn cancelled_create_is_replaced_but_untouched_init_row_is_not() {
    init_tracing();
    let registry = registry();
    let mut rows = deployed(&chain_template());
    let net = rows.iter_mut().find(|r| r.name == "net").unwrap();
    net.status = ResourceStatus::Cancelled;
    net.template_digest = None;
    // Cancelled before any operation started: nothing physical yet.
    let subnet = rows.iter_mut().find(|r| r.name == "subnet").unwrap();
    subnet.action = ResourceAction::Init;
    subnet.physical_id = None;
    subnet.template_digest = None;

    let built = GraphBuilder::new(&registry)
        .build(&resolve(&chain_template()), &rows)
        .unwrap();

    assert_eq!(built.diff.change_of("net"), Some(NodeChange::Replaced));
    assert!(built.diff.cleanup.contains("net"));
    assert_ne!(built.diff.change_of("subnet"), Some(NodeChange::Replaced));
    assert!(!built.diff.cleanup.contains("subnet"));
}

proptest! {
    #[test]
    fn building_twice_gives_identical_graph_and_diff(
        width in 1usize..8,
        deployed_flavors in proptest::collection::vec(0u8..3, 8),
        desired_flavors in proptest::collection::vec(0u8..3, 8),
    ) {
        let registry = registry();
        let rows = deployed(&fanout_template(width, &deployed_flavors));
        let desired = resolve(&fanout_template(width, &desired_flavors));

        let first = GraphBuilder::new(&registry).build(&desired, &rows).unwrap();
        let second = GraphBuilder::new(&registry).build(&desired, &rows).unwrap();
        prop_assert_eq!(&first.graph, &second.graph);
        prop_assert_eq!(&first.diff, &second.diff);

        for i in 0..width {
            let name = format!("leaf{i}");
            let expected = if deployed_flavors[i] == desired_flavors[i] {
                NodeChange::Unchanged
            } else {
                NodeChange::Changed
            };
            prop_assert_eq!(first.diff.change_of(&name), Some(expected));
        }
    }
}
