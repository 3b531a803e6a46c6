mod common;
use crate::common::{chain_template, init_tracing, scripted};

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use convergent::dag::digest::input_digest;
use convergent::dag::{GraphBuilder, NodeChange, NodeKey, NodePlan};
use convergent::errors::{ConvergeError, ValidationError};
use convergent::plugin::PluginRegistry;
use convergent::store::ResourceRecord;
use convergent::template::{
    Environment, ResolvedTemplate, StandardResolver, Template, TemplateResolver,
};
use convergent::types::{ReplacementPolicy, ResourceAction, ResourceStatus};
use convergent_test_utils::builders::{get_resource, ResourceBuilder, TemplateBuilder};
use convergent_test_utils::fake_plugin::{ScriptedPlugin, SCRIPTED_TYPE};

fn registry(policy: ReplacementPolicy) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    registry.register(Arc::new(ScriptedPlugin::new().with_policy(policy)));
    registry
}

fn resolve(template: &Template) -> ResolvedTemplate {
    StandardResolver
        .resolve(template, &Environment::default(), &BTreeMap::new())
        .expect("template resolves")
}

/// Rows as a completed traversal of `template` would have left them.
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
            row.properties = spec.properties.clone();
            row.requires = spec.requires.clone();
            row.template_digest = Some(input_digest(spec));
            row
        })
        .collect()
}

fn deps(graph: &convergent::dag::ConvergenceGraph, key: &NodeKey) -> Vec<NodeKey> {
    graph.dependencies_of(key).cloned().collect()
}

#[test]
fn chain_builds_update_nodes_in_reference_order() {
    init_tracing();
    let registry = registry(ReplacementPolicy::CreateBeforeDelete);
    let built = GraphBuilder::new(&registry)
        .build(&resolve(&chain_template()), &[])
        .unwrap();

    assert_eq!(built.graph.len(), 3);
    assert_eq!(built.graph.roots(), vec![NodeKey::update("net")]);
    assert_eq!(
        deps(&built.graph, &NodeKey::update("server")),
        vec![NodeKey::update("net"), NodeKey::update("subnet")]
    );

    let order = built.graph.topological_order().unwrap();
    let pos = |name: &str| order.iter().position(|k| k.resource == name).unwrap();
    assert!(pos("net") < pos("subnet"));
    assert!(pos("subnet") < pos("server"));

    assert_eq!(built.diff.added.len(), 3);
    assert!(built.diff.cleanup.is_empty());
}

#[test]
fn explicit_cycle_is_rejected_naming_its_members() {
    init_tracing();
    let template = TemplateBuilder::new()
        .resource("a", scripted().depends_on("b"))
        .resource("b", scripted().property("peer", get_resource("c")))
        .resource("c", scripted().depends_on("a"))
        .resource("d", scripted().depends_on("a"))
        .build();
    let registry = registry(ReplacementPolicy::CreateBeforeDelete);

    let err = GraphBuilder::new(&registry)
        .build(&resolve(&template), &[])
        .unwrap_err();

    match err {
        ConvergeError::Validation(ValidationError::Cycle { resources }) => {
            assert_eq!(resources, vec!["a", "b", "c"]);
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
}

#[test]
fn unknown_reference_and_type_are_validation_errors() {
    init_tracing();
    let dangling = TemplateBuilder::new()
        .resource("a", scripted().property("x", get_resource("missing")))
        .build();
    let err = StandardResolver
        .resolve(&dangling, &Environment::default(), &BTreeMap::new())
        .unwrap_err();
    assert!(matches!(
        err,
        ConvergeError::Validation(ValidationError::UnknownReference { .. })
    ));

    let unknown_type = TemplateBuilder::new()
        .resource("a", ResourceBuilder::new("Nope::Missing"))
        .build();
    let registry = registry(ReplacementPolicy::CreateBeforeDelete);
    let err = GraphBuilder::new(&registry)
        .build(&resolve(&unknown_type), &[])
        .unwrap_err();
    assert!(matches!(
        err,
        ConvergeError::Validation(ValidationError::UnknownResourceType { .. })
    ));
}

#[test]
fn removed_resources_are_cleaned_up_dependents_first() {
    init_tracing();
    let registry = registry(ReplacementPolicy::CreateBeforeDelete);
    let rows = deployed(&chain_template());

    let only_net = TemplateBuilder::new()
        .resource("net", scripted().property("cidr", json!("10.0.0.0/16")))
        .build();
    let built = GraphBuilder::new(&registry)
        .build(&resolve(&only_net), &rows)
        .unwrap();
    let graph = &built.graph;

    assert!(built.diff.unchanged.contains("net"));
    assert_eq!(
        built.diff.cleanup.iter().cloned().collect::<Vec<_>>(),
        vec!["server", "subnet"]
    );
    match graph.plan(&NodeKey::cleanup("server")) {
        Some(NodePlan::Cleanup(plan)) => assert!(plan.delete_current),
        other => panic!("unexpected plan {other:?}"),
    }
    // server (uses subnet) goes before subnet.
    assert!(deps(graph, &NodeKey::cleanup("subnet")).contains(&NodeKey::cleanup("server")));
    assert!(graph.roots().contains(&NodeKey::cleanup("server")));
}

#[test]
fn create_before_delete_orders_old_generation_cleanup_last() {
    init_tracing();
    let registry = registry(ReplacementPolicy::CreateBeforeDelete);
    let rows = deployed(&chain_template());

    let mut template = chain_template();
    template
        .resources
        .get_mut("subnet")
        .unwrap()
        .properties
        .insert("replace_key".into(), json!("v2"));

    let built = GraphBuilder::new(&registry)
        .build(&resolve(&template), &rows)
        .unwrap();
    let graph = &built.graph;

    assert_eq!(built.diff.change_of("subnet"), Some(NodeChange::Replaced));
    let plan = graph.update_plan(&NodeKey::update("subnet")).unwrap();
    assert_eq!(plan.replace, Some(ReplacementPolicy::CreateBeforeDelete));

    let cleanup_deps = deps(graph, &NodeKey::cleanup("subnet"));
    assert!(cleanup_deps.contains(&NodeKey::update("subnet")));
    assert!(cleanup_deps.contains(&NodeKey::update("server")));
    assert_eq!(graph.dependents_of(&NodeKey::cleanup("subnet")).count(), 0);
}

#[test]
fn delete_before_create_deletes_first() {
    init_tracing();
    let registry = registry(ReplacementPolicy::CreateBeforeDelete);
    let rows = deployed(&chain_template());

    let mut template = chain_template();
    let server = template.resources.get_mut("server").unwrap();
    server.properties.insert("replace_key".into(), json!("v2"));
    server.replacement_policy = Some(ReplacementPolicy::DeleteBeforeCreate);

    let built = GraphBuilder::new(&registry)
        .build(&resolve(&template), &rows)
        .unwrap();
    let graph = &built.graph;

    assert_eq!(
        deps(graph, &NodeKey::update("server")),
        vec![NodeKey::update("net"), NodeKey::cleanup("server"), NodeKey::update("subnet")]
    );
    match graph.plan(&NodeKey::cleanup("server")) {
        Some(NodePlan::Cleanup(plan)) => assert!(plan.delete_current),
        other => panic!("unexpected plan {other:?}"),
    }
}

#[test]
fn type_policy_comes_from_plugin_unless_overridden() {
    init_tracing();
    let registry = registry(ReplacementPolicy::DeleteBeforeCreate);
    assert_eq!(
        registry.policy(SCRIPTED_TYPE, None).replacement,
        ReplacementPolicy::DeleteBeforeCreate
    );
    assert_eq!(
        registry
            .policy(SCRIPTED_TYPE, Some(ReplacementPolicy::CreateBeforeDelete))
            .replacement,
        ReplacementPolicy::CreateBeforeDelete
    );
}
