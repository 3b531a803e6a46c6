// src/dag/builder.rs

//! Builds the convergence graph of a traversal from the resolved template and
//! the persisted resource rows.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::dag::diff::{classify, DeployedGraph, GraphDiff};
use crate::dag::digest::input_digest;
use crate::dag::graph::{CleanupPlan, ConvergenceGraph, NodePlan, UpdatePlan};
use crate::dag::node::NodeKey;
use crate::errors::{Result, ValidationError};
use crate::plugin::PluginRegistry;
use crate::store::ResourceRecord;
use crate::template::{ResolvedResource, ResolvedTemplate};
use crate::types::ReplacementPolicy;

/// A validated graph together with its diff against what is deployed.
#[derive(Debug, Clone)]
pub struct BuiltGraph {
    pub graph: ConvergenceGraph,
    pub diff: GraphDiff,
}

pub struct GraphBuilder<'a> {
    registry: &'a PluginRegistry,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a PluginRegistry) -> Self {
        Self { registry }
    }

    /// Build and validate the graph converging `rows` to `desired`.
    ///
    /// - one update node per desired resource, after the update nodes of
    ///   everything it requires;
    /// - one cleanup node per logical name with something to delete: the
    ///   resource left the template, is being replaced, or still has
    ///   superseded generations;
    /// - replacement ordering between the two nodes of a name, and
    ///   "dependents let go first" ordering between cleanup nodes.
    ///
    /// Fails with a [`ValidationError`] before anything is scheduled.
    pub fn build(
        &self,
        desired: &ResolvedTemplate,
        rows: &[ResourceRecord],
    ) -> Result<BuiltGraph> {
        self.validate(desired)?;

        let deployed = DeployedGraph::from_records(rows);
        let existing: Vec<&ResourceRecord> = rows.iter().filter(|r| !r.is_deleted()).collect();
        let live: BTreeMap<&str, &ResourceRecord> = existing
            .iter()
            .filter(|r| r.current)
            .map(|r| (r.name.as_str(), *r))
            .collect();

        let mut graph = ConvergenceGraph::new();

        for (name, resource) in desired.resources.iter() {
            let digest = input_digest(resource);
            let replace = self.replacement_for(resource, live.get(name.as_str()).copied());
            let change = classify(&deployed, name, &digest, replace.is_some());
            graph.insert_node(
                NodeKey::update(name.clone()),
                NodePlan::Update(UpdatePlan {
                    spec: resource.clone(),
                    digest,
                    replace,
                    change,
                }),
            );
        }

        for (name, resource) in desired.resources.iter() {
            for required in resource.requires.iter() {
                graph.add_edge(
                    &NodeKey::update(required.clone()),
                    &NodeKey::update(name.clone()),
                )?;
            }
        }

        let names: BTreeSet<&str> = existing.iter().map(|r| r.name.as_str()).collect();
        for name in names {
            let replace = graph
                .update_plan(&NodeKey::update(name))
                .and_then(|plan| plan.replace);
            let in_template = desired.resources.contains_key(name);
            let superseded = existing.iter().any(|r| r.name == name && !r.current);

            let delete_current =
                !in_template || replace == Some(ReplacementPolicy::DeleteBeforeCreate);
            if delete_current || superseded || replace.is_some() {
                graph.insert_node(
                    NodeKey::cleanup(name),
                    NodePlan::Cleanup(CleanupPlan { delete_current }),
                );
            }
        }

        self.add_cleanup_edges(&mut graph, desired, &existing)?;
        graph.check_acyclic()?;

        let diff = GraphDiff::compute(&deployed, &graph);
        debug!(
            nodes = graph.len(),
            added = diff.added.len(),
            changed = diff.changed.len(),
            replaced = diff.replaced.len(),
            unchanged = diff.unchanged.len(),
            cleanup = diff.cleanup.len(),
            "convergence graph built"
        );
        Ok(BuiltGraph { graph, diff })
    }

    fn validate(&self, desired: &ResolvedTemplate) -> std::result::Result<(), ValidationError> {
        for (name, resource) in desired.resources.iter() {
            if !self.registry.contains(&resource.resource_type) {
                return Err(ValidationError::UnknownResourceType {
                    resource: name.clone(),
                    resource_type: resource.resource_type.clone(),
                });
            }
            for required in resource.requires.iter() {
                if required == name {
                    return Err(ValidationError::SelfReference {
                        resource: name.clone(),
                    });
                }
                if !desired.resources.contains_key(required) {
                    return Err(ValidationError::UnknownReference {
                        resource: name.clone(),
                        target: required.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Replacement policy if the live physical resource cannot be converged
    /// in place.
    fn replacement_for(
        &self,
        resource: &ResolvedResource,
        live: Option<&ResourceRecord>,
    ) -> Option<ReplacementPolicy> {
        let row = live.filter(|r| r.physical_id.is_some())?;

        let type_changed = row.resource_type != resource.resource_type;
        let plugin_says = self
            .registry
            .get(&resource.resource_type)
            .map(|p| p.needs_replacement(&row.template_properties, &resource.properties))
            .unwrap_or(false);
        if !(type_changed || plugin_says || row.is_incomplete()) {
            return None;
        }
        let policy = self
            .registry
            .policy(&resource.resource_type, resource.replacement_policy)
            .replacement;
        Some(policy)
    }

    fn add_cleanup_edges(
        &self,
        graph: &mut ConvergenceGraph,
        desired: &ResolvedTemplate,
        existing: &[&ResourceRecord],
    ) -> Result<()> {
        let cleanups: Vec<NodeKey> = graph.nodes().filter(|k| !k.is_update()).cloned().collect();

        for cleanup in cleanups {
            let name = cleanup.resource.as_str();
            let update = NodeKey::update(name);
            let replace = graph.update_plan(&update).and_then(|plan| plan.replace);
            let delete_before_create = replace == Some(ReplacementPolicy::DeleteBeforeCreate);

            if graph.contains(&update) {
                if delete_before_create {
                    graph.add_edge(&cleanup, &update)?;
                } else {
                    graph.add_edge(&update, &cleanup)?;
                }
            }

            // Rows that used this resource release it first: either by being
            // deleted themselves or by being updated to their new inputs.
            let dependents = existing
                .iter()
                .filter(|r| r.name != name && r.requires.contains(name));
            for row in dependents {
                let other_cleanup = NodeKey::cleanup(row.name.clone());
                let deleted_there = match graph.plan(&other_cleanup) {
                    Some(NodePlan::Cleanup(plan)) => !row.current || plan.delete_current,
                    _ => false,
                };
                if deleted_there {
                    graph.add_edge(&other_cleanup, &cleanup)?;
                }

                let other_update = NodeKey::update(row.name.clone());
                if row.current
                    && !deleted_there
                    && !delete_before_create
                    && graph.contains(&other_update)
                {
                    graph.add_edge(&other_update, &cleanup)?;
                }
            }

            // With create-before-delete, everything now requiring the
            // resource moves over to the replacement before the old one goes.
            if replace == Some(ReplacementPolicy::CreateBeforeDelete) {
                for (other, resource) in desired.resources.iter() {
                    if other != name && resource.requires.contains(name) {
                        graph.add_edge(&NodeKey::update(other.clone()), &cleanup)?;
                    }
                }
            }
        }

        Ok(())
    }
}
