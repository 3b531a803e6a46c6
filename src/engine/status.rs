// src/engine/status.rs

//! Read-only views of a stack for callers and the CLI.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::errors::Result;
use crate::store::{require_stack, Store};
use crate::traversal::NodeState;
use crate::types::{ResourceAction, ResourceStatus, StackAction, StackStatus, TraversalId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStatusView {
    pub name: String,
    pub resource_type: String,
    pub physical_id: Option<String>,
    pub action: ResourceAction,
    pub status: ResourceStatus,
    pub status_reason: String,
    pub generation: u32,
    /// False for a superseded generation still waiting for cleanup.
    pub current: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackStatusView {
    pub stack_id: String,
    pub action: StackAction,
    pub status: StackStatus,
    pub status_reason: String,
    pub traversal: Option<TraversalId>,
    pub resources: Vec<ResourceStatusView>,
}

impl StackStatusView {
    pub fn resource(&self, name: &str) -> Option<&ResourceStatusView> {
        self.resources.iter().find(|r| r.name == name && r.current)
    }
}

/// Stack status plus every row that is current or not yet deleted.
pub async fn stack_status(store: &dyn Store, stack_id: &str) -> Result<StackStatusView> {
    let stack = require_stack(store, stack_id).await?;
    let resources = store
        .list_resources(stack_id)
        .await?
        .into_iter()
        .filter(|row| row.current || !row.is_deleted())
        .map(|row| ResourceStatusView {
            name: row.name,
            resource_type: row.resource_type,
            physical_id: row.physical_id,
            action: row.action,
            status: row.status,
            status_reason: row.status_reason,
            generation: row.generation,
            current: row.current,
        })
        .collect();

    Ok(StackStatusView {
        stack_id: stack.id,
        action: stack.action,
        status: stack.status,
        status_reason: stack.status_reason,
        traversal: stack.current_traversal,
        resources,
    })
}

/// Failed resources and their error messages.
///
/// Nodes of the current traversal can fail before they touch a row (bad
/// reference, unknown type, timeout while the row was busy); those come from
/// the traversal's graph and take precedence over older row failures.
pub async fn failures(store: &dyn Store, stack_id: &str) -> Result<BTreeMap<String, String>> {
    let stack = require_stack(store, stack_id).await?;
    let mut failed: BTreeMap<String, String> = store
        .list_resources(stack_id)
        .await?
        .into_iter()
        .filter(|row| row.status == ResourceStatus::Failed)
        .map(|row| (row.name, row.status_reason))
        .collect();

    let Some(traversal) = stack.current_traversal else {
        return Ok(failed);
    };
    if let Some(graph) = store.get_graph(stack_id, traversal).await? {
        for (node, state) in graph.states {
            if let NodeState::Failed(reason) = state {
                failed.insert(node.resource, reason);
            }
        }
    }
    Ok(failed)
}
