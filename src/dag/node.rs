// src/dag/node.rs

//! Graph node identity and the data passed between nodes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which half of a resource's lifecycle a node drives.
///
/// A resource can have both: an update node converging the current generation
/// to the template, and a cleanup node deleting superseded (or all) physical
/// instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Update,
    Cleanup,
}

/// Identity of one schedulable unit: (logical resource name, kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub resource: String,
    pub kind: NodeKind,
}

impl NodeKey {
    pub fn update(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            kind: NodeKind::Update,
        }
    }

    pub fn cleanup(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            kind: NodeKind::Cleanup,
        }
    }

    pub fn is_update(&self) -> bool {
        self.kind == NodeKind::Update
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NodeKind::Update => write!(f, "{}(update)", self.resource),
            NodeKind::Cleanup => write!(f, "{}(cleanup)", self.resource),
        }
    }
}

/// What a completed update node hands to its successors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    pub physical_id: Option<String>,
    pub attributes: Value,
}

/// Input payload of a node: data of its predecessors keyed by resource name.
pub type InputData = BTreeMap<String, ResourceData>;
