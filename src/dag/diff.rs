// src/dag/diff.rs

//! Diff between the deployed graph and a freshly computed one.

use std::collections::{BTreeMap, BTreeSet};

use crate::dag::graph::{ConvergenceGraph, NodeChange, NodePlan};
use crate::dag::node::NodeKind;
use crate::store::ResourceRecord;

/// One live resource as recorded by the last traversals that touched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedNode {
    /// Input digest the resource last converged to (None if it never did).
    pub digest: Option<String>,
    /// Last operation completed successfully.
    pub converged: bool,
    pub requires: BTreeSet<String>,
}

/// The currently deployed graph, reconstructed from persisted resource rows:
/// one node per live resource, edges from each row's `requires`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployedGraph {
    nodes: BTreeMap<String, DeployedNode>,
}

impl DeployedGraph {
    pub fn from_records(records: &[ResourceRecord]) -> Self {
        let nodes = records
            .iter()
            .filter(|r| r.is_live())
            .map(|r| {
                (
                    r.name.clone(),
                    DeployedNode {
                        digest: r.template_digest.clone(),
                        converged: r.is_converged(),
                        requires: r.requires.clone(),
                    },
                )
            })
            .collect();
        Self { nodes }
    }

    pub fn get(&self, name: &str) -> Option<&DeployedNode> {
        self.nodes.get(name)
    }
}

/// Per-resource classification of a new graph.
///
/// Every set is ordered, so two diffs of the same inputs compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphDiff {
    /// Update nodes with nothing to do.
    pub unchanged: BTreeSet<String>,
    /// Update nodes creating a resource for the first time.
    pub added: BTreeSet<String>,
    /// Update nodes whose input changed and are updated in place.
    pub changed: BTreeSet<String>,
    /// Update nodes creating a replacement physical resource.
    pub replaced: BTreeSet<String>,
    /// Resources with a cleanup node.
    pub cleanup: BTreeSet<String>,
}

impl GraphDiff {
    pub fn compute(deployed: &DeployedGraph, new: &ConvergenceGraph) -> Self {
        let mut diff = GraphDiff::default();

        for key in new.nodes() {
            match (key.kind, new.plan(key)) {
                (NodeKind::Update, Some(NodePlan::Update(plan))) => {
                    let replace = plan.replace.is_some();
                    let change = classify(deployed, &key.resource, &plan.digest, replace);
                    diff.insert(&key.resource, change);
                }
                (NodeKind::Cleanup, _) => {
                    diff.cleanup.insert(key.resource.clone());
                }
                _ => {}
            }
        }

        diff
    }

    fn insert(&mut self, name: &str, change: NodeChange) {
        let set = match change {
            NodeChange::Added => &mut self.added,
            NodeChange::Unchanged => &mut self.unchanged,
            NodeChange::Changed => &mut self.changed,
            NodeChange::Replaced => &mut self.replaced,
        };
        set.insert(name.to_string());
    }

    /// Classification of a resource's update node, if it has one.
    pub fn change_of(&self, name: &str) -> Option<NodeChange> {
        if self.replaced.contains(name) {
            Some(NodeChange::Replaced)
        } else if self.added.contains(name) {
            Some(NodeChange::Added)
        } else if self.changed.contains(name) {
            Some(NodeChange::Changed)
        } else if self.unchanged.contains(name) {
            Some(NodeChange::Unchanged)
        } else {
            None
        }
    }

    /// Whether the new graph has any work beyond no-op nodes.
    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.changed.is_empty()
            && self.replaced.is_empty()
            && self.cleanup.is_empty()
    }
}

/// Classify one update node against the deployed graph.
pub fn classify(deployed: &DeployedGraph, name: &str, digest: &str, replace: bool) -> NodeChange {
    if replace {
        return NodeChange::Replaced;
    }
    match deployed.get(name) {
        None => NodeChange::Added,
        Some(node) if node.converged && node.digest.as_deref() == Some(digest) => {
            NodeChange::Unchanged
        }
        Some(_) => NodeChange::Changed,
    }
}
