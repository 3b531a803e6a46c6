// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::dag::node::NodeKey;
use crate::errors::{ConvergeError, Result, ValidationError};
use crate::template::ResolvedResource;
use crate::types::ReplacementPolicy;

/// How an update node relates to what is currently deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeChange {
    /// No live physical resource yet.
    Added,
    /// Live, complete and converged to the same input; the node is a no-op.
    Unchanged,
    /// Input changed; updated in place.
    Changed,
    /// Input change needs a new physical resource.
    Replaced,
}

/// Work planned for an update node.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePlan {
    pub spec: ResolvedResource,
    /// Digest of `spec`, see [`crate::dag::digest::input_digest`].
    pub digest: String,
    /// Set when the current physical resource must be replaced.
    pub replace: Option<ReplacementPolicy>,
    pub change: NodeChange,
}

/// Work planned for a cleanup node.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupPlan {
    /// Also delete the current generation (resource removed from the
    /// template, or replaced delete-before-create). Superseded generations
    /// are always deleted.
    pub delete_current: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodePlan {
    Update(UpdatePlan),
    Cleanup(CleanupPlan),
}

/// Internal node structure: stores the plan plus immediate edges.
#[derive(Debug, Clone, PartialEq)]
struct GraphNode {
    plan: NodePlan,
    /// Nodes that must complete before this one.
    deps: BTreeSet<NodeKey>,
    /// Nodes waiting for this one.
    dependents: BTreeSet<NodeKey>,
}

/// Dependency graph of one traversal. Edges mean "must complete before".
///
/// Ordered maps keep iteration (and therefore scheduling order, diffs and
/// error messages) deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvergenceGraph {
    nodes: BTreeMap<NodeKey, GraphNode>,
}

impl ConvergenceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&mut self, key: NodeKey, plan: NodePlan) {
        self.nodes.insert(
            key,
            GraphNode {
                plan,
                deps: BTreeSet::new(),
                dependents: BTreeSet::new(),
            },
        );
    }

    /// Record that `before` must complete before `after` may start.
    pub fn add_edge(&mut self, before: &NodeKey, after: &NodeKey) -> Result<()> {
        if !self.nodes.contains_key(before) || !self.nodes.contains_key(after) {
            return Err(ConvergeError::InvalidState(format!(
                "edge {before} -> {after} references a node not in the graph"
            )));
        }
        if let Some(node) = self.nodes.get_mut(after) {
            node.deps.insert(before.clone());
        }
        if let Some(node) = self.nodes.get_mut(before) {
            node.dependents.insert(after.clone());
        }
        Ok(())
    }

    pub fn contains(&self, key: &NodeKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All node keys in deterministic order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeKey> {
        self.nodes.keys()
    }

    pub fn plan(&self, key: &NodeKey) -> Option<&NodePlan> {
        self.nodes.get(key).map(|n| &n.plan)
    }

    pub fn update_plan(&self, key: &NodeKey) -> Option<&UpdatePlan> {
        match self.plan(key) {
            Some(NodePlan::Update(plan)) => Some(plan),
            _ => None,
        }
    }

    /// Immediate predecessors of a node.
    pub fn dependencies_of(&self, key: &NodeKey) -> impl Iterator<Item = &NodeKey> {
        self.nodes.get(key).into_iter().flat_map(|n| n.deps.iter())
    }

    /// Immediate successors of a node.
    pub fn dependents_of(&self, key: &NodeKey) -> impl Iterator<Item = &NodeKey> {
        self.nodes
            .get(key)
            .into_iter()
            .flat_map(|n| n.dependents.iter())
    }

    /// Number of predecessors a node waits for in this traversal.
    pub fn in_degree(&self, key: &NodeKey) -> usize {
        self.nodes.get(key).map(|n| n.deps.len()).unwrap_or(0)
    }

    /// Nodes with no predecessors; they start the traversal.
    pub fn roots(&self) -> Vec<NodeKey> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.deps.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Every node reachable from `key` through dependents (excluding `key`).
    pub fn transitive_dependents(&self, key: &NodeKey) -> BTreeSet<NodeKey> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&NodeKey> = self.dependents_of(key).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents_of(next));
            }
        }
        seen
    }

    /// Nodes in an order where every node follows its predecessors.
    ///
    /// Fails with [`ValidationError::Cycle`] naming every resource that takes
    /// part in a cycle.
    pub fn topological_order(&self) -> std::result::Result<Vec<NodeKey>, ValidationError> {
        let mut graph: DiGraph<&NodeKey, ()> = DiGraph::new();
        let mut index: HashMap<&NodeKey, NodeIndex> = HashMap::new();

        for key in self.nodes.keys() {
            index.insert(key, graph.add_node(key));
        }
        for (key, node) in self.nodes.iter() {
            for dep in node.deps.iter() {
                graph.add_edge(index[dep], index[key], ());
            }
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|ix| graph[ix].clone()).collect()),
            Err(_) => {
                let mut resources = BTreeSet::new();
                for component in tarjan_scc(&graph) {
                    let self_loop = component.len() == 1
                        && graph.contains_edge(component[0], component[0]);
                    if component.len() > 1 || self_loop {
                        resources.extend(component.iter().map(|ix| graph[*ix].resource.clone()));
                    }
                }
                Err(ValidationError::Cycle {
                    resources: resources.into_iter().collect(),
                })
            }
        }
    }

    pub fn check_acyclic(&self) -> std::result::Result<(), ValidationError> {
        self.topological_order().map(|_| ())
    }
}
