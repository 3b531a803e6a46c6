// src/traversal/state.rs

//! Per-traversal node state transitions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dag::{ConvergenceGraph, NodeKey, ResourceData};
use crate::store::GraphRecord;

/// Lifecycle of one node within one traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum NodeState {
    /// Waiting for predecessors.
    Pending,
    /// Dispatched to a worker.
    Running,
    Complete,
    Failed(String),
    /// Will never run: a predecessor failed.
    Blocked,
    /// Stopped by a user cancel.
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeState::Pending | NodeState::Running)
    }
}

/// What a worker reports for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeOutcome {
    Success(ResourceData),
    Failed(String),
    Cancelled,
}

/// Aggregate result of a quiesced traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraversalOutcome {
    Succeeded,
    /// Failed nodes with their reasons, in node order.
    Failed(Vec<(NodeKey, String)>),
    Cancelled,
}

/// Effects of applying one report to a traversal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transition {
    /// Successors moved `Pending -> Running` by this write; the writer
    /// dispatches exactly these.
    pub dispatch: Vec<NodeKey>,
    /// Nodes newly marked `Blocked` or `Cancelled` because of this report.
    pub skipped: Vec<NodeKey>,
    /// This write made the traversal quiesce; the writer finalizes it.
    pub quiesced: bool,
}

/// Mutating view over the states of one traversal.
pub struct TraversalStates<'a> {
    graph: &'a ConvergenceGraph,
    states: &'a mut BTreeMap<NodeKey, NodeState>,
}

impl<'a> TraversalStates<'a> {
    pub fn new(
        graph: &'a ConvergenceGraph,
        states: &'a mut BTreeMap<NodeKey, NodeState>,
    ) -> Self {
        Self { graph, states }
    }

    /// `Pending -> Running`. False if the node was already past `Pending`.
    pub fn mark_running(&mut self, key: &NodeKey) -> bool {
        match self.states.get_mut(key) {
            Some(state @ NodeState::Pending) => {
                *state = NodeState::Running;
                true
            }
            _ => false,
        }
    }

    /// Apply a worker's report for `node`.
    ///
    /// `ready` are the successors whose sync point is satisfied. A duplicate
    /// report leaves the node's own state alone but still moves any ready
    /// successor the first delivery did not get to.
    pub fn apply(
        &mut self,
        node: &NodeKey,
        outcome: &NodeOutcome,
        ready: &[NodeKey],
    ) -> Transition {
        let mut transition = Transition::default();
        let first_report = matches!(
            self.states.get(node),
            Some(NodeState::Pending) | Some(NodeState::Running)
        );

        match outcome {
            NodeOutcome::Success(_) => {
                if first_report {
                    self.states.insert(node.clone(), NodeState::Complete);
                }
                if matches!(self.states.get(node), Some(NodeState::Complete)) {
                    for succ in ready {
                        if self.mark_running(succ) {
                            transition.dispatch.push(succ.clone());
                        }
                    }
                }
            }
            NodeOutcome::Failed(reason) if first_report => {
                self.states
                    .insert(node.clone(), NodeState::Failed(reason.clone()));
                transition.skipped = self.mark_dependents(node, NodeState::Blocked);
            }
            NodeOutcome::Cancelled if first_report => {
                self.states.insert(node.clone(), NodeState::Cancelled);
                transition.skipped = self.mark_dependents(node, NodeState::Cancelled);
            }
            _ => {}
        }

        debug!(
            node = %node,
            dispatch = transition.dispatch.len(),
            skipped = transition.skipped.len(),
            "applied node report"
        );
        transition
    }

    /// Mark every `Pending` transitive dependent of `node` with `state`.
    fn mark_dependents(&mut self, node: &NodeKey, state: NodeState) -> Vec<NodeKey> {
        let mut marked = Vec::new();
        for dependent in self.graph.transitive_dependents(node) {
            if let Some(current) = self.states.get_mut(&dependent) {
                if matches!(current, NodeState::Pending) {
                    *current = state.clone();
                    marked.push(dependent);
                }
            }
        }
        marked
    }

    /// Cancel every node that has not started yet.
    pub fn cancel_pending(&mut self) -> Vec<NodeKey> {
        let mut cancelled = Vec::new();
        for (key, state) in self.states.iter_mut() {
            if matches!(state, NodeState::Pending) {
                *state = NodeState::Cancelled;
                cancelled.push(key.clone());
            }
        }
        cancelled
    }

    /// No node is pending or running.
    pub fn is_quiescent(&self) -> bool {
        self.states.values().all(NodeState::is_terminal)
    }
}

/// Aggregate the states of a quiesced traversal.
///
/// Failures win over cancellation so a failed node is always reported.
pub fn summarize(states: &BTreeMap<NodeKey, NodeState>) -> TraversalOutcome {
    let failed: Vec<(NodeKey, String)> = states
        .iter()
        .filter_map(|(key, state)| match state {
            NodeState::Failed(reason) => Some((key.clone(), reason.clone())),
            _ => None,
        })
        .collect();
    if !failed.is_empty() {
        return TraversalOutcome::Failed(failed);
    }
    if states
        .values()
        .any(|s| matches!(s, NodeState::Cancelled | NodeState::Blocked))
    {
        return TraversalOutcome::Cancelled;
    }
    TraversalOutcome::Succeeded
}

/// Apply a report to a graph record, claiming finalization if this write
/// makes the traversal quiesce.
pub fn apply_report(
    record: &mut GraphRecord,
    node: &NodeKey,
    outcome: &NodeOutcome,
    ready: &[NodeKey],
) -> Transition {
    let mut states = TraversalStates::new(&record.graph, &mut record.states);
    let mut transition = states.apply(node, outcome, ready);
    let quiescent = states.is_quiescent();
    if quiescent && !record.finalized {
        record.finalized = true;
        transition.quiesced = true;
    }
    transition
}

/// Cancel the not-yet-started nodes of a graph record.
pub fn cancel_record(record: &mut GraphRecord) -> Transition {
    let mut states = TraversalStates::new(&record.graph, &mut record.states);
    let skipped = states.cancel_pending();
    let quiescent = states.is_quiescent();
    let quiesced = quiescent && !record.finalized;
    if quiesced {
        record.finalized = true;
    }
    Transition {
        dispatch: Vec::new(),
        skipped,
        quiesced,
    }
}
