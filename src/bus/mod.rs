// src/bus/mod.rs

//! Message-passing collaborator between engine components.
//!
//! Delivery is at-least-once: handlers must tolerate duplicates, which they do
//! by keying on traversal, node and attempt.

pub mod local;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dag::{InputData, NodeKey};
use crate::errors::Result;
use crate::store::ResourceId;
use crate::traversal::NodeOutcome;
use crate::types::{StackId, TraversalId};

pub use local::LocalBus;

/// Work item for the worker dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRequest {
    pub stack_id: StackId,
    pub traversal: TraversalId,
    pub node: NodeKey,
    /// Data of the node's update predecessors.
    pub input: InputData,
    /// Counts from 1; bumped on every transient retry and redispatch.
    pub attempt: u32,
    /// Checks made so far of the operation in flight.
    pub poll: u32,
    /// When the node was first dispatched; used for the node timeout.
    pub started_at: DateTime<Utc>,
    /// Row whose operation is being polled (resumes only).
    #[serde(default)]
    pub resource_id: Option<ResourceId>,
}

impl NodeRequest {
    pub fn new(
        stack_id: impl Into<StackId>,
        traversal: TraversalId,
        node: NodeKey,
        input: InputData,
    ) -> Self {
        Self {
            stack_id: stack_id.into(),
            traversal,
            node,
            input,
            attempt: 1,
            poll: 0,
            started_at: Utc::now(),
            resource_id: None,
        }
    }

    /// Same node, next attempt, polling state reset.
    pub fn retry(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            poll: 0,
            resource_id: None,
            ..self.clone()
        }
    }

    /// Next check of the operation running on `row`.
    pub fn next_poll(&self, row: ResourceId) -> Self {
        Self {
            poll: self.poll + 1,
            resource_id: Some(row),
            ..self.clone()
        }
    }
}

/// A worker's completion report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeReport {
    pub stack_id: StackId,
    pub traversal: TraversalId,
    pub node: NodeKey,
    pub attempt: u32,
    pub outcome: NodeOutcome,
}

impl NodeReport {
    pub fn for_request(request: &NodeRequest, outcome: NodeOutcome) -> Self {
        Self {
            stack_id: request.stack_id.clone(),
            traversal: request.traversal,
            node: request.node.clone(),
            attempt: request.attempt,
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineMessage {
    /// Run a node (first dispatch, retry, or redispatch after recovery).
    CheckResource(NodeRequest),
    /// Poll an asynchronous operation started by an earlier `CheckResource`.
    ResumeCheck(NodeRequest),
    NodeCompleted(NodeReport),
    Shutdown,
}

/// Transport for [`EngineMessage`]s.
pub trait MessageBus: Send + Sync {
    fn send(
        &self,
        message: EngineMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Deliver `message` after `delay` without blocking the caller.
///
/// This is how suspended operations are re-entered: the worker returns and a
/// timer task puts the follow-up message back on the bus.
pub fn send_after(bus: Arc<dyn MessageBus>, delay: Duration, message: EngineMessage) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(err) = bus.send(message).await {
            warn!(error = %err, "failed to deliver delayed message");
        }
    });
}
