// src/store/records.rs

//! Persisted record types.
//!
//! Every mutable record carries a `version`. Conditional writes compare it
//! against the stored value and bump it on success.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{ConvergenceGraph, InputData, NodeKey, ResourceData};
use crate::template::TemplateSnapshot;
use crate::traversal::NodeState;
use crate::types::{
    CancelMode, ResourceAction, ResourceStatus, StackAction, StackId, StackStatus, TraversalId,
};

/// Store-assigned resource row id.
pub type ResourceId = u64;

/// A user's request to stop the current traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub traversal: TraversalId,
    pub mode: CancelMode,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackRecord {
    pub id: StackId,
    /// Owning project or user.
    pub owner: String,
    pub action: StackAction,
    pub status: StackStatus,
    pub status_reason: String,
    pub current_traversal: Option<TraversalId>,
    /// Desired state of the current action.
    pub template: TemplateSnapshot,
    pub parameters: BTreeMap<String, Value>,
    /// Template of the last action that completed successfully.
    pub known_good: Option<TemplateSnapshot>,
    pub rollback_on_failure: bool,
    pub cancel: Option<CancelRequest>,
    /// Whole-stack deadline of the current traversal.
    pub deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when a DELETE completed; the row is kept as a tombstone.
    pub deleted_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl StackRecord {
    pub fn new(id: impl Into<StackId>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            owner: owner.into(),
            action: StackAction::Create,
            status: StackStatus::Queued,
            status_reason: String::new(),
            current_traversal: None,
            template: TemplateSnapshot::default(),
            parameters: BTreeMap::new(),
            known_good: None,
            rollback_on_failure: false,
            cancel: None,
            deadline: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            version: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn is_current(&self, traversal: TraversalId) -> bool {
        self.current_traversal == Some(traversal)
    }

    /// Cancel request aimed at `traversal`, if any.
    pub fn cancel_for(&self, traversal: TraversalId) -> Option<&CancelRequest> {
        self.cancel.as_ref().filter(|c| c.traversal == traversal)
    }
}

/// Row-level claim held by the worker currently operating on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowLock {
    pub engine_id: String,
    pub traversal: TraversalId,
    pub attempt: u32,
    pub acquired_at: DateTime<Utc>,
}

/// One physical generation of a logical resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub id: ResourceId,
    pub stack_id: StackId,
    pub name: String,
    /// Increases with every replacement of the same logical name.
    pub generation: u32,
    pub resource_type: String,
    pub action: ResourceAction,
    pub status: ResourceStatus,
    pub status_reason: String,
    pub physical_id: Option<String>,
    /// Properties as written in the template (references unresolved).
    pub template_properties: Value,
    /// Properties the physical resource was last converged to.
    pub properties: Value,
    pub attributes: Value,
    /// Input digest of the last successful create/update.
    pub template_digest: Option<String>,
    pub requires: BTreeSet<String>,
    /// False once superseded by a replacement.
    pub current: bool,
    pub replaces: Option<ResourceId>,
    pub replaced_by: Option<ResourceId>,
    /// Token of an asynchronous operation still being polled.
    pub continuation: Option<String>,
    pub lock: Option<RowLock>,
    /// Traversal that last touched the row.
    pub traversal: Option<TraversalId>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl ResourceRecord {
    /// Fresh INIT row; the store assigns `id` on insert.
    pub fn new(
        stack_id: impl Into<StackId>,
        name: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            stack_id: stack_id.into(),
            name: name.into(),
            generation: 0,
            resource_type: resource_type.into(),
            action: ResourceAction::Init,
            status: ResourceStatus::Complete,
            status_reason: String::new(),
            physical_id: None,
            template_properties: Value::Null,
            properties: Value::Null,
            attributes: Value::Null,
            template_digest: None,
            requires: BTreeSet::new(),
            current: true,
            replaces: None,
            replaced_by: None,
            continuation: None,
            lock: None,
            traversal: None,
            updated_at: Utc::now(),
            version: 0,
        }
    }

    /// Deleted physically; only kept until the traversal purges it.
    pub fn is_deleted(&self) -> bool {
        self.action == ResourceAction::Delete && self.status == ResourceStatus::Complete
    }

    /// The generation that represents the logical resource right now.
    pub fn is_live(&self) -> bool {
        self.current && !self.is_deleted()
    }

    /// Last create/update finished and the row matches its digest.
    pub fn is_converged(&self) -> bool {
        self.status == ResourceStatus::Complete
            && matches!(self.action, ResourceAction::Create | ResourceAction::Update)
            && self.template_digest.is_some()
    }

    /// A create or update that failed or was cancelled mid-flight. The
    /// physical resource, if any, is in an unknown state.
    pub fn is_incomplete(&self) -> bool {
        matches!(self.status, ResourceStatus::Failed | ResourceStatus::Cancelled)
            && matches!(self.action, ResourceAction::Create | ResourceAction::Update)
    }

    pub fn data(&self) -> ResourceData {
        ResourceData {
            physical_id: self.physical_id.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

/// The graph of one traversal plus the state of each node.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphRecord {
    pub stack_id: StackId,
    pub traversal: TraversalId,
    pub graph: ConvergenceGraph,
    pub states: BTreeMap<NodeKey, NodeState>,
    /// Set by the single writer that observed the traversal quiesce.
    pub finalized: bool,
    pub version: u64,
}

impl GraphRecord {
    /// New record with every node `Pending`.
    pub fn new(
        stack_id: impl Into<StackId>,
        traversal: TraversalId,
        graph: ConvergenceGraph,
    ) -> Self {
        let states = graph
            .nodes()
            .map(|key| (key.clone(), NodeState::Pending))
            .collect();
        Self {
            stack_id: stack_id.into(),
            traversal,
            graph,
            states,
            finalized: false,
            version: 0,
        }
    }

    pub fn state(&self, key: &NodeKey) -> Option<&NodeState> {
        self.states.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncPointKey {
    pub stack_id: StackId,
    pub traversal: TraversalId,
    pub node: NodeKey,
}

/// Fan-in record for one node of one traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPointRecord {
    pub key: SyncPointKey,
    /// Predecessors that reported success so far.
    pub satisfied: BTreeSet<NodeKey>,
    /// Data of the satisfied update predecessors, by resource name.
    pub input: InputData,
    /// Set by the write that satisfied the last predecessor.
    pub triggered: bool,
    pub version: u64,
}

impl SyncPointRecord {
    pub fn new(key: SyncPointKey) -> Self {
        Self {
            key,
            satisfied: BTreeSet::new(),
            input: InputData::new(),
            triggered: false,
            version: 0,
        }
    }
}

/// Stack ownership lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub stack_id: StackId,
    pub engine_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u64,
}

/// User-visible history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: u64,
    pub stack_id: StackId,
    /// Resource name, or the stack id for stack-level events.
    pub resource_name: String,
    pub physical_id: Option<String>,
    pub action: String,
    pub status: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(
        stack_id: impl Into<StackId>,
        resource_name: impl Into<String>,
        action: impl ToString,
        status: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            stack_id: stack_id.into(),
            resource_name: resource_name.into(),
            physical_id: None,
            action: action.to_string(),
            status: status.to_string(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_physical_id(mut self, physical_id: Option<String>) -> Self {
        self.physical_id = physical_id;
        self
    }
}
