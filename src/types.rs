// src/types.rs

//! Shared lifecycle enums used by the store, the engine and the status surface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Canonical stack identifier type. Chosen by the caller on create.
pub type StackId = String;

/// Lifecycle action currently being applied to a stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StackAction {
    Create,
    Update,
    Delete,
    Rollback,
}

impl fmt::Display for StackAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackAction::Create => "CREATE",
            StackAction::Update => "UPDATE",
            StackAction::Delete => "DELETE",
            StackAction::Rollback => "ROLLBACK",
        };
        f.write_str(s)
    }
}

/// Aggregate status of a stack's current action.
///
/// `Queued` covers the short window between accepting an action and starting
/// its traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackStatus {
    Queued,
    InProgress,
    Complete,
    Failed,
}

impl StackStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StackStatus::Complete | StackStatus::Failed)
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StackStatus::Queued => "QUEUED",
            StackStatus::InProgress => "IN_PROGRESS",
            StackStatus::Complete => "COMPLETE",
            StackStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Last lifecycle operation applied to a resource row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResourceAction {
    Init,
    Create,
    Update,
    Delete,
}

impl fmt::Display for ResourceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceAction::Init => "INIT",
            ResourceAction::Create => "CREATE",
            ResourceAction::Update => "UPDATE",
            ResourceAction::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Status of the last lifecycle operation on a resource row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceStatus {
    InProgress,
    Complete,
    Failed,
    /// Operation was stopped by a user cancel; the physical resource was left
    /// in whatever state it had reached.
    Cancelled,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::InProgress => "IN_PROGRESS",
            ResourceStatus::Complete => "COMPLETE",
            ResourceStatus::Failed => "FAILED",
            ResourceStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// How a user-initiated cancel should leave the stack.
///
/// - `NoRollback`: stop in-flight work where it is and mark the stack failed.
/// - `Rollback`: stop, then converge back to the last known-good template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelMode {
    NoRollback,
    Rollback,
}

impl Default for CancelMode {
    fn default() -> Self {
        CancelMode::NoRollback
    }
}

impl FromStr for CancelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "no_rollback" => Ok(CancelMode::NoRollback),
            "rollback" => Ok(CancelMode::Rollback),
            other => Err(format!(
                "invalid cancel mode: {other} (expected \"no_rollback\" or \"rollback\")"
            )),
        }
    }
}

/// Ordering between creating a replacement and deleting the old physical
/// resource when a property change cannot be applied in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacementPolicy {
    /// New physical resource is created first; the old one is deleted only
    /// after the replacement (and its dependents) converged.
    CreateBeforeDelete,
    /// Old physical resource is deleted before the replacement is created.
    DeleteBeforeCreate,
}

impl Default for ReplacementPolicy {
    fn default() -> Self {
        ReplacementPolicy::CreateBeforeDelete
    }
}

impl FromStr for ReplacementPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "create_before_delete" => Ok(ReplacementPolicy::CreateBeforeDelete),
            "delete_before_create" => Ok(ReplacementPolicy::DeleteBeforeCreate),
            other => Err(format!(
                "invalid replacement policy: {other} (expected \"create_before_delete\" or \"delete_before_create\")"
            )),
        }
    }
}

/// Opaque token identifying one convergence run of a stack.
///
/// A stack's `current_traversal` is replaced on every create/update/delete;
/// work tagged with any other id is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraversalId(uuid::Uuid);

impl TraversalId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TraversalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraversalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
