// src/plugin/mod.rs

//! Resource-type capability interface.
//!
//! Each resource type is a [`ResourcePlugin`] registered by name in a
//! [`PluginRegistry`]. The engine never inspects resource properties itself;
//! it only calls the operations below and persists what they return.
//!
//! Long-running provisioning is expressed as explicit resumable state: an
//! operation that cannot finish immediately returns
//! [`OpOutcome::InProgress`] with an opaque token, and the engine calls the
//! matching `check_*` operation with that token later.

pub mod base;
pub mod builtin;
pub mod registry;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::RetryPolicy;
use crate::dag::ResourceData;
use crate::errors::ConvergeError;
use crate::types::{ReplacementPolicy, StackId, TraversalId};

pub use base::{decode_token, encode_token, run_operation, Operation};
pub use builtin::{NoneResource, TestResource};
pub use registry::{PluginRegistry, TypePolicy};

/// Call context handed to every plugin operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub stack_id: StackId,
    pub resource_name: String,
    pub traversal: TraversalId,
    /// Attempt number of the node, counting from 1.
    pub attempt: u32,
    /// Number of `check_*` calls made so far for this operation.
    pub poll: u32,
}

/// Result of starting or checking an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutcome {
    Done(ResourceData),
    InProgress {
        /// Physical id, when the external system assigned one already.
        physical_id: Option<String>,
        token: String,
    },
}

impl OpOutcome {
    pub fn done(physical_id: impl Into<String>, attributes: Value) -> Self {
        OpOutcome::Done(ResourceData {
            physical_id: Some(physical_id.into()),
            attributes,
        })
    }
}

/// Error classification of a plugin operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// Worth retrying (rate limiting, temporary unavailability).
    #[error("{0}")]
    Transient(String),

    /// Retrying will not help (quota, invalid property).
    #[error("{0}")]
    Permanent(String),
}

impl PluginError {
    pub fn is_transient(&self) -> bool {
        matches!(self, PluginError::Transient(_))
    }
}

impl From<PluginError> for ConvergeError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Transient(msg) => ConvergeError::TransientResource(msg),
            PluginError::Permanent(msg) => ConvergeError::PermanentResource(msg),
        }
    }
}

pub type OpResult = std::result::Result<OpOutcome, PluginError>;

/// Operations of one resource type.
///
/// `check_*` default to a permanent error: a plugin that never returns
/// [`OpOutcome::InProgress`] does not need them.
#[async_trait]
pub trait ResourcePlugin: Send + Sync {
    /// Registered type name, e.g. `"Convergent::Test"`.
    fn type_name(&self) -> &str;

    /// Ordering used when this type has to be replaced.
    fn replacement_policy(&self) -> ReplacementPolicy {
        ReplacementPolicy::default()
    }

    /// Type-specific retry policy for transient errors.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Whether moving from `old` to `new` properties needs a new physical
    /// resource instead of an in-place update.
    fn needs_replacement(&self, _old: &Value, _new: &Value) -> bool {
        false
    }

    async fn create(&self, ctx: &OperationContext, properties: &Value) -> OpResult;

    async fn check_create(&self, _ctx: &OperationContext, _token: &str) -> OpResult {
        Err(unsupported(self.type_name(), "create"))
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        physical_id: &str,
        old: &Value,
        new: &Value,
    ) -> OpResult;

    async fn check_update(
        &self,
        _ctx: &OperationContext,
        _physical_id: &str,
        _token: &str,
    ) -> OpResult {
        Err(unsupported(self.type_name(), "update"))
    }

    /// `properties` are the last properties the resource converged to.
    async fn delete(&self, ctx: &OperationContext, physical_id: &str, properties: &Value)
    -> OpResult;

    async fn check_delete(
        &self,
        _ctx: &OperationContext,
        _physical_id: &str,
        _token: &str,
    ) -> OpResult {
        Err(unsupported(self.type_name(), "delete"))
    }
}

fn unsupported(type_name: &str, op: &str) -> PluginError {
    PluginError::Permanent(format!(
        "resource type '{type_name}' does not support asynchronous {op}"
    ))
}
