// src/plugin/base.rs

//! Shared operation executor any resource plugin can rely on.
//!
//! The engine funnels every plugin call through [`run_operation`], which
//! bounds it by the node's remaining time and logs it under one span. Plugins
//! with asynchronous operations can use [`encode_token`] / [`decode_token`] to
//! keep their continuation state in the opaque token the engine persists.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info_span, Instrument};

use crate::errors::ConvergeError;
use crate::plugin::{OpOutcome, OpResult, OperationContext, PluginError, ResourcePlugin};

/// One plugin call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operation<'a> {
    Create {
        properties: &'a Value,
    },
    CheckCreate {
        token: &'a str,
    },
    Update {
        physical_id: &'a str,
        old: &'a Value,
        new: &'a Value,
    },
    CheckUpdate {
        physical_id: &'a str,
        token: &'a str,
    },
    Delete {
        physical_id: &'a str,
        properties: &'a Value,
    },
    CheckDelete {
        physical_id: &'a str,
        token: &'a str,
    },
}

impl Operation<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::CheckCreate { .. } => "check_create",
            Operation::Update { .. } => "update",
            Operation::CheckUpdate { .. } => "check_update",
            Operation::Delete { .. } => "delete",
            Operation::CheckDelete { .. } => "check_delete",
        }
    }
}

/// Run `op` against `plugin`, failing permanently if it takes longer than
/// `limit`.
pub async fn run_operation(
    plugin: &dyn ResourcePlugin,
    ctx: &OperationContext,
    op: Operation<'_>,
    limit: Duration,
) -> OpResult {
    let span = info_span!(
        "resource_op",
        stack = %ctx.stack_id,
        resource = %ctx.resource_name,
        resource_type = plugin.type_name(),
        op = op.name(),
        attempt = ctx.attempt,
        poll = ctx.poll,
    );

    let call = async {
        match op {
            Operation::Create { properties } => plugin.create(ctx, properties).await,
            Operation::CheckCreate { token } => plugin.check_create(ctx, token).await,
            Operation::Update {
                physical_id,
                old,
                new,
            } => plugin.update(ctx, physical_id, old, new).await,
            Operation::CheckUpdate { physical_id, token } => {
                plugin.check_update(ctx, physical_id, token).await
            }
            Operation::Delete {
                physical_id,
                properties,
            } => plugin.delete(ctx, physical_id, properties).await,
            Operation::CheckDelete { physical_id, token } => {
                plugin.check_delete(ctx, physical_id, token).await
            }
        }
    };

    async move {
        let result = match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(PluginError::Permanent(
                ConvergeError::Timeout {
                    what: op.name().to_string(),
                    elapsed: limit,
                }
                .to_string(),
            )),
        };
        match &result {
            Ok(OpOutcome::Done(_)) => debug!("operation done"),
            Ok(OpOutcome::InProgress { .. }) => debug!("operation in progress"),
            Err(err) => debug!(error = %err, transient = err.is_transient(), "operation failed"),
        }
        result
    }
    .instrument(span)
    .await
}

/// Serialize plugin continuation state into an opaque token.
pub fn encode_token<T: Serialize>(state: &T) -> Result<String, PluginError> {
    serde_json::to_string(state)
        .map_err(|e| PluginError::Permanent(format!("failed to encode continuation token: {e}")))
}

/// Inverse of [`encode_token`].
pub fn decode_token<T: DeserializeOwned>(token: &str) -> Result<T, PluginError> {
    serde_json::from_str(token)
        .map_err(|e| PluginError::Permanent(format!("malformed continuation token: {e}")))
}
