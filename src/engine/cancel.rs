// src/engine/cancel.rs

//! User-initiated cancellation of a stack's current traversal.
//!
//! Cancelling records a [`CancelRequest`] on the stack and marks every node
//! that has not started as cancelled. Running nodes notice the request the
//! next time a worker touches them (a fresh dispatch or a resume check) and
//! report `Cancelled`; the traversal is finalized once nothing runs.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::engine::orchestrator::Orchestrator;
use crate::engine::EngineContext;
use crate::errors::{ConvergeError, Result};
use crate::store::{require_stack, CancelRequest, EventRecord};
use crate::traversal::cancel_record;
use crate::types::{CancelMode, StackStatus};

pub struct CancellationController {
    ctx: Arc<EngineContext>,
}

impl CancellationController {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    pub async fn cancel(&self, stack_id: &str, mode: CancelMode) -> Result<()> {
        let stack = require_stack(self.ctx.store.as_ref(), stack_id).await?;
        let traversal = match (stack.status, stack.current_traversal) {
            (StackStatus::InProgress, Some(traversal)) => traversal,
            (status, _) => {
                return Err(ConvergeError::InvalidState(format!(
                    "stack '{stack_id}' is {status}; only an in-progress stack can be cancelled"
                )));
            }
        };

        let orchestrator = Orchestrator::new(self.ctx.clone());
        let recorded = orchestrator
            .modify_stack(stack_id, |s| {
                if !s.is_current(traversal) || s.status != StackStatus::InProgress {
                    return false;
                }
                s.cancel = Some(CancelRequest {
                    traversal,
                    mode,
                    requested_at: Utc::now(),
                });
                s.status_reason = format!("Stack {} cancel requested", s.action);
                true
            })
            .await?;
        let Some(stack) = recorded else {
            return Err(ConvergeError::InvalidState(format!(
                "stack '{stack_id}' finished before the cancel was recorded"
            )));
        };

        info!(stack = %stack_id, %traversal, ?mode, "cancel requested");
        self.ctx
            .record_event(EventRecord::new(
                stack_id,
                stack_id,
                stack.action,
                stack.status,
                stack.status_reason.clone(),
            ))
            .await;

        let transition = orchestrator
            .modify_graph(stack_id, traversal, cancel_record)
            .await?;
        if transition.is_some_and(|t| t.quiesced) {
            orchestrator.finalize(stack_id, traversal).await?;
        }
        Ok(())
    }
}
