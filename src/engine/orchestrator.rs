// src/engine/orchestrator.rs

//! Convergence orchestrator: stack actions in, traversals out.
//!
//! Per stack: `QUEUED -> IN_PROGRESS -> {COMPLETE, FAILED}`. Starting an
//! action always builds a fresh graph against the desired template and the
//! persisted rows, then bumps `current_traversal`; completions reported for
//! any other traversal are dropped, which is what makes updating an
//! in-progress stack safe.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bus::{EngineMessage, NodeReport, NodeRequest};
use crate::dag::{BuiltGraph, GraphBuilder, InputData, NodeKey};
use crate::engine::lock::StackLock;
use crate::engine::{chrono_duration, EngineContext, StackNotification, StackRequest};
use crate::errors::{ConvergeError, Result};
use crate::store::{require_stack, CasResult, EventRecord, GraphRecord, StackRecord, SyncPointKey};
use crate::template::TemplateSnapshot;
use crate::traversal::{
    apply_report, complete_predecessor, summarize, NodeOutcome, NodeState, Transition,
    TraversalOutcome, TraversalStates, MAX_CAS_RETRIES,
};
use crate::types::{CancelMode, StackAction, StackStatus, TraversalId};

/// Desired end state of one traversal.
#[derive(Debug, Clone)]
struct Desired {
    snapshot: TemplateSnapshot,
    parameters: BTreeMap<String, Value>,
    owner: String,
    rollback_on_failure: bool,
    timeout: Option<Duration>,
}

impl Desired {
    fn from_request(request: StackRequest) -> Self {
        Self {
            snapshot: TemplateSnapshot {
                template: request.template,
                environment: request.environment,
            },
            parameters: request.parameters,
            owner: request.owner,
            rollback_on_failure: request.rollback_on_failure,
            timeout: request.timeout,
        }
    }

    /// Converge to `snapshot` with no parameter overrides and no further
    /// rollback.
    fn revert_to(snapshot: TemplateSnapshot, timeout: Option<Duration>) -> Self {
        Self {
            snapshot,
            parameters: Default::default(),
            owner: String::new(),
            rollback_on_failure: false,
            timeout,
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    ctx: Arc<EngineContext>,
}

impl Orchestrator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Resolve and build without persisting anything.
    pub async fn preview(&self, stack_id: &str, request: &StackRequest) -> Result<BuiltGraph> {
        let resolved = self.ctx.resolver.resolve(
            &request.template,
            &request.environment,
            &request.parameters,
        )?;
        let rows = self.ctx.store.list_resources(stack_id).await?;
        GraphBuilder::new(&self.ctx.registry).build(&resolved, &rows)
    }

    pub async fn start_stack_action(
        &self,
        stack_id: &str,
        action: StackAction,
        request: StackRequest,
    ) -> Result<TraversalId> {
        let existing = self
            .ctx
            .store
            .get_stack(stack_id)
            .await?
            .filter(|s| !s.is_deleted());

        let desired = match (action, existing) {
            (StackAction::Create, Some(_)) => {
                return Err(ConvergeError::InvalidState(format!(
                    "stack '{stack_id}' already exists"
                )));
            }
            (StackAction::Create, None) => Desired::from_request(request),
            (_, None) => return Err(ConvergeError::StackNotFound(stack_id.to_string())),
            (StackAction::Update, Some(_)) => Desired::from_request(request),
            (StackAction::Delete, Some(_)) => Desired {
                timeout: request.timeout,
                ..Desired::revert_to(TemplateSnapshot::default(), None)
            },
            (StackAction::Rollback, Some(stack)) => Desired::revert_to(
                stack.known_good.clone().unwrap_or_default(),
                request.timeout,
            ),
        };

        self.begin(stack_id, action, desired).await
    }

    /// Validate, take the lock, persist the graph, bump the traversal and
    /// dispatch the roots.
    async fn begin(
        &self,
        stack_id: &str,
        action: StackAction,
        desired: Desired,
    ) -> Result<TraversalId> {
        let store = self.ctx.store.as_ref();

        let resolved = self.ctx.resolver.resolve(
            &desired.snapshot.template,
            &desired.snapshot.environment,
            &desired.parameters,
        )?;
        let rows = store.list_resources(stack_id).await?;
        let built = GraphBuilder::new(&self.ctx.registry).build(&resolved, &rows)?;

        StackLock::for_context(&self.ctx).acquire(stack_id).await?;

        let stack = self.queue_stack(stack_id, action, &desired).await?;
        let previous = stack.current_traversal;

        let traversal = TraversalId::new();
        let mut record = GraphRecord::new(stack_id, traversal, built.graph);
        let roots = record.graph.roots();
        {
            let mut states = TraversalStates::new(&record.graph, &mut record.states);
            for root in roots.iter() {
                states.mark_running(root);
            }
        }
        let empty = record.graph.is_empty();
        record.finalized = empty;
        store.put_graph(&record).await?;

        let timeout = desired.timeout.or(self.ctx.config.stack_timeout);
        let started = self
            .modify_stack(stack_id, |s| {
                s.current_traversal = Some(traversal);
                s.status = StackStatus::InProgress;
                s.status_reason = format!("Stack {action} started");
                s.cancel = None;
                s.deadline = timeout.map(|t| Utc::now() + chrono_duration(t));
                true
            })
            .await?
            .ok_or_else(|| ConvergeError::StackNotFound(stack_id.to_string()))?;

        if let Some(previous) = previous {
            store.purge_sync_points(stack_id, previous).await?;
            debug!(stack = %stack_id, %previous, "superseded previous traversal");
        }

        info!(
            stack = %stack_id,
            %action,
            %traversal,
            nodes = record.graph.len(),
            added = built.diff.added.len(),
            changed = built.diff.changed.len(),
            replaced = built.diff.replaced.len(),
            unchanged = built.diff.unchanged.len(),
            cleanup = built.diff.cleanup.len(),
            "traversal started"
        );
        self.announce(&started).await;

        if empty {
            self.complete(&started, traversal).await?;
            return Ok(traversal);
        }

        for root in roots {
            let request = NodeRequest::new(stack_id, traversal, root, InputData::new());
            self.ctx.send(EngineMessage::CheckResource(request)).await?;
        }
        Ok(traversal)
    }

    /// Record the action and its desired state with status `QUEUED`,
    /// creating (or reviving) the stack row as needed.
    async fn queue_stack(
        &self,
        stack_id: &str,
        action: StackAction,
        desired: &Desired,
    ) -> Result<StackRecord> {
        let store = self.ctx.store.as_ref();
        let apply = |s: &mut StackRecord| {
            s.action = action;
            s.status = StackStatus::Queued;
            s.status_reason = String::new();
            s.template = desired.snapshot.clone();
            s.parameters = desired.parameters.clone();
            s.rollback_on_failure = desired.rollback_on_failure;
            if !desired.owner.is_empty() {
                s.owner = desired.owner.clone();
            }
        };

        for _ in 0..MAX_CAS_RETRIES {
            match store.get_stack(stack_id).await? {
                None => {
                    let mut stack = StackRecord::new(stack_id, desired.owner.clone());
                    apply(&mut stack);
                    if store.create_stack(&stack).await?.is_success() {
                        return Ok(stack);
                    }
                }
                Some(mut stack) => {
                    if stack.is_deleted() {
                        stack.deleted_at = None;
                        stack.known_good = None;
                        stack.created_at = Utc::now();
                    }
                    apply(&mut stack);
                    if store.cas_stack(&stack).await?.is_success() {
                        stack.version += 1;
                        return Ok(stack);
                    }
                }
            }
        }
        Err(ConvergeError::ConcurrencyConflict(format!("stack '{stack_id}'")))
    }

    /// Re-read / modify / conditionally write a stack until it sticks.
    /// `f` returning false abandons the write (`Ok(None)`).
    pub(crate) async fn modify_stack<F>(
        &self,
        stack_id: &str,
        mut f: F,
    ) -> Result<Option<StackRecord>>
    where
        F: FnMut(&mut StackRecord) -> bool + Send,
    {
        let store = self.ctx.store.as_ref();
        for _ in 0..MAX_CAS_RETRIES {
            let mut stack = require_stack(store, stack_id).await?;
            if !f(&mut stack) {
                return Ok(None);
            }
            match store.cas_stack(&stack).await? {
                CasResult::Success => {
                    stack.version += 1;
                    return Ok(Some(stack));
                }
                CasResult::NotFound => {
                    return Err(ConvergeError::StackNotFound(stack_id.to_string()));
                }
                _ => continue,
            }
        }
        Err(ConvergeError::ConcurrencyConflict(format!("stack '{stack_id}'")))
    }

    /// Same loop for a traversal's graph record. `Ok(None)` if it is gone.
    pub(crate) async fn modify_graph<F>(
        &self,
        stack_id: &str,
        traversal: TraversalId,
        mut f: F,
    ) -> Result<Option<Transition>>
    where
        F: FnMut(&mut GraphRecord) -> Transition + Send,
    {
        let store = self.ctx.store.as_ref();
        for _ in 0..MAX_CAS_RETRIES {
            let Some(mut record) = store.get_graph(stack_id, traversal).await? else {
                return Ok(None);
            };
            let transition = f(&mut record);
            match store.cas_graph(&record).await? {
                CasResult::Success => return Ok(Some(transition)),
                CasResult::NotFound => return Ok(None),
                _ => continue,
            }
        }
        Err(ConvergeError::ConcurrencyConflict(format!(
            "graph of traversal {traversal}"
        )))
    }

    /// Advance the traversal with a worker's report.
    pub async fn node_completed(&self, report: NodeReport) -> Result<()> {
        let store = self.ctx.store.as_ref();

        let Some(stack) = store.get_stack(&report.stack_id).await? else {
            return Ok(());
        };
        if !stack.is_current(report.traversal) {
            debug!(
                stack = %report.stack_id,
                traversal = %report.traversal,
                node = %report.node,
                "discarding completion of superseded traversal"
            );
            return Ok(());
        }
        let Some(graph) = store.get_graph(&report.stack_id, report.traversal).await? else {
            return Ok(());
        };

        // Successors first: the graph write below only moves nodes whose
        // sync point is already satisfied.
        let mut ready: Vec<(NodeKey, InputData)> = Vec::new();
        let cancelling = stack.cancel_for(report.traversal).is_some();
        if let (NodeOutcome::Success(data), false) = (&report.outcome, cancelling) {
            let data = report.node.is_update().then_some(data);
            for succ in graph.graph.dependents_of(&report.node) {
                if graph.state(succ) != Some(&NodeState::Pending) {
                    continue;
                }
                let required: BTreeSet<NodeKey> =
                    graph.graph.dependencies_of(succ).cloned().collect();
                let key = SyncPointKey {
                    stack_id: report.stack_id.clone(),
                    traversal: report.traversal,
                    node: succ.clone(),
                };
                let outcome =
                    complete_predecessor(store, &key, &report.node, data, &required).await?;
                if let Some(input) = outcome.input() {
                    ready.push((succ.clone(), input.clone()));
                }
            }
        }

        let ready_keys: Vec<NodeKey> = ready.iter().map(|(k, _)| k.clone()).collect();
        let Some(transition) = self
            .modify_graph(&report.stack_id, report.traversal, |record| {
                apply_report(record, &report.node, &report.outcome, &ready_keys)
            })
            .await?
        else {
            return Ok(());
        };

        match &report.outcome {
            NodeOutcome::Success(_) => debug!(node = %report.node, "node complete"),
            NodeOutcome::Failed(reason) => warn!(
                stack = %report.stack_id,
                node = %report.node,
                blocked = transition.skipped.len(),
                %reason,
                "node failed"
            ),
            NodeOutcome::Cancelled => info!(node = %report.node, "node cancelled"),
        }

        for (key, input) in ready {
            if transition.dispatch.contains(&key) {
                let request = NodeRequest::new(&report.stack_id, report.traversal, key, input);
                self.ctx.send(EngineMessage::CheckResource(request)).await?;
            }
        }

        if transition.quiesced {
            self.finalize(&report.stack_id, report.traversal).await?;
        }
        Ok(())
    }

    /// Settle a quiesced traversal: complete, fail, or fail and roll back.
    pub async fn finalize(&self, stack_id: &str, traversal: TraversalId) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let Some(record) = store.get_graph(stack_id, traversal).await? else {
            return Ok(());
        };
        let Some(stack) = store.get_stack(stack_id).await? else {
            return Ok(());
        };
        if !stack.is_current(traversal) {
            return Ok(());
        }

        match summarize(&record.states) {
            TraversalOutcome::Succeeded => self.complete(&stack, traversal).await,
            TraversalOutcome::Failed(failed) => {
                let detail: Vec<String> = failed
                    .iter()
                    .map(|(node, reason)| format!("{}: {reason}", node.resource))
                    .collect();
                let reason = format!("Resource {} failed: {}", stack.action, detail.join("; "));
                self.fail(&stack, traversal, reason).await
            }
            TraversalOutcome::Cancelled => {
                let reason = format!("Stack {} cancelled", stack.action);
                self.fail(&stack, traversal, reason).await
            }
        }
    }

    async fn complete(&self, stack: &StackRecord, traversal: TraversalId) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let action = stack.action;

        for row in store.list_resources(&stack.id).await? {
            if row.is_deleted() {
                store.delete_resource(row.id).await?;
            }
        }

        // Parameters are folded into the environment so a rollback needs
        // nothing but the snapshot.
        let mut known_good = stack.template.clone();
        known_good
            .environment
            .parameters
            .extend(stack.parameters.clone());

        let Some(done) = self
            .modify_stack(&stack.id, |s| {
                if !s.is_current(traversal) {
                    return false;
                }
                s.status = StackStatus::Complete;
                s.status_reason = format!("Stack {action} completed successfully");
                s.cancel = None;
                s.deadline = None;
                if action == StackAction::Delete {
                    s.deleted_at = Some(Utc::now());
                    s.known_good = None;
                } else {
                    s.known_good = Some(known_good.clone());
                }
                true
            })
            .await?
        else {
            return Ok(());
        };

        store.delete_graphs_except(&stack.id, None).await?;
        store.purge_sync_points(&stack.id, traversal).await?;
        StackLock::for_context(&self.ctx).release(&stack.id).await?;

        info!(stack = %stack.id, %action, %traversal, "stack action complete");
        self.announce(&done).await;
        Ok(())
    }

    async fn fail(
        &self,
        stack: &StackRecord,
        traversal: TraversalId,
        reason: String,
    ) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let action = stack.action;

        let wants_rollback = !matches!(action, StackAction::Rollback | StackAction::Delete)
            && match stack.cancel_for(traversal) {
                Some(cancel) => cancel.mode == CancelMode::Rollback,
                None => stack.rollback_on_failure,
            };

        let Some(failed) = self
            .modify_stack(&stack.id, |s| {
                if !s.is_current(traversal) {
                    return false;
                }
                s.status = StackStatus::Failed;
                s.status_reason = reason.clone();
                s.deadline = None;
                true
            })
            .await?
        else {
            return Ok(());
        };

        store.purge_sync_points(&stack.id, traversal).await?;
        warn!(stack = %stack.id, %action, %traversal, %reason, "stack action failed");
        self.announce(&failed).await;

        if !wants_rollback {
            StackLock::for_context(&self.ctx).release(&stack.id).await?;
            return Ok(());
        }

        let target = failed.known_good.clone().unwrap_or_default();
        info!(stack = %stack.id, "rolling back to last known-good template");
        let desired = Desired::revert_to(target, self.ctx.config.stack_timeout);
        if let Err(err) = self.begin(&stack.id, StackAction::Rollback, desired).await {
            error!(stack = %stack.id, error = %err, "failed to start rollback");
            let note = format!("{reason}; rollback could not start: {err}");
            self.modify_stack(&stack.id, |s| {
                s.status_reason = note.clone();
                true
            })
            .await?;
            StackLock::for_context(&self.ctx).release(&stack.id).await?;
        }
        Ok(())
    }

    /// Stack-level event plus broadcast notification.
    async fn announce(&self, stack: &StackRecord) {
        self.ctx
            .record_event(EventRecord::new(
                &stack.id,
                &stack.id,
                stack.action,
                stack.status,
                stack.status_reason.clone(),
            ))
            .await;
        self.ctx.notify(StackNotification {
            stack_id: stack.id.clone(),
            traversal: stack.current_traversal,
            action: stack.action,
            status: stack.status,
            reason: stack.status_reason.clone(),
        });
    }
}
