// src/engine/worker.rs

//! Worker dispatcher: runs one node's resource operation.
//!
//! A worker never blocks on an external system. An operation that reports
//! "in progress" has its continuation token persisted on the resource row and
//! a `ResumeCheck` scheduled on the bus; the check then runs as a fresh
//! message, so a crash in between loses nothing but the timer.
//!
//! Rows are claimed with a row lock `(engine, traversal, attempt)` before any
//! operation starts. That serializes an old traversal's in-flight operation
//! with the new traversal's node for the same resource, and filters out
//! redelivered requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bus::{send_after, EngineMessage, NodeReport, NodeRequest};
use crate::dag::digest::input_digest;
use crate::dag::{NodeKind, NodePlan, ResourceData};
use crate::engine::lock::engine_alive;
use crate::engine::{chrono_duration, EngineContext};
use crate::errors::{ConvergeError, Result};
use crate::plugin::{
    run_operation, OpOutcome, OpResult, Operation, OperationContext, ResourcePlugin, TypePolicy,
};
use crate::store::{CasResult, EventRecord, ResourceId, ResourceRecord, RowLock};
use crate::template::refs::resolve_references;
use crate::template::ResolvedResource;
use crate::traversal::{NodeOutcome, NodeState, MAX_CAS_RETRIES};
use crate::types::{ResourceAction, ResourceStatus};

/// Result of trying to take a row lock.
enum Claim {
    Acquired(ResourceRecord),
    /// Same node and attempt already being handled (redelivery).
    Duplicate,
    /// Another traversal is still operating on the row.
    Busy,
}

/// Where an operation ended up after one step.
enum Settled {
    Done(ResourceRecord),
    /// Continuation persisted, check scheduled.
    Waiting,
    /// Transient error, retry scheduled.
    Retrying,
    Failed(String),
}

#[derive(Clone)]
pub struct Worker {
    ctx: Arc<EngineContext>,
}

impl Worker {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Handle a `CheckResource` (`resume == false`) or `ResumeCheck`.
    pub async fn handle(&self, request: NodeRequest, resume: bool) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let Some(stack) = store.get_stack(&request.stack_id).await? else {
            return Ok(());
        };

        // Operations already in flight finish even when superseded; their
        // report is dropped by the orchestrator.
        let current = stack.is_current(request.traversal);
        if !current && !resume {
            debug!(
                stack = %request.stack_id,
                node = %request.node,
                traversal = %request.traversal,
                "dropping node request of superseded traversal"
            );
            return Ok(());
        }

        if current {
            if stack.cancel_for(request.traversal).is_some() {
                return self.cancel_node(&request).await;
            }
            if stack.deadline.is_some_and(|deadline| Utc::now() > deadline) {
                let row = self.locked_row(&request).await?;
                let reason = format!("Stack {} timed out", stack.action);
                return self.fail_node(&request, row, reason).await;
            }
        }

        if resume {
            return self.resume(&request, current).await;
        }
        match request.node.kind {
            NodeKind::Update => self.run_update(&request).await,
            NodeKind::Cleanup => self.run_cleanup(&request).await,
        }
    }

    async fn run_update(&self, request: &NodeRequest) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let Some(graph) = store.get_graph(&request.stack_id, request.traversal).await? else {
            return Ok(());
        };
        if graph.state(&request.node) != Some(&NodeState::Running) {
            debug!(node = %request.node, "node no longer running; dropping request");
            return Ok(());
        }
        let Some(plan) = graph.graph.update_plan(&request.node).cloned() else {
            return self
                .fail_node(request, None, format!("no update plan for {}", request.node))
                .await;
        };
        let spec = &plan.spec;

        let properties = match resolve_references(&spec.properties, &request.input) {
            Ok(value) => value,
            Err(err) => {
                let reason = format!("Property error: {err}");
                return self.fail_node(request, None, reason).await;
            }
        };
        let plugin = match self.ctx.registry.require(&spec.resource_type) {
            Ok(plugin) => plugin,
            Err(err) => return self.fail_node(request, None, err.to_string()).await,
        };
        let policy = self
            .ctx
            .registry
            .policy(&spec.resource_type, spec.replacement_policy);
        if let Some(reason) = node_timed_out(request, &policy) {
            return self.fail_node(request, None, reason).await;
        }

        let rows = store.list_resources(&request.stack_id).await?;
        let name = &request.node.resource;
        let next_generation = rows
            .iter()
            .filter(|r| &r.name == name)
            .map(|r| r.generation + 1)
            .max()
            .unwrap_or(0);
        let live = rows.iter().find(|r| &r.name == name && r.is_live()).cloned();

        let row = match live {
            Some(row) => match self.claim(request, row, &policy).await? {
                Claim::Acquired(row) => row,
                Claim::Duplicate => {
                    debug!(node = %request.node, attempt = request.attempt, "duplicate request");
                    return Ok(());
                }
                Claim::Busy => {
                    self.requeue(request);
                    return Ok(());
                }
            },
            None => {
                // Brand new, or its previous generation was deleted first.
                let deleted = rows
                    .iter()
                    .filter(|r| &r.name == name && r.current)
                    .max_by_key(|r| r.generation)
                    .cloned();
                let replaces = deleted.as_ref().map(|r| r.id);
                let Some(row) = self
                    .insert_row(request, spec, next_generation, replaces)
                    .await?
                else {
                    return Ok(());
                };
                if let Some(old) = deleted {
                    self.retire(old, row.id).await?;
                }
                let settled = self
                    .converge(
                        request,
                        row,
                        ResourceAction::Create,
                        spec,
                        properties,
                        &plugin,
                        &policy,
                    )
                    .await?;
                return self.finish_update(request, settled).await;
            }
        };

        // A previous attempt left an operation in flight; keep polling it.
        if row.status == ResourceStatus::InProgress && row.continuation.is_some() {
            let settled = self.poll_row(request, row, &plugin, &policy).await?;
            return self.finish_update(request, settled).await;
        }

        if row.physical_id.is_none() {
            let settled = self
                .converge(
                    request,
                    row,
                    ResourceAction::Create,
                    spec,
                    properties,
                    &plugin,
                    &policy,
                )
                .await?;
            return self.finish_update(request, settled).await;
        }

        let unplanned = row.resource_type != spec.resource_type
            || row.is_incomplete()
            || plugin.needs_replacement(&row.properties, &properties);
        if plan.replace.is_some() || unplanned {
            if plan.replace.is_none() {
                warn!(
                    node = %request.node,
                    "replacement needed at runtime; old generation is left for the next cleanup"
                );
            }
            let Some(new_row) = self
                .insert_row(request, spec, next_generation, Some(row.id))
                .await?
            else {
                self.release(row).await?;
                return Ok(());
            };
            info!(
                stack = %request.stack_id,
                resource = %name,
                generation = new_row.generation,
                "replacing resource"
            );
            self.retire(row, new_row.id).await?;
            let settled = self
                .converge(
                    request,
                    new_row,
                    ResourceAction::Create,
                    spec,
                    properties,
                    &plugin,
                    &policy,
                )
                .await?;
            return self.finish_update(request, settled).await;
        }

        if row.is_converged() && row.properties == properties {
            let mut row = row;
            row.template_properties = spec.properties.clone();
            row.requires = spec.requires.clone();
            row.template_digest = Some(plan.digest.clone());
            row.lock = None;
            let row = self.save(row).await?;
            debug!(node = %request.node, "resource unchanged; skipping");
            return self.report(request, NodeOutcome::Success(row.data())).await;
        }

        let settled = self
            .converge(
                request,
                row,
                ResourceAction::Update,
                spec,
                properties,
                &plugin,
                &policy,
            )
            .await?;
        self.finish_update(request, settled).await
    }

    async fn finish_update(&self, request: &NodeRequest, settled: Settled) -> Result<()> {
        match settled {
            Settled::Done(row) => self.report(request, NodeOutcome::Success(row.data())).await,
            Settled::Failed(reason) => self.report(request, NodeOutcome::Failed(reason)).await,
            Settled::Waiting | Settled::Retrying => Ok(()),
        }
    }

    /// Delete the generations this cleanup node is responsible for, one at
    /// a time, oldest first.
    async fn run_cleanup(&self, request: &NodeRequest) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let Some(graph) = store.get_graph(&request.stack_id, request.traversal).await? else {
            return Ok(());
        };
        if graph.state(&request.node) != Some(&NodeState::Running) {
            return Ok(());
        }
        let delete_current = match graph.graph.plan(&request.node) {
            Some(NodePlan::Cleanup(plan)) => plan.delete_current,
            _ => {
                let reason = format!("no cleanup plan for {}", request.node);
                return self.fail_node(request, None, reason).await;
            }
        };

        loop {
            let target = store
                .list_resources(&request.stack_id)
                .await?
                .into_iter()
                .filter(|r| {
                    r.name == request.node.resource
                        && !r.is_deleted()
                        && (!r.current || delete_current)
                })
                .min_by_key(|r| r.generation);
            let Some(target) = target else {
                return self
                    .report(request, NodeOutcome::Success(ResourceData::default()))
                    .await;
            };

            let policy = self.ctx.registry.policy(&target.resource_type, None);
            if let Some(reason) = node_timed_out(request, &policy) {
                return self.fail_node(request, None, reason).await;
            }
            let mut row = match self.claim(request, target, &policy).await? {
                Claim::Acquired(row) => row,
                Claim::Duplicate => return Ok(()),
                Claim::Busy => {
                    self.requeue(request);
                    return Ok(());
                }
            };

            let settled = if row.physical_id.is_none() {
                // Never created; nothing physical to remove.
                row.action = ResourceAction::Delete;
                row.status = ResourceStatus::Complete;
                row.status_reason = "nothing to delete".to_string();
                row.continuation = None;
                row.lock = None;
                let row = self.save(row).await?;
                self.event(&row, "").await;
                Settled::Done(row)
            } else {
                let plugin = match self.ctx.registry.require(&row.resource_type) {
                    Ok(plugin) => plugin,
                    Err(err) => return self.fail_node(request, Some(row), err.to_string()).await,
                };
                if row.action == ResourceAction::Delete
                    && row.status == ResourceStatus::InProgress
                    && row.continuation.is_some()
                {
                    self.poll_row(request, row, &plugin, &policy).await?
                } else {
                    self.delete_row(request, row, &plugin, &policy).await?
                }
            };

            match settled {
                Settled::Done(_) => continue,
                Settled::Failed(reason) => {
                    return self.report(request, NodeOutcome::Failed(reason)).await;
                }
                Settled::Waiting | Settled::Retrying => return Ok(()),
            }
        }
    }

    /// Next check of an operation in flight.
    async fn resume(&self, request: &NodeRequest, current: bool) -> Result<()> {
        let store = self.ctx.store.as_ref();
        let Some(id) = request.resource_id else {
            return Ok(());
        };
        let Some(row) = store.get_resource(id).await? else {
            return Ok(());
        };
        if !self.owns(&row, request) || row.continuation.is_none() {
            debug!(node = %request.node, row = id, "row no longer ours; dropping resume");
            return Ok(());
        }

        let plugin = match self.ctx.registry.require(&row.resource_type) {
            Ok(plugin) => plugin,
            Err(err) => return self.fail_node(request, Some(row), err.to_string()).await,
        };
        let policy = self.ctx.registry.policy(&row.resource_type, None);
        if let Some(reason) = node_timed_out(request, &policy) {
            return self.fail_node(request, Some(row), reason).await;
        }

        let settled = self.poll_row(request, row, &plugin, &policy).await?;
        match (request.node.kind, settled) {
            (NodeKind::Cleanup, Settled::Done(_)) if current => self.run_cleanup(request).await,
            (NodeKind::Cleanup, Settled::Done(_)) => {
                self.report(request, NodeOutcome::Success(ResourceData::default()))
                    .await
            }
            (_, settled) => self.finish_update(request, settled).await,
        }
    }

    /// Persist the operation's intent, then start it.
    #[allow(clippy::too_many_arguments)]
    async fn converge(
        &self,
        request: &NodeRequest,
        mut row: ResourceRecord,
        action: ResourceAction,
        spec: &ResolvedResource,
        properties: Value,
        plugin: &Arc<dyn ResourcePlugin>,
        policy: &TypePolicy,
    ) -> Result<Settled> {
        let old_properties = std::mem::replace(&mut row.properties, properties.clone());
        row.action = action;
        row.status = ResourceStatus::InProgress;
        row.status_reason = String::new();
        row.resource_type = spec.resource_type.clone();
        row.template_properties = spec.properties.clone();
        row.requires = spec.requires.clone();
        row.template_digest = None;
        row.continuation = None;
        let row = self.save(row).await?;
        self.event(&row, "state changed").await;

        let physical_id = row.physical_id.clone().unwrap_or_default();
        let op = match action {
            ResourceAction::Update => Operation::Update {
                physical_id: &physical_id,
                old: &old_properties,
                new: &properties,
            },
            _ => Operation::Create {
                properties: &properties,
            },
        };
        let result = run_operation(
            plugin.as_ref(),
            &self.op_context(request),
            op,
            remaining(request, policy),
        )
        .await;
        self.settle(request, row, result, policy).await
    }

    async fn delete_row(
        &self,
        request: &NodeRequest,
        mut row: ResourceRecord,
        plugin: &Arc<dyn ResourcePlugin>,
        policy: &TypePolicy,
    ) -> Result<Settled> {
        row.action = ResourceAction::Delete;
        row.status = ResourceStatus::InProgress;
        row.status_reason = String::new();
        row.continuation = None;
        let row = self.save(row).await?;
        self.event(&row, "state changed").await;

        let physical_id = row.physical_id.clone().unwrap_or_default();
        let properties = row.properties.clone();
        let op = Operation::Delete {
            physical_id: &physical_id,
            properties: &properties,
        };
        let result = run_operation(
            plugin.as_ref(),
            &self.op_context(request),
            op,
            remaining(request, policy),
        )
        .await;
        self.settle(request, row, result, policy).await
    }

    /// Run the `check_*` matching the row's in-flight operation.
    async fn poll_row(
        &self,
        request: &NodeRequest,
        row: ResourceRecord,
        plugin: &Arc<dyn ResourcePlugin>,
        policy: &TypePolicy,
    ) -> Result<Settled> {
        let token = row.continuation.clone().unwrap_or_default();
        let physical_id = row.physical_id.clone().unwrap_or_default();
        let op = match row.action {
            ResourceAction::Update => Operation::CheckUpdate {
                physical_id: &physical_id,
                token: &token,
            },
            ResourceAction::Delete => Operation::CheckDelete {
                physical_id: &physical_id,
                token: &token,
            },
            ResourceAction::Create | ResourceAction::Init => {
                Operation::CheckCreate { token: &token }
            }
        };
        let result = run_operation(
            plugin.as_ref(),
            &self.op_context(request),
            op,
            remaining(request, policy),
        )
        .await;
        self.settle(request, row, result, policy).await
    }

    /// Persist what an operation step returned and schedule what follows.
    async fn settle(
        &self,
        request: &NodeRequest,
        mut row: ResourceRecord,
        result: OpResult,
        policy: &TypePolicy,
    ) -> Result<Settled> {
        match result {
            Ok(OpOutcome::Done(data)) => {
                row.status = ResourceStatus::Complete;
                row.status_reason = String::new();
                row.continuation = None;
                row.lock = None;
                if row.action != ResourceAction::Delete {
                    if data.physical_id.is_some() {
                        row.physical_id = data.physical_id;
                    }
                    row.attributes = data.attributes;
                    row.template_digest = Some(row_digest(&row));
                }
                let row = self.save(row).await?;
                self.event(&row, "state changed").await;
                Ok(Settled::Done(row))
            }
            Ok(OpOutcome::InProgress { physical_id, token }) => {
                if physical_id.is_some() {
                    row.physical_id = physical_id;
                }
                row.continuation = Some(token);
                let row = self.save(row).await?;
                let delay = self.ctx.config.poll_delay(request.poll);
                debug!(node = %request.node, poll = request.poll, ?delay, "operation in progress");
                send_after(
                    self.ctx.bus.clone(),
                    delay,
                    EngineMessage::ResumeCheck(request.next_poll(row.id)),
                );
                Ok(Settled::Waiting)
            }
            Err(err) if err.is_transient() && policy.retry.allows_retry(request.attempt) => {
                let delay = policy.retry.delay_after(request.attempt);
                let polling = row.continuation.is_some();
                row.status_reason = format!("retrying after transient error: {err}");
                if !polling {
                    row.lock = None;
                }
                let row = self.save(row).await?;
                info!(
                    node = %request.node,
                    attempt = request.attempt,
                    ?delay,
                    error = %err,
                    "transient resource error; retrying"
                );
                let message = if polling {
                    EngineMessage::ResumeCheck(NodeRequest {
                        attempt: request.attempt + 1,
                        resource_id: Some(row.id),
                        ..request.clone()
                    })
                } else {
                    EngineMessage::CheckResource(request.retry())
                };
                send_after(self.ctx.bus.clone(), delay, message);
                Ok(Settled::Retrying)
            }
            Err(err) => {
                let reason = err.to_string();
                row.status = ResourceStatus::Failed;
                row.status_reason = reason.clone();
                row.continuation = None;
                row.lock = None;
                let row = self.save(row).await?;
                self.event(&row, &reason).await;
                Ok(Settled::Failed(reason))
            }
        }
    }

    async fn cancel_node(&self, request: &NodeRequest) -> Result<()> {
        if let Some(mut row) = self.locked_row(request).await? {
            if row.status == ResourceStatus::InProgress {
                row.status = ResourceStatus::Cancelled;
                row.status_reason = "cancelled by user".to_string();
            }
            row.continuation = None;
            row.lock = None;
            let row = self.save(row).await?;
            self.event(&row, "cancelled by user").await;
        }
        info!(node = %request.node, "node cancelled");
        self.report(request, NodeOutcome::Cancelled).await
    }

    async fn fail_node(
        &self,
        request: &NodeRequest,
        row: Option<ResourceRecord>,
        reason: String,
    ) -> Result<()> {
        if let Some(mut row) = row {
            row.status = ResourceStatus::Failed;
            row.status_reason = reason.clone();
            row.continuation = None;
            row.lock = None;
            let row = self.save(row).await?;
            self.event(&row, &reason).await;
        } else {
            self.ctx
                .record_event(EventRecord::new(
                    &request.stack_id,
                    &request.node.resource,
                    ResourceAction::Init,
                    ResourceStatus::Failed,
                    reason.clone(),
                ))
                .await;
        }
        self.report(request, NodeOutcome::Failed(reason)).await
    }

    /// After `handle` bailed out with an error: mark the row this request
    /// still holds as FAILED and drop its lock, so later traversals can
    /// claim it. Returns whether a row was released.
    pub async fn abandon(&self, request: &NodeRequest, reason: &str) -> Result<bool> {
        let Some(mut row) = self.locked_row(request).await? else {
            return Ok(false);
        };
        row.status = ResourceStatus::Failed;
        row.status_reason = reason.to_string();
        row.continuation = None;
        row.lock = None;
        let row = self.save(row).await?;
        self.event(&row, reason).await;
        Ok(true)
    }

    async fn report(&self, request: &NodeRequest, outcome: NodeOutcome) -> Result<()> {
        self.ctx
            .send(EngineMessage::NodeCompleted(NodeReport::for_request(
                request, outcome,
            )))
            .await
    }

    fn requeue(&self, request: &NodeRequest) {
        debug!(node = %request.node, "row busy with another traversal; requeueing");
        send_after(
            self.ctx.bus.clone(),
            self.ctx.config.poll_interval,
            EngineMessage::CheckResource(request.clone()),
        );
    }

    fn owns(&self, row: &ResourceRecord, request: &NodeRequest) -> bool {
        row.lock.as_ref().is_some_and(|lock| {
            lock.engine_id == self.ctx.engine_id() && lock.traversal == request.traversal
        })
    }

    /// The row of this node's resource currently locked by this request.
    async fn locked_row(&self, request: &NodeRequest) -> Result<Option<ResourceRecord>> {
        let store = self.ctx.store.as_ref();
        if let Some(id) = request.resource_id {
            let row = store.get_resource(id).await?;
            return Ok(row.filter(|r| self.owns(r, request)));
        }
        let rows = store.list_resources(&request.stack_id).await?;
        Ok(rows
            .into_iter()
            .find(|r| r.name == request.node.resource && self.owns(r, request)))
    }

    async fn claim(
        &self,
        request: &NodeRequest,
        mut row: ResourceRecord,
        policy: &TypePolicy,
    ) -> Result<Claim> {
        for _ in 0..MAX_CAS_RETRIES {
            if let Some(lock) = &row.lock {
                let same_traversal = lock.traversal == request.traversal;
                let holder_alive = self.engine_alive(&lock.engine_id).await?;
                if same_traversal && lock.attempt >= request.attempt && holder_alive {
                    return Ok(Claim::Duplicate);
                }
                if !same_traversal {
                    let expired =
                        Utc::now() - lock.acquired_at > chrono_duration(policy.node_timeout);
                    if holder_alive && !expired {
                        return Ok(Claim::Busy);
                    }
                    warn!(
                        resource = %row.name,
                        holder = %lock.engine_id,
                        "taking over abandoned row lock"
                    );
                }
            }

            row.lock = Some(RowLock {
                engine_id: self.ctx.engine_id().to_string(),
                traversal: request.traversal,
                attempt: request.attempt,
                acquired_at: Utc::now(),
            });
            row.traversal = Some(request.traversal);

            match self.ctx.store.cas_resource(&row).await? {
                CasResult::Success => {
                    row.version += 1;
                    return Ok(Claim::Acquired(row));
                }
                CasResult::NotFound => return Ok(Claim::Duplicate),
                _ => match self.ctx.store.get_resource(row.id).await? {
                    Some(fresh) => row = fresh,
                    None => return Ok(Claim::Duplicate),
                },
            }
        }
        Err(ConvergeError::ConcurrencyConflict(format!(
            "row lock of '{}'",
            row.name
        )))
    }

    async fn engine_alive(&self, engine_id: &str) -> Result<bool> {
        if engine_id == self.ctx.engine_id() {
            return Ok(true);
        }
        engine_alive(
            self.ctx.store.as_ref(),
            engine_id,
            self.ctx.config.engine_liveness_timeout,
        )
        .await
    }

    /// Insert a new generation, already locked by this request. `None` if a
    /// concurrent attempt inserted it first.
    async fn insert_row(
        &self,
        request: &NodeRequest,
        spec: &ResolvedResource,
        generation: u32,
        replaces: Option<ResourceId>,
    ) -> Result<Option<ResourceRecord>> {
        let mut row = ResourceRecord::new(&request.stack_id, &spec.name, &spec.resource_type);
        row.generation = generation;
        row.replaces = replaces;
        row.requires = spec.requires.clone();
        row.template_properties = spec.properties.clone();
        row.traversal = Some(request.traversal);
        row.lock = Some(RowLock {
            engine_id: self.ctx.engine_id().to_string(),
            traversal: request.traversal,
            attempt: request.attempt,
            acquired_at: Utc::now(),
        });

        match self.ctx.store.insert_resource(&row).await? {
            Some(id) => {
                row.id = id;
                row.version = 0;
                Ok(Some(row))
            }
            None => {
                debug!(resource = %spec.name, generation, "generation inserted concurrently");
                Ok(None)
            }
        }
    }

    /// Mark `old` as superseded by `replacement`.
    async fn retire(&self, mut old: ResourceRecord, replacement: ResourceId) -> Result<()> {
        old.current = false;
        old.replaced_by = Some(replacement);
        old.lock = None;
        self.save(old).await.map(|_| ())
    }

    async fn release(&self, mut row: ResourceRecord) -> Result<()> {
        row.lock = None;
        self.save(row).await.map(|_| ())
    }

    /// Conditional write of a row this worker holds the lock of.
    async fn save(&self, mut row: ResourceRecord) -> Result<ResourceRecord> {
        match self.ctx.store.cas_resource(&row).await? {
            CasResult::Success => {
                row.version += 1;
                Ok(row)
            }
            other => Err(ConvergeError::ConcurrencyConflict(format!(
                "resource '{}' generation {} lost its row lock ({other:?})",
                row.name, row.generation
            ))),
        }
    }

    async fn event(&self, row: &ResourceRecord, reason: &str) {
        self.ctx
            .record_event(
                EventRecord::new(&row.stack_id, &row.name, row.action, row.status, reason)
                    .with_physical_id(row.physical_id.clone()),
            )
            .await;
    }

    fn op_context(&self, request: &NodeRequest) -> OperationContext {
        OperationContext {
            stack_id: request.stack_id.clone(),
            resource_name: request.node.resource.clone(),
            traversal: request.traversal,
            attempt: request.attempt,
            poll: request.poll,
        }
    }
}

/// Digest of the inputs a row was converged with; matches the update plan
/// digest of the same inputs.
fn row_digest(row: &ResourceRecord) -> String {
    input_digest(&ResolvedResource {
        name: row.name.clone(),
        resource_type: row.resource_type.clone(),
        properties: row.template_properties.clone(),
        requires: row.requires.clone(),
        replacement_policy: None,
    })
}

fn elapsed(request: &NodeRequest) -> Duration {
    (Utc::now() - request.started_at).to_std().unwrap_or_default()
}

fn node_timed_out(request: &NodeRequest, policy: &TypePolicy) -> Option<String> {
    let elapsed = elapsed(request);
    (elapsed > policy.node_timeout).then(|| {
        ConvergeError::Timeout {
            what: format!("Resource {}", request.node.resource),
            elapsed,
        }
        .to_string()
    })
}

fn remaining(request: &NodeRequest, policy: &TypePolicy) -> Duration {
    policy
        .node_timeout
        .saturating_sub(elapsed(request))
        .max(Duration::from_millis(1))
}
