// src/engine/recovery.rs

//! Takeover of stacks whose owning engine died mid-traversal.
//!
//! Everything a traversal needs is persisted: node states in the graph
//! record, fan-in progress in sync points, in-flight operations as
//! continuation tokens on resource rows. Recovery therefore only has to
//! re-send the messages that were lost with the dead engine's bus.

use tracing::{info, warn};

use crate::bus::{EngineMessage, NodeRequest};
use crate::dag::{InputData, NodeKey};
use crate::engine::lock::StackLock;
use crate::engine::orchestrator::Orchestrator;
use crate::engine::EngineContext;
use crate::errors::Result;
use crate::store::{GraphRecord, StackRecord, SyncPointKey};
use crate::traversal::{NodeState, Transition, TraversalStates};
use crate::types::StackStatus;

/// Resume every unfinished stack this engine can own. Returns how many
/// stacks were resumed.
pub async fn recover(ctx: &EngineContext, orchestrator: &Orchestrator) -> Result<usize> {
    let store = ctx.store.as_ref();
    let lock = StackLock::for_context(ctx);
    let mut resumed = 0;

    for stack in store.list_stacks().await? {
        if !matches!(stack.status, StackStatus::Queued | StackStatus::InProgress) {
            continue;
        }
        if let Some(owner) = store.get_lock(&stack.id).await? {
            if !lock.owner_alive(&owner).await? {
                info!(stack = %stack.id, previous_owner = %owner.engine_id, "taking over stack");
            } else if owner.engine_id != ctx.engine_id() {
                continue;
            }
        }
        if let Err(err) = lock.acquire(&stack.id).await {
            warn!(stack = %stack.id, error = %err, "could not take over stack");
            continue;
        }

        match resume_stack(ctx, orchestrator, &stack).await {
            Ok(()) => resumed += 1,
            Err(err) => warn!(stack = %stack.id, error = %err, "failed to resume stack"),
        }
    }
    Ok(resumed)
}

async fn resume_stack(
    ctx: &EngineContext,
    orchestrator: &Orchestrator,
    stack: &StackRecord,
) -> Result<()> {
    let store = ctx.store.as_ref();
    let graph = match stack.current_traversal {
        Some(traversal) if stack.status == StackStatus::InProgress => {
            store.get_graph(&stack.id, traversal).await?
        }
        _ => None,
    };
    let Some(graph) = graph else {
        // Lost between accepting the action and persisting its traversal.
        let reason = format!("Stack {} interrupted before it started", stack.action);
        orchestrator
            .modify_stack(&stack.id, |s| {
                s.status = StackStatus::Failed;
                s.status_reason = reason.clone();
                true
            })
            .await?;
        StackLock::for_context(ctx).release(&stack.id).await?;
        warn!(stack = %stack.id, "stack interrupted before its traversal started");
        return Ok(());
    };

    if graph.finalized {
        return orchestrator.finalize(&stack.id, graph.traversal).await;
    }

    let rows = store.list_resources(&stack.id).await?;
    let mut redispatched = 0;

    for (node, state) in graph.states.iter() {
        if *state != NodeState::Running {
            continue;
        }
        let input = predecessor_input(ctx, &graph, node).await?;
        // Outbid the dead worker's row lock.
        let attempt = rows
            .iter()
            .filter(|r| r.name == node.resource)
            .filter_map(|r| r.lock.as_ref())
            .filter(|l| l.traversal == graph.traversal)
            .map(|l| l.attempt + 1)
            .max()
            .unwrap_or(1);
        let mut request = NodeRequest::new(&stack.id, graph.traversal, node.clone(), input);
        request.attempt = attempt;
        ctx.send(EngineMessage::CheckResource(request)).await?;
        redispatched += 1;
    }

    // Successors whose last predecessor's report was lost after its sync
    // point triggered.
    let mut ready = Vec::new();
    for (node, state) in graph.states.iter() {
        if *state != NodeState::Pending {
            continue;
        }
        let key = sync_key(&graph, node);
        if let Some(point) = store.get_sync_point(&key).await? {
            if point.triggered {
                ready.push((node.clone(), point.input));
            }
        }
    }
    if !ready.is_empty() {
        let keys: Vec<NodeKey> = ready.iter().map(|(k, _)| k.clone()).collect();
        let transition = orchestrator
            .modify_graph(&stack.id, graph.traversal, |record| {
                let mut states = TraversalStates::new(&record.graph, &mut record.states);
                let dispatch = keys
                    .iter()
                    .filter(|k| states.mark_running(k))
                    .cloned()
                    .collect();
                Transition {
                    dispatch,
                    ..Transition::default()
                }
            })
            .await?
            .unwrap_or_default();
        for (node, input) in ready {
            if transition.dispatch.contains(&node) {
                let request = NodeRequest::new(&stack.id, graph.traversal, node, input);
                ctx.send(EngineMessage::CheckResource(request)).await?;
                redispatched += 1;
            }
        }
    }

    info!(
        stack = %stack.id,
        traversal = %graph.traversal,
        redispatched,
        "resumed traversal"
    );
    Ok(())
}

/// Input of a running node: the tombstone of its triggered sync point, or
/// nothing for a root.
async fn predecessor_input(
    ctx: &EngineContext,
    graph: &GraphRecord,
    node: &NodeKey,
) -> Result<InputData> {
    if graph.graph.in_degree(node) == 0 {
        return Ok(InputData::new());
    }
    let point = ctx.store.get_sync_point(&sync_key(graph, node)).await?;
    Ok(point.map(|p| p.input).unwrap_or_default())
}

fn sync_key(graph: &GraphRecord, node: &NodeKey) -> SyncPointKey {
    SyncPointKey {
        stack_id: graph.stack_id.clone(),
        traversal: graph.traversal,
        node: node.clone(),
    }
}
