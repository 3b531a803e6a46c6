// src/engine/runtime.rs

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::bus::{EngineMessage, NodeReport, NodeRequest};
use crate::errors::Result;
use crate::traversal::NodeOutcome;

use super::lock::StackLock;
use super::orchestrator::Orchestrator;
use super::worker::Worker;
use super::EngineContext;

/// Consumes one engine's bus and hands each message to the orchestrator or
/// the worker dispatcher.
///
/// Every message is handled on its own task, so a slow resource operation
/// never holds up completions of other nodes. Between messages the loop
/// keeps this engine's heartbeat and stack lock leases fresh.
pub struct Runtime {
    ctx: Arc<EngineContext>,
    rx: mpsc::Receiver<EngineMessage>,
    orchestrator: Orchestrator,
    worker: Worker,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("engine_id", &self.ctx.engine_id())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(ctx: Arc<EngineContext>, rx: mpsc::Receiver<EngineMessage>) -> Self {
        Self {
            orchestrator: Orchestrator::new(ctx.clone()),
            worker: Worker::new(ctx.clone()),
            ctx,
            rx,
        }
    }

    /// Main loop. Returns once `Shutdown` arrives or every sender is gone.
    pub async fn run(mut self) -> Result<()> {
        info!(engine = %self.ctx.engine_id(), "engine runtime started");
        self.ctx
            .store
            .record_heartbeat(self.ctx.engine_id(), Utc::now())
            .await?;

        let mut heartbeat = interval(self.ctx.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.rx.recv() => {
                    let Some(message) = message else {
                        info!("engine message channel closed; exiting");
                        break;
                    };
                    if matches!(message, EngineMessage::Shutdown) {
                        info!("shutdown requested; stopping runtime");
                        break;
                    }
                    self.dispatch(message);
                }
                _ = heartbeat.tick() => {
                    self.beat().await;
                }
            }
        }

        info!(engine = %self.ctx.engine_id(), "engine runtime exiting");
        Ok(())
    }

    async fn beat(&self) {
        if let Err(err) = self
            .ctx
            .store
            .record_heartbeat(self.ctx.engine_id(), Utc::now())
            .await
        {
            warn!(error = %err, "failed to record heartbeat");
        }
        match StackLock::for_context(&self.ctx).renew_all().await {
            Ok(renewed) if renewed > 0 => debug!(renewed, "renewed stack locks"),
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to renew stack locks"),
        }
    }

    fn dispatch(&self, message: EngineMessage) {
        debug!(?message, "runtime received message");
        match message {
            EngineMessage::CheckResource(request) => self.spawn_worker(request, false),
            EngineMessage::ResumeCheck(request) => self.spawn_worker(request, true),
            EngineMessage::NodeCompleted(report) => {
                let orchestrator = self.orchestrator.clone();
                tokio::spawn(async move {
                    let (stack, node) = (report.stack_id.clone(), report.node.clone());
                    if let Err(err) = orchestrator.node_completed(report).await {
                        error!(%stack, %node, error = %err, "failed to process node completion");
                    }
                });
            }
            EngineMessage::Shutdown => {}
        }
    }

    fn spawn_worker(&self, request: NodeRequest, resume: bool) {
        let worker = self.worker.clone();
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            let Err(err) = worker.handle(request.clone(), resume).await else {
                return;
            };
            error!(
                stack = %request.stack_id,
                node = %request.node,
                error = %err,
                "worker failed"
            );
            let reason = err.to_string();
            match worker.abandon(&request, &reason).await {
                Ok(true) => debug!(node = %request.node, "released row of failed worker"),
                Ok(false) => {}
                Err(err) => warn!(node = %request.node, error = %err, "failed to release row"),
            }
            let report = NodeReport::for_request(&request, NodeOutcome::Failed(reason));
            if let Err(err) = orchestrator.node_completed(report).await {
                error!(node = %request.node, error = %err, "failed to report worker failure");
            }
        });
    }
}
