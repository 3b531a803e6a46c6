// src/engine/mod.rs

//! The convergence engine.
//!
//! This module ties together:
//! - the orchestrator, which turns stack actions into traversals and reacts
//!   to node completions;
//! - the worker, which runs one node's resource operation;
//! - the stack lock and the cancellation controller;
//! - the runtime loop that consumes bus messages and keeps this engine's
//!   heartbeat and lock leases fresh.
//!
//! [`Engine`] is the surface exposed to callers.

pub mod cancel;
pub mod lock;
pub mod orchestrator;
pub mod recovery;
pub mod runtime;
pub mod status;
pub mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bus::{EngineMessage, LocalBus, MessageBus};
use crate::config::EngineConfig;
use crate::dag::BuiltGraph;
use crate::errors::Result;
use crate::plugin::PluginRegistry;
use crate::store::{EventRecord, Store};
use crate::template::{Environment, StandardResolver, Template, TemplateResolver};
use crate::types::{CancelMode, StackAction, StackId, StackStatus, TraversalId};

pub use cancel::CancellationController;
pub use lock::StackLock;
pub use orchestrator::Orchestrator;
pub use runtime::Runtime;
pub use status::{ResourceStatusView, StackStatusView};
pub use worker::Worker;

/// Shared collaborators of one engine instance.
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<dyn Store>,
    pub registry: Arc<PluginRegistry>,
    pub resolver: Arc<dyn TemplateResolver>,
    pub bus: Arc<dyn MessageBus>,
    pub notifications: broadcast::Sender<StackNotification>,
}

impl EngineContext {
    pub fn engine_id(&self) -> &str {
        &self.config.engine_id
    }

    /// Publish a stack status change to subscribers (if any).
    pub fn notify(&self, notification: StackNotification) {
        // No receivers is fine.
        let _ = self.notifications.send(notification);
    }

    /// Append an event, logging instead of failing the caller.
    pub async fn record_event(&self, event: EventRecord) {
        if let Err(err) = self.store.append_event(&event).await {
            warn!(stack = %event.stack_id, error = %err, "failed to record event");
        }
    }

    pub async fn send(&self, message: EngineMessage) -> Result<()> {
        self.bus.send(message).await
    }
}

/// Stack-level status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackNotification {
    pub stack_id: StackId,
    pub traversal: Option<TraversalId>,
    pub action: StackAction,
    pub status: StackStatus,
    pub reason: String,
}

/// Desired state for a create or update.
#[derive(Debug, Clone, Default)]
pub struct StackRequest {
    pub template: Template,
    pub environment: Environment,
    /// Take precedence over environment parameters.
    pub parameters: BTreeMap<String, Value>,
    pub owner: String,
    /// Converge back to the last known-good template if the action fails.
    pub rollback_on_failure: bool,
    /// Whole-stack deadline, overriding the configured stack timeout.
    pub timeout: Option<Duration>,
}

impl StackRequest {
    pub fn new(template: Template) -> Self {
        Self {
            template,
            ..Self::default()
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_rollback(mut self, rollback_on_failure: bool) -> Self {
        self.rollback_on_failure = rollback_on_failure;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub(crate) fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

/// A running engine instance: its runtime loop plus the public operations.
///
/// Several engines may share one [`Store`]; each has its own bus and
/// engine id.
pub struct Engine {
    ctx: Arc<EngineContext>,
    orchestrator: Orchestrator,
    runtime: JoinHandle<Result<()>>,
}

impl Engine {
    /// Start an engine with the default template resolver.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: EngineConfig,
        store: Arc<dyn Store>,
        registry: PluginRegistry,
    ) -> Self {
        Self::start_with_resolver(config, store, registry, Arc::new(StandardResolver))
    }

    pub fn start_with_resolver(
        config: EngineConfig,
        store: Arc<dyn Store>,
        mut registry: PluginRegistry,
        resolver: Arc<dyn TemplateResolver>,
    ) -> Self {
        registry.configure(&config);
        let (bus, rx) = LocalBus::channel(config.queue_length);
        let (notifications, _) = broadcast::channel(config.queue_length.max(16));

        let ctx = Arc::new(EngineContext {
            config,
            store,
            registry: Arc::new(registry),
            resolver,
            bus: Arc::new(bus),
            notifications,
        });

        info!(engine = %ctx.engine_id(), "starting engine");
        let runtime = Runtime::new(ctx.clone(), rx);
        let handle = tokio::spawn(runtime.run());

        Self {
            orchestrator: Orchestrator::new(ctx.clone()),
            ctx,
            runtime: handle,
        }
    }

    pub fn engine_id(&self) -> &str {
        self.ctx.engine_id()
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Start converging `stack_id` per `action`. Returns the new traversal.
    ///
    /// Validation errors and lock contention are returned here; nothing is
    /// scheduled in that case.
    pub async fn start_stack_action(
        &self,
        stack_id: &str,
        action: StackAction,
        request: StackRequest,
    ) -> Result<TraversalId> {
        self.orchestrator
            .start_stack_action(stack_id, action, request)
            .await
    }

    pub async fn create_stack(
        &self,
        stack_id: &str,
        request: StackRequest,
    ) -> Result<TraversalId> {
        self.start_stack_action(stack_id, StackAction::Create, request)
            .await
    }

    pub async fn update_stack(
        &self,
        stack_id: &str,
        request: StackRequest,
    ) -> Result<TraversalId> {
        self.start_stack_action(stack_id, StackAction::Update, request)
            .await
    }

    pub async fn delete_stack(&self, stack_id: &str) -> Result<TraversalId> {
        self.start_stack_action(stack_id, StackAction::Delete, StackRequest::default())
            .await
    }

    /// Converge back to the last known-good template.
    pub async fn rollback_stack(&self, stack_id: &str) -> Result<TraversalId> {
        self.start_stack_action(stack_id, StackAction::Rollback, StackRequest::default())
            .await
    }

    /// Graph and diff an update would produce, without touching anything.
    pub async fn preview(&self, stack_id: &str, request: &StackRequest) -> Result<BuiltGraph> {
        self.orchestrator.preview(stack_id, request).await
    }

    pub async fn cancel(&self, stack_id: &str, mode: CancelMode) -> Result<()> {
        CancellationController::new(self.ctx.clone())
            .cancel(stack_id, mode)
            .await
    }

    pub async fn status(&self, stack_id: &str) -> Result<StackStatusView> {
        status::stack_status(self.ctx.store.as_ref(), stack_id).await
    }

    /// Failed resources of a stack and their error messages.
    pub async fn failures(&self, stack_id: &str) -> Result<BTreeMap<String, String>> {
        status::failures(self.ctx.store.as_ref(), stack_id).await
    }

    pub async fn events(&self, stack_id: &str) -> Result<Vec<EventRecord>> {
        self.ctx.store.list_events(stack_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StackNotification> {
        self.ctx.notifications.subscribe()
    }

    /// Wait until the stack's action, including any rollback it triggered,
    /// has finished: terminal status and no stack lock held.
    pub async fn wait_until_settled(&self, stack_id: &str) -> Result<StackStatusView> {
        let mut notifications = self.subscribe();
        loop {
            let view = self.status(stack_id).await?;
            if view.status.is_terminal() && self.ctx.store.get_lock(stack_id).await?.is_none() {
                return Ok(view);
            }
            tokio::select! {
                _ = notifications.recv() => {}
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }
        }
    }

    /// Take over in-progress stacks whose owner died and redispatch their
    /// running nodes. Returns the number of stacks resumed.
    pub async fn recover(&self) -> Result<usize> {
        recovery::recover(&self.ctx, &self.orchestrator).await
    }

    /// Stop the runtime loop and wait for it.
    pub async fn shutdown(self) -> Result<()> {
        if let Err(err) = self.ctx.send(EngineMessage::Shutdown).await {
            warn!(error = %err, "runtime already stopped");
        }
        match self.runtime.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("engine runtime panicked: {err}").into()),
        }
    }
}
