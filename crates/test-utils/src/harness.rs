use std::sync::Arc;
use std::time::Duration;

use convergent::config::EngineConfig;
use convergent::engine::{Engine, StackRequest, StackStatusView};
use convergent::errors::Result;
use convergent::plugin::PluginRegistry;
use convergent::store::{InMemoryStore, ResourceRecord, Store};
use convergent::template::Template;
use convergent::types::TraversalId;

use crate::fake_plugin::ScriptedPlugin;
use crate::with_timeout;

/// Engine config with timings short enough for tests.
pub fn test_config(engine_id: &str) -> EngineConfig {
    let mut config = EngineConfig::default().with_engine_id(engine_id);
    config.lock_lease = Duration::from_secs(5);
    config.heartbeat_interval = Duration::from_millis(50);
    config.engine_liveness_timeout = Duration::from_secs(2);
    config.poll_interval = Duration::from_millis(5);
    config.max_poll_interval = Duration::from_millis(20);
    config.node_timeout = Duration::from_secs(10);
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(5);
    config
}

/// A running engine over an in-memory store, with a [`ScriptedPlugin`] and
/// the built-in types registered.
pub struct TestEngine {
    pub engine: Engine,
    pub store: Arc<InMemoryStore>,
    pub plugin: Arc<ScriptedPlugin>,
}

impl TestEngine {
    pub fn start() -> Self {
        Self::start_with(test_config("engine-a"), ScriptedPlugin::new())
    }

    pub fn start_with(config: EngineConfig, plugin: ScriptedPlugin) -> Self {
        Self::start_on(Arc::new(InMemoryStore::new()), config, Arc::new(plugin))
    }

    /// Another engine sharing `store` (and usually the same plugin).
    pub fn start_on(
        store: Arc<InMemoryStore>,
        config: EngineConfig,
        plugin: Arc<ScriptedPlugin>,
    ) -> Self {
        let mut registry = PluginRegistry::with_builtins();
        registry.register(plugin.clone());
        let engine = Engine::start(config, store.clone(), registry);
        Self {
            engine,
            store,
            plugin,
        }
    }

    pub async fn create(&self, stack: &str, template: Template) -> Result<TraversalId> {
        self.engine
            .create_stack(stack, StackRequest::new(template))
            .await
    }

    pub async fn update(&self, stack: &str, template: Template) -> Result<TraversalId> {
        self.engine
            .update_stack(stack, StackRequest::new(template))
            .await
    }

    /// Wait (bounded) until the stack settled.
    pub async fn settle(&self, stack: &str) -> StackStatusView {
        with_timeout(self.engine.wait_until_settled(stack))
            .await
            .expect("stack status")
    }

    /// Create and wait.
    pub async fn converge(&self, stack: &str, template: Template) -> StackStatusView {
        self.create(stack, template).await.expect("create accepted");
        self.settle(stack).await
    }

    pub async fn rows(&self, stack: &str) -> Vec<ResourceRecord> {
        self.store.list_resources(stack).await.expect("rows")
    }

    /// The live row of `name`.
    pub async fn row(&self, stack: &str, name: &str) -> ResourceRecord {
        self.rows(stack)
            .await
            .into_iter()
            .find(|r| r.name == name && r.is_live())
            .unwrap_or_else(|| panic!("no live row for {name}"))
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await.expect("clean shutdown");
    }
}
