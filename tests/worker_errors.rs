mod common;
use crate::common::{init_tracing, scripted};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use convergent::engine::{Engine, StackRequest};
use convergent::errors::Result;
use convergent::plugin::PluginRegistry;
use convergent::store::{
    CasResult, EventRecord, GraphRecord, InMemoryStore, LockRecord, ResourceId, ResourceRecord,
    StackRecord, Store, SyncPointKey, SyncPointRecord,
};
use convergent::template::Template;
use convergent::types::{ResourceAction, ResourceStatus, StackStatus, TraversalId};
use convergent_test_utils::builders::{get_resource, TemplateBuilder};
use convergent_test_utils::fake_plugin::ScriptedPlugin;
use convergent_test_utils::harness::test_config;
use convergent_test_utils::with_timeout;

/// In-memory store that loses one write: the row of `target` reaching
/// CREATE COMPLETE, as if another writer got there first.
struct LosesOneWrite {
    inner: InMemoryStore,
    target: String,
    armed: AtomicBool,
}

impl LosesOneWrite {
    fn new(target: &str) -> Self {
        Self {
            inner: InMemoryStore::new(),
            target: target.to_string(),
            armed: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl Store for LosesOneWrite {
    async fn create_stack(&self, stack: &StackRecord) -> Result<CasResult> {
        self.inner.create_stack(stack).await
    }

    async fn get_stack(&self, stack_id: &str) -> Result<Option<StackRecord>> {
        self.inner.get_stack(stack_id).await
    }

    async fn cas_stack(&self, stack: &StackRecord) -> Result<CasResult> {
        self.inner.cas_stack(stack).await
    }

    async fn list_stacks(&self) -> Result<Vec<StackRecord>> {
        self.inner.list_stacks().await
    }

    async fn insert_resource(&self, resource: &ResourceRecord) -> Result<Option<ResourceId>> {
        self.inner.insert_resource(resource).await
    }

    async fn get_resource(&self, id: ResourceId) -> Result<Option<ResourceRecord>> {
        self.inner.get_resource(id).await
    }

    async fn list_resources(&self, stack_id: &str) -> Result<Vec<ResourceRecord>> {
        self.inner.list_resources(stack_id).await
    }

    async fn cas_resource(&self, resource: &ResourceRecord) -> Result<CasResult> {
        let completes_target = resource.name == self.target
            && resource.action == ResourceAction::Create
            && resource.status == ResourceStatus::Complete;
        if completes_target && self.armed.swap(false, Ordering::SeqCst) {
            return Ok(CasResult::VersionConflict {
                actual: resource.version + 1,
            });
        }
        self.inner.cas_resource(resource).await
    }

    async fn delete_resource(&self, id: ResourceId) -> Result<()> {
        self.inner.delete_resource(id).await
    }

    async fn put_graph(&self, graph: &GraphRecord) -> Result<()> {
        self.inner.put_graph(graph).await
    }

    async fn get_graph(
        &self,
        stack_id: &str,
        traversal: TraversalId,
    ) -> Result<Option<GraphRecord>> {
        self.inner.get_graph(stack_id, traversal).await
    }

    async fn cas_graph(&self, graph: &GraphRecord) -> Result<CasResult> {
        self.inner.cas_graph(graph).await
    }

    async fn delete_graphs_except(&self, stack_id: &str, keep: Option<TraversalId>) -> Result<()> {
        self.inner.delete_graphs_except(stack_id, keep).await
    }

    async fn get_sync_point(&self, key: &SyncPointKey) -> Result<Option<SyncPointRecord>> {
        self.inner.get_sync_point(key).await
    }

    async fn create_sync_point(&self, record: &SyncPointRecord) -> Result<CasResult> {
        self.inner.create_sync_point(record).await
    }

    async fn cas_sync_point(&self, record: &SyncPointRecord) -> Result<CasResult> {
        self.inner.cas_sync_point(record).await
    }

    async fn purge_sync_points(&self, stack_id: &str, traversal: TraversalId) -> Result<()> {
        self.inner.purge_sync_points(stack_id, traversal).await
    }

    async fn get_lock(&self, stack_id: &str) -> Result<Option<LockRecord>> {
        self.inner.get_lock(stack_id).await
    }

    async fn cas_lock(
        &self,
        stack_id: &str,
        expected: Option<u64>,
        new: Option<LockRecord>,
    ) -> Result<CasResult> {
        self.inner.cas_lock(stack_id, expected, new).await
    }

    async fn locks_held_by(&self, engine_id: &str) -> Result<Vec<LockRecord>> {
        self.inner.locks_held_by(engine_id).await
    }

    async fn record_heartbeat(&self, engine_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.inner.record_heartbeat(engine_id, at).await
    }

    async fn engine_heartbeat(&self, engine_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.inner.engine_heartbeat(engine_id).await
    }

    async fn append_event(&self, event: &EventRecord) -> Result<u64> {
        self.inner.append_event(event).await
    }

    async fn list_events(&self, stack_id: &str) -> Result<Vec<EventRecord>> {
        self.inner.list_events(stack_id).await
    }
}

fn pair() -> Template {
    TemplateBuilder::new()
        .resource("a", scripted().property("size", json!(1)))
        .resource("b", scripted().property("parent", get_resource("a")))
        .build()
}

#[tokio::test]
async fn worker_error_fails_and_unlocks_the_row_it_held() {
    init_tracing();
    let store = Arc::new(LosesOneWrite::new("a"));
    let plugin = Arc::new(ScriptedPlugin::new());
    let mut registry = PluginRegistry::with_builtins();
    registry.register(plugin.clone());
    let engine = Engine::start(test_config("engine-a"), store.clone(), registry);

    engine
        .create_stack("s", StackRequest::new(pair()))
        .await
        .unwrap();
    let view = with_timeout(engine.wait_until_settled("s")).await.unwrap();
    assert_eq!(view.status, StackStatus::Failed);
    assert_eq!(plugin.count("create", "b"), 0);

    let rows = store.list_resources("s").await.unwrap();
    let a = rows.iter().find(|r| r.name == "a").unwrap();
    assert_eq!(a.status, ResourceStatus::Failed);
    assert!(a.lock.is_none());
    assert!(a.status_reason.contains("lost its row lock"), "{}", a.status_reason);
    let failures = engine.failures("s").await.unwrap();
    assert!(failures.contains_key("a"));

    // The lost write carried the physical id, so the row looks never
    // created; the next update claims it right away and creates again.
    engine
        .update_stack("s", StackRequest::new(pair()))
        .await
        .unwrap();
    let view = with_timeout(engine.wait_until_settled("s")).await.unwrap();
    assert_eq!(view.status, StackStatus::Complete);
    assert_eq!(plugin.count("create", "a"), 2);
    assert_eq!(plugin.count("create", "b"), 1);
    let a = view.resource("a").unwrap();
    assert_eq!(a.status, ResourceStatus::Complete);
    assert_eq!(a.generation, 0);
    engine.shutdown().await.unwrap();
}
