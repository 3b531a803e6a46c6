// src/store/memory.rs

//! In-memory [`Store`].
//!
//! Single-process only: state is lost on exit. Conditional writes behave the
//! same way a database-backed store's would, so it is also the store the
//! concurrency tests run against.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{
    CasResult, EventRecord, GraphRecord, LockRecord, ResourceId, ResourceRecord, StackRecord,
    Store, SyncPointKey, SyncPointRecord,
};
use crate::errors::{ConvergeError, Result};
use crate::types::TraversalId;

#[derive(Debug, Default)]
pub struct InMemoryStore {
    stacks: RwLock<BTreeMap<String, StackRecord>>,
    resources: RwLock<Resources>,
    graphs: RwLock<HashMap<(String, TraversalId), GraphRecord>>,
    sync_points: RwLock<HashMap<SyncPointKey, SyncPointRecord>>,
    locks: RwLock<HashMap<String, LockRecord>>,
    heartbeats: RwLock<HashMap<String, DateTime<Utc>>>,
    events: RwLock<Events>,
}

#[derive(Debug, Default)]
struct Resources {
    next_id: ResourceId,
    rows: BTreeMap<ResourceId, ResourceRecord>,
}

#[derive(Debug, Default)]
struct Events {
    next_id: u64,
    rows: Vec<EventRecord>,
}

fn poison_err<T>(_: PoisonError<T>) -> ConvergeError {
    ConvergeError::storage("lock poisoned")
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sync point records currently stored (for all stacks).
    pub fn sync_point_count(&self) -> Result<usize> {
        let count = self.sync_points.read().map_err(poison_err)?.len();
        Ok(count)
    }

    /// Number of traversal graphs currently stored for a stack.
    pub fn graph_count(&self, stack_id: &str) -> Result<usize> {
        let graphs = self.graphs.read().map_err(poison_err)?;
        Ok(graphs.keys().filter(|(s, _)| s == stack_id).count())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_stack(&self, stack: &StackRecord) -> Result<CasResult> {
        let mut stacks = self.stacks.write().map_err(poison_err)?;
        if stacks.contains_key(&stack.id) {
            return Ok(CasResult::AlreadyExists);
        }
        stacks.insert(stack.id.clone(), stack.clone());
        Ok(CasResult::Success)
    }

    async fn get_stack(&self, stack_id: &str) -> Result<Option<StackRecord>> {
        let stacks = self.stacks.read().map_err(poison_err)?;
        Ok(stacks.get(stack_id).cloned())
    }

    async fn cas_stack(&self, stack: &StackRecord) -> Result<CasResult> {
        let mut stacks = self.stacks.write().map_err(poison_err)?;
        let Some(stored) = stacks.get_mut(&stack.id) else {
            return Ok(CasResult::NotFound);
        };
        if stored.version != stack.version {
            return Ok(CasResult::VersionConflict {
                actual: stored.version,
            });
        }
        let mut next = stack.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *stored = next;
        Ok(CasResult::Success)
    }

    async fn list_stacks(&self) -> Result<Vec<StackRecord>> {
        let stacks = self.stacks.read().map_err(poison_err)?;
        Ok(stacks.values().cloned().collect())
    }

    async fn insert_resource(&self, resource: &ResourceRecord) -> Result<Option<ResourceId>> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        let duplicate = resources.rows.values().any(|r| {
            r.stack_id == resource.stack_id
                && r.name == resource.name
                && r.generation == resource.generation
        });
        if duplicate {
            return Ok(None);
        }
        resources.next_id += 1;
        let id = resources.next_id;
        let mut row = resource.clone();
        row.id = id;
        row.version = 0;
        resources.rows.insert(id, row);
        Ok(Some(id))
    }

    async fn get_resource(&self, id: ResourceId) -> Result<Option<ResourceRecord>> {
        let resources = self.resources.read().map_err(poison_err)?;
        Ok(resources.rows.get(&id).cloned())
    }

    async fn list_resources(&self, stack_id: &str) -> Result<Vec<ResourceRecord>> {
        let resources = self.resources.read().map_err(poison_err)?;
        let mut rows: Vec<ResourceRecord> = resources
            .rows
            .values()
            .filter(|r| r.stack_id == stack_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name).then(a.generation.cmp(&b.generation)));
        Ok(rows)
    }

    async fn cas_resource(&self, resource: &ResourceRecord) -> Result<CasResult> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        let Some(stored) = resources.rows.get_mut(&resource.id) else {
            return Ok(CasResult::NotFound);
        };
        if stored.version != resource.version {
            return Ok(CasResult::VersionConflict {
                actual: stored.version,
            });
        }
        let mut next = resource.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        *stored = next;
        Ok(CasResult::Success)
    }

    async fn delete_resource(&self, id: ResourceId) -> Result<()> {
        let mut resources = self.resources.write().map_err(poison_err)?;
        resources.rows.remove(&id);
        Ok(())
    }

    async fn put_graph(&self, graph: &GraphRecord) -> Result<()> {
        let mut graphs = self.graphs.write().map_err(poison_err)?;
        graphs.insert((graph.stack_id.clone(), graph.traversal), graph.clone());
        Ok(())
    }

    async fn get_graph(
        &self,
        stack_id: &str,
        traversal: TraversalId,
    ) -> Result<Option<GraphRecord>> {
        let graphs = self.graphs.read().map_err(poison_err)?;
        Ok(graphs.get(&(stack_id.to_string(), traversal)).cloned())
    }

    async fn cas_graph(&self, graph: &GraphRecord) -> Result<CasResult> {
        let mut graphs = self.graphs.write().map_err(poison_err)?;
        let Some(stored) = graphs.get_mut(&(graph.stack_id.clone(), graph.traversal)) else {
            return Ok(CasResult::NotFound);
        };
        if stored.version != graph.version {
            return Ok(CasResult::VersionConflict {
                actual: stored.version,
            });
        }
        let mut next = graph.clone();
        next.version += 1;
        *stored = next;
        Ok(CasResult::Success)
    }

    async fn delete_graphs_except(&self, stack_id: &str, keep: Option<TraversalId>) -> Result<()> {
        let mut graphs = self.graphs.write().map_err(poison_err)?;
        graphs.retain(|(s, t), _| s != stack_id || Some(*t) == keep);
        Ok(())
    }

    async fn get_sync_point(&self, key: &SyncPointKey) -> Result<Option<SyncPointRecord>> {
        let points = self.sync_points.read().map_err(poison_err)?;
        Ok(points.get(key).cloned())
    }

    async fn create_sync_point(&self, record: &SyncPointRecord) -> Result<CasResult> {
        let mut points = self.sync_points.write().map_err(poison_err)?;
        if points.contains_key(&record.key) {
            return Ok(CasResult::AlreadyExists);
        }
        let mut row = record.clone();
        row.version = 0;
        points.insert(record.key.clone(), row);
        Ok(CasResult::Success)
    }

    async fn cas_sync_point(&self, record: &SyncPointRecord) -> Result<CasResult> {
        let mut points = self.sync_points.write().map_err(poison_err)?;
        let Some(stored) = points.get_mut(&record.key) else {
            return Ok(CasResult::NotFound);
        };
        if stored.version != record.version {
            return Ok(CasResult::VersionConflict {
                actual: stored.version,
            });
        }
        let mut next = record.clone();
        next.version += 1;
        *stored = next;
        Ok(CasResult::Success)
    }

    async fn purge_sync_points(&self, stack_id: &str, traversal: TraversalId) -> Result<()> {
        let mut points = self.sync_points.write().map_err(poison_err)?;
        points.retain(|k, _| k.stack_id != stack_id || k.traversal != traversal);
        Ok(())
    }

    async fn get_lock(&self, stack_id: &str) -> Result<Option<LockRecord>> {
        let locks = self.locks.read().map_err(poison_err)?;
        Ok(locks.get(stack_id).cloned())
    }

    async fn cas_lock(
        &self,
        stack_id: &str,
        expected: Option<u64>,
        new: Option<LockRecord>,
    ) -> Result<CasResult> {
        let mut locks = self.locks.write().map_err(poison_err)?;
        let actual = locks.get(stack_id).map(|l| l.version);
        if actual != expected {
            return Ok(CasResult::VersionConflict {
                actual: actual.unwrap_or(0),
            });
        }
        match new {
            Some(mut lock) => {
                lock.version = expected.map(|v| v + 1).unwrap_or(0);
                locks.insert(stack_id.to_string(), lock);
            }
            None => {
                locks.remove(stack_id);
            }
        }
        Ok(CasResult::Success)
    }

    async fn locks_held_by(&self, engine_id: &str) -> Result<Vec<LockRecord>> {
        let locks = self.locks.read().map_err(poison_err)?;
        let mut held: Vec<LockRecord> = locks
            .values()
            .filter(|l| l.engine_id == engine_id)
            .cloned()
            .collect();
        held.sort_by(|a, b| a.stack_id.cmp(&b.stack_id));
        Ok(held)
    }

    async fn record_heartbeat(&self, engine_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut beats = self.heartbeats.write().map_err(poison_err)?;
        beats.insert(engine_id.to_string(), at);
        Ok(())
    }

    async fn engine_heartbeat(&self, engine_id: &str) -> Result<Option<DateTime<Utc>>> {
        let beats = self.heartbeats.read().map_err(poison_err)?;
        Ok(beats.get(engine_id).copied())
    }

    async fn append_event(&self, event: &EventRecord) -> Result<u64> {
        let mut events = self.events.write().map_err(poison_err)?;
        events.next_id += 1;
        let id = events.next_id;
        let mut row = event.clone();
        row.id = id;
        events.rows.push(row);
        Ok(id)
    }

    async fn list_events(&self, stack_id: &str) -> Result<Vec<EventRecord>> {
        let events = self.events.read().map_err(poison_err)?;
        Ok(events
            .rows
            .iter()
            .filter(|e| e.stack_id == stack_id)
            .cloned()
            .collect())
    }
}
