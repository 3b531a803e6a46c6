// src/store/mod.rs

//! Persistence collaborator.
//!
//! The engine keeps no shared in-memory graph state: stacks, resource rows,
//! traversal graphs, sync points and locks all live behind [`Store`], and
//! every mutation is a conditional write on the record's `version`. That is
//! what lets several engine processes share one backing store.
//!
//! [`memory::InMemoryStore`] is the implementation used by the CLI and tests.

pub mod memory;
pub mod records;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::{ConvergeError, Result};
use crate::types::TraversalId;

pub use memory::InMemoryStore;
pub use records::{
    CancelRequest, EventRecord, GraphRecord, LockRecord, ResourceId, ResourceRecord, RowLock,
    StackRecord, SyncPointKey, SyncPointRecord,
};

/// Result of a compare-and-swap write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    Success,
    NotFound,
    /// Someone else wrote first; re-read and retry.
    VersionConflict { actual: u64 },
    /// Insert-if-absent found an existing record.
    AlreadyExists,
}

impl CasResult {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Storage abstraction for orchestration state.
///
/// `cas_*` methods take the record as last read: the write succeeds only if
/// the stored version still equals `record.version`, and stores it with the
/// version incremented.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Stacks ---

    /// Insert a new stack. `AlreadyExists` if the id is taken.
    async fn create_stack(&self, stack: &StackRecord) -> Result<CasResult>;

    async fn get_stack(&self, stack_id: &str) -> Result<Option<StackRecord>>;

    async fn cas_stack(&self, stack: &StackRecord) -> Result<CasResult>;

    async fn list_stacks(&self) -> Result<Vec<StackRecord>>;

    // --- Resources ---

    /// Insert a resource row, assigning its id.
    ///
    /// Returns `None` if a row with the same stack, name and generation
    /// already exists.
    async fn insert_resource(&self, resource: &ResourceRecord) -> Result<Option<ResourceId>>;

    async fn get_resource(&self, id: ResourceId) -> Result<Option<ResourceRecord>>;

    /// All rows of a stack ordered by name, then generation.
    async fn list_resources(&self, stack_id: &str) -> Result<Vec<ResourceRecord>>;

    async fn cas_resource(&self, resource: &ResourceRecord) -> Result<CasResult>;

    async fn delete_resource(&self, id: ResourceId) -> Result<()>;

    // --- Traversal graphs ---

    async fn put_graph(&self, graph: &GraphRecord) -> Result<()>;

    async fn get_graph(&self, stack_id: &str, traversal: TraversalId)
    -> Result<Option<GraphRecord>>;

    async fn cas_graph(&self, graph: &GraphRecord) -> Result<CasResult>;

    /// Drop every graph of the stack except `keep`'s.
    async fn delete_graphs_except(&self, stack_id: &str, keep: Option<TraversalId>) -> Result<()>;

    // --- Sync points ---

    async fn get_sync_point(&self, key: &SyncPointKey) -> Result<Option<SyncPointRecord>>;

    /// Insert-if-absent.
    async fn create_sync_point(&self, record: &SyncPointRecord) -> Result<CasResult>;

    async fn cas_sync_point(&self, record: &SyncPointRecord) -> Result<CasResult>;

    /// Drop all sync points of a traversal.
    async fn purge_sync_points(&self, stack_id: &str, traversal: TraversalId) -> Result<()>;

    // --- Stack locks ---

    async fn get_lock(&self, stack_id: &str) -> Result<Option<LockRecord>>;

    /// Replace the lock of `stack_id` if its current version is `expected`
    /// (`None` meaning no lock is held). `new = None` releases it.
    async fn cas_lock(
        &self,
        stack_id: &str,
        expected: Option<u64>,
        new: Option<LockRecord>,
    ) -> Result<CasResult>;

    async fn locks_held_by(&self, engine_id: &str) -> Result<Vec<LockRecord>>;

    // --- Engine liveness ---

    async fn record_heartbeat(&self, engine_id: &str, at: DateTime<Utc>) -> Result<()>;

    async fn engine_heartbeat(&self, engine_id: &str) -> Result<Option<DateTime<Utc>>>;

    // --- Events ---

    async fn append_event(&self, event: &EventRecord) -> Result<u64>;

    async fn list_events(&self, stack_id: &str) -> Result<Vec<EventRecord>>;
}

/// Convenience: stack or `StackNotFound`.
pub async fn require_stack(store: &dyn Store, stack_id: &str) -> Result<StackRecord> {
    store
        .get_stack(stack_id)
        .await?
        .ok_or_else(|| ConvergeError::StackNotFound(stack_id.to_string()))
}
