// src/traversal/mod.rs

//! Traversal coordination: per-node state of a traversal and the sync points
//! that gate fan-in.
//!
//! [`state`] is pure (it mutates a [`crate::store::GraphRecord`] in memory);
//! [`sync_point`] talks to the store.

pub mod state;
pub mod sync_point;

pub use state::{
    apply_report, cancel_record, summarize, NodeOutcome, NodeState, Transition, TraversalOutcome,
    TraversalStates,
};
pub use sync_point::{complete_predecessor, SyncOutcome};

/// Upper bound on re-read/re-apply rounds for one conditional write before
/// giving up with [`crate::errors::ConvergeError::ConcurrencyConflict`].
pub const MAX_CAS_RETRIES: usize = 128;
