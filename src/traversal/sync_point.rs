// src/traversal/sync_point.rs

//! Fan-in gate for one node of one traversal.
//!
//! A predecessor completing adds itself to the node's sync point. The
//! conditional write that makes the satisfied set cover every predecessor also
//! flips `triggered`, so exactly one writer ever observes the node becoming
//! ready, however many completions race on the record.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::dag::{InputData, NodeKey, ResourceData};
use crate::errors::{ConvergeError, Result};
use crate::store::{CasResult, Store, SyncPointKey, SyncPointRecord};

use super::MAX_CAS_RETRIES;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Still waiting on other predecessors.
    Waiting { remaining: usize },
    /// This call satisfied the last predecessor.
    Triggered(InputData),
    /// Triggered earlier (a redelivered completion).
    AlreadyTriggered(InputData),
}

impl SyncOutcome {
    pub fn input(&self) -> Option<&InputData> {
        match self {
            SyncOutcome::Waiting { .. } => None,
            SyncOutcome::Triggered(input) | SyncOutcome::AlreadyTriggered(input) => Some(input),
        }
    }
}

/// Record that `predecessor` completed for the node identified by `key`.
///
/// `required` is the node's full predecessor set in this traversal. `data`
/// is what an update predecessor passes on; cleanup predecessors pass `None`.
/// Conflicting writes are retried against the freshest record.
pub async fn complete_predecessor(
    store: &dyn Store,
    key: &SyncPointKey,
    predecessor: &NodeKey,
    data: Option<&ResourceData>,
    required: &BTreeSet<NodeKey>,
) -> Result<SyncOutcome> {
    for round in 0..MAX_CAS_RETRIES {
        let existing = store.get_sync_point(key).await?;
        let creating = existing.is_none();
        let mut record = existing.unwrap_or_else(|| SyncPointRecord::new(key.clone()));

        if record.triggered {
            return Ok(SyncOutcome::AlreadyTriggered(record.input));
        }

        let newly_satisfied = record.satisfied.insert(predecessor.clone());
        if let Some(data) = data {
            record
                .input
                .insert(predecessor.resource.clone(), data.clone());
        }

        let remaining = required.difference(&record.satisfied).count();
        if !newly_satisfied && remaining > 0 {
            return Ok(SyncOutcome::Waiting { remaining });
        }
        record.triggered = remaining == 0;

        let result = if creating {
            store.create_sync_point(&record).await?
        } else {
            store.cas_sync_point(&record).await?
        };

        match result {
            CasResult::Success if record.triggered => {
                debug!(node = %key.node, traversal = %key.traversal, "sync point triggered");
                return Ok(SyncOutcome::Triggered(record.input));
            }
            CasResult::Success => {
                trace!(node = %key.node, from = %predecessor, remaining, "sync point advanced");
                return Ok(SyncOutcome::Waiting { remaining });
            }
            CasResult::NotFound => {
                // Purged together with its traversal.
                return Ok(SyncOutcome::Waiting { remaining });
            }
            CasResult::VersionConflict { .. } | CasResult::AlreadyExists => {
                trace!(node = %key.node, round, "sync point write conflict; retrying");
            }
        }
    }

    Err(ConvergeError::ConcurrencyConflict(format!(
        "sync point {} of traversal {}",
        key.node, key.traversal
    )))
}
