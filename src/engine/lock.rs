// src/engine/lock.rs

//! Per-stack ownership lease.
//!
//! Acquiring fails fast with [`ConvergeError::StackBusy`] while another live
//! engine owns the stack, and steals the lock once the owner's lease expired
//! or its heartbeat went stale. The lock is re-entrant for the owning engine,
//! which is what lets an update supersede an in-progress one.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::engine::{chrono_duration, EngineContext};
use crate::errors::{ConvergeError, Result};
use crate::store::{CasResult, LockRecord, Store};
use crate::traversal::MAX_CAS_RETRIES;

pub struct StackLock<'a> {
    store: &'a dyn Store,
    engine_id: &'a str,
    lease: Duration,
    liveness_timeout: Duration,
}

impl<'a> StackLock<'a> {
    pub fn new(
        store: &'a dyn Store,
        engine_id: &'a str,
        lease: Duration,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            store,
            engine_id,
            lease,
            liveness_timeout,
        }
    }

    pub fn for_context(ctx: &'a EngineContext) -> Self {
        Self::new(
            ctx.store.as_ref(),
            ctx.engine_id(),
            ctx.config.lock_lease,
            ctx.config.engine_liveness_timeout,
        )
    }

    fn fresh_record(&self, stack_id: &str, acquired_at: DateTime<Utc>) -> LockRecord {
        let now = Utc::now();
        LockRecord {
            stack_id: stack_id.to_string(),
            engine_id: self.engine_id.to_string(),
            acquired_at,
            expires_at: now + chrono_duration(self.lease),
            version: 0,
        }
    }

    /// Take (or renew) ownership of `stack_id`.
    pub async fn acquire(&self, stack_id: &str) -> Result<LockRecord> {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self.store.get_lock(stack_id).await?;

            let (expected, record) = match &current {
                None => (None, self.fresh_record(stack_id, Utc::now())),
                Some(lock) if lock.engine_id == self.engine_id => {
                    (Some(lock.version), self.fresh_record(stack_id, lock.acquired_at))
                }
                Some(lock) => {
                    if self.owner_alive(lock).await? {
                        return Err(ConvergeError::StackBusy {
                            stack: stack_id.to_string(),
                            owner: lock.engine_id.clone(),
                        });
                    }
                    warn!(
                        stack = %stack_id,
                        previous_owner = %lock.engine_id,
                        "stealing stack lock from dead engine"
                    );
                    (Some(lock.version), self.fresh_record(stack_id, Utc::now()))
                }
            };

            match self
                .store
                .cas_lock(stack_id, expected, Some(record.clone()))
                .await?
            {
                CasResult::Success => {
                    debug!(stack = %stack_id, engine = %self.engine_id, "stack lock held");
                    return Ok(record);
                }
                _ => continue,
            }
        }
        Err(ConvergeError::ConcurrencyConflict(format!(
            "stack lock of '{stack_id}'"
        )))
    }

    /// Release the lock if this engine holds it. Returns whether it did.
    pub async fn release(&self, stack_id: &str) -> Result<bool> {
        for _ in 0..MAX_CAS_RETRIES {
            let Some(lock) = self.store.get_lock(stack_id).await? else {
                return Ok(false);
            };
            if lock.engine_id != self.engine_id {
                return Ok(false);
            }
            if self
                .store
                .cas_lock(stack_id, Some(lock.version), None)
                .await?
                .is_success()
            {
                info!(stack = %stack_id, "stack lock released");
                return Ok(true);
            }
        }
        Err(ConvergeError::ConcurrencyConflict(format!(
            "stack lock of '{stack_id}'"
        )))
    }

    /// Extend the lease of every lock this engine holds.
    pub async fn renew_all(&self) -> Result<usize> {
        let mut renewed = 0;
        for lock in self.store.locks_held_by(self.engine_id).await? {
            let record = self.fresh_record(&lock.stack_id, lock.acquired_at);
            let result = self
                .store
                .cas_lock(&lock.stack_id, Some(lock.version), Some(record))
                .await?;
            if result.is_success() {
                renewed += 1;
            }
        }
        Ok(renewed)
    }

    /// A lock's owner is live while its lease holds and its heartbeat is
    /// fresh.
    pub async fn owner_alive(&self, lock: &LockRecord) -> Result<bool> {
        if lock.engine_id == self.engine_id {
            return Ok(true);
        }
        if lock.expires_at <= Utc::now() {
            return Ok(false);
        }
        engine_alive(self.store, &lock.engine_id, self.liveness_timeout).await
    }
}

/// Whether `engine_id` recorded a heartbeat within `timeout`.
pub async fn engine_alive(store: &dyn Store, engine_id: &str, timeout: Duration) -> Result<bool> {
    let Some(last) = store.engine_heartbeat(engine_id).await? else {
        return Ok(false);
    };
    Ok(Utc::now() - last <= chrono_duration(timeout))
}
