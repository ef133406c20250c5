//! Authoritative per-entity version record and the compare-and-swap loop
//! every mutator of shared rows goes through.
//!
//! A writer reads the row (remembering its store revision), computes the
//! successor, and commits conditioned on that revision. If another writer
//! got there first the store rejects the batch and the whole
//! read-modify-write cycle runs again, up to [`RetryPolicy::max_retries`].

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::error::SyncError;
use crate::model::{EntityRef, SyncState};
use crate::storage::{Collection, Condition, ItemKey, Store};

const STATE_SORT: &str = "state";

/// Bounded retry for optimistic-concurrency conflicts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Linear backoff step between attempts
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 8,
            backoff: Duration::from_millis(5),
        }
    }
}

impl RetryPolicy {
    /// Run `attempt` until it succeeds, fails with a non-conflict error, or
    /// the retry budget is spent (then `SyncError::Conflict`).
    pub async fn run<T, F>(&self, what: &str, mut attempt: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Result<T, SyncError>,
    {
        let mut retries = 0u32;
        loop {
            match attempt() {
                Err(SyncError::Conflict(reason)) => {
                    if retries >= self.max_retries {
                        log::warn!("{what}: giving up after {} attempts ({reason})", retries + 1);
                        return Err(SyncError::Conflict(format!(
                            "{what} lost {} concurrent update races",
                            retries + 1
                        )));
                    }
                    retries += 1;
                    log::debug!("{what}: write conflict, retry {retries}/{}", self.max_retries);
                    tokio::time::sleep(self.backoff * retries).await;
                }
                other => return other,
            }
        }
    }
}

/// Chain a BLAKE3 digest over the previous checksum and a canonical JSON
/// payload. Returns lowercase hex.
pub fn chain_checksum(previous: &str, payload: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(previous.as_bytes());
    hasher.update(&[0]);
    // serde_json maps are key-ordered, so this encoding is canonical.
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

/// Sync state as read, with the condition a successor write must carry.
#[derive(Debug, Clone)]
pub struct StateRead {
    pub state: Option<SyncState>,
    pub condition: Condition,
}

impl StateRead {
    pub fn version(&self) -> u64 {
        self.state.as_ref().map_or(0, |s| s.version)
    }

    pub fn checksum(&self) -> &str {
        self.state.as_ref().map_or("", |s| s.checksum.as_str())
    }

    pub fn operation_count(&self) -> u64 {
        self.state.as_ref().map_or(0, |s| s.operation_count)
    }
}

/// Reads and stages writes of the per-entity [`SyncState`] row.
pub struct SyncStateTracker {
    store: Arc<dyn Store>,
}

impl SyncStateTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub(crate) fn key(entity: &EntityRef) -> ItemKey {
        ItemKey::new(entity.room_id(), STATE_SORT)
    }

    /// Direct read, no side effects.
    pub fn get_sync_state(&self, entity: &EntityRef) -> Result<Option<SyncState>, SyncError> {
        Ok(self.read(entity)?.state)
    }

    /// Current version, 0 for an entity that was never edited.
    pub fn current_version(&self, entity: &EntityRef) -> Result<u64, SyncError> {
        Ok(self.read(entity)?.version())
    }

    /// Read the row together with the CAS condition for its successor.
    pub fn read(&self, entity: &EntityRef) -> Result<StateRead, SyncError> {
        let item = self.store.get(Collection::SyncState, &Self::key(entity))?;
        let state = item.as_ref().map(|i| i.decode::<SyncState>()).transpose()?;
        Ok(StateRead {
            state,
            condition: Condition::matching(item.as_ref()),
        })
    }
}
