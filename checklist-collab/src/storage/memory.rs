//! In-process store backed by ordered maps.
//!
//! Used by tests and single-instance deployments. Expired items are hidden
//! from reads immediately and dropped by an amortized sweep every
//! [`SWEEP_EVERY_WRITES`] batches.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{
    next_revision, validate_key, Batch, Collection, ItemKey, Mutation, Store, StoreError,
    StoredItem,
};
use crate::model::now_millis;

type Table = BTreeMap<ItemKey, StoredItem>;

pub const SWEEP_EVERY_WRITES: u64 = 256;

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Collection, Table>>,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Collection, Table>>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::DatabaseError("memory store lock poisoned".into()))
    }

    /// Number of items physically held, expired or not.
    pub fn raw_len(&self, collection: Collection) -> usize {
        self.lock()
            .map(|tables| tables.get(&collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }
}

fn live<'a>(table: Option<&'a Table>, key: &ItemKey, now: u64) -> Option<&'a StoredItem> {
    table?.get(key).filter(|item| !item.is_expired(now))
}

impl Store for MemoryStore {
    fn get(&self, collection: Collection, key: &ItemKey) -> Result<Option<StoredItem>, StoreError> {
        let tables = self.lock()?;
        Ok(live(tables.get(&collection), key, now_millis()).cloned())
    }

    fn query(
        &self,
        collection: Collection,
        partition: &str,
        sort_prefix: &str,
    ) -> Result<Vec<(String, StoredItem)>, StoreError> {
        let tables = self.lock()?;
        let Some(table) = tables.get(&collection) else {
            return Ok(Vec::new());
        };
        let now = now_millis();
        let start = ItemKey::new(partition, sort_prefix);
        Ok(table
            .range(start..)
            .take_while(|(key, _)| key.partition == partition && key.sort.starts_with(sort_prefix))
            .filter(|(_, item)| !item.is_expired(now))
            .map(|(key, item)| (key.sort.clone(), item.clone()))
            .collect())
    }

    fn write(&self, batch: Batch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        for mutation in batch.mutations() {
            validate_key(mutation.key())?;
        }

        let mut tables = self.lock()?;
        let now = now_millis();

        // Check every precondition before touching anything.
        for mutation in batch.mutations() {
            let current = live(tables.get(&mutation.collection()), mutation.key(), now);
            if !mutation.condition().holds(current) {
                let key = mutation.key();
                return Err(StoreError::ConditionFailed {
                    collection: mutation.collection(),
                    partition: key.partition.clone(),
                    sort: key.sort.clone(),
                });
            }
        }

        for mutation in batch.into_mutations() {
            match mutation {
                Mutation::Put {
                    collection,
                    key,
                    value,
                    expires_at,
                    ..
                } => {
                    let table = tables.entry(collection).or_default();
                    let revision = next_revision(table.get(&key));
                    table.insert(
                        key,
                        StoredItem {
                            value,
                            revision,
                            expires_at,
                        },
                    );
                }
                Mutation::Delete { collection, key, .. } => {
                    if let Some(table) = tables.get_mut(&collection) {
                        table.remove(&key);
                    }
                }
            }
        }

        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY_WRITES == SWEEP_EVERY_WRITES - 1 {
            for table in tables.values_mut() {
                table.retain(|_, item| !item.is_expired(now));
            }
        }
        Ok(())
    }

    fn purge_expired(&self) -> Result<u64, StoreError> {
        let mut tables = self.lock()?;
        let now = now_millis();
        let mut removed = 0u64;
        for table in tables.values_mut() {
            let before = table.len();
            table.retain(|_, item| !item.is_expired(now));
            removed += (before - table.len()) as u64;
        }
        Ok(removed)
    }
}
