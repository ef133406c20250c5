//! Persistent item store for sessions, events, operations, sync state and
//! template history.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐   Batch (conditional, atomic)   ┌──────────────┐
//! │ SessionRegistry│ ──────────────────────────────► │ dyn Store    │
//! │ OperationApplier│                                │              │
//! │ EventLog       │ ◄────── get / query ─────────── │ MemoryStore  │
//! │ VersionManager │                                 │ RocksStore   │
//! └────────────────┘                                 └──────────────┘
//! ```
//!
//! Items are addressed by `(collection, partition, sort)`. Every put bumps
//! the item's `revision`, which is what conditional writes compare against.
//! Items carrying `expires_at` vanish from reads once that instant passes
//! and are physically dropped by the backend without a caller-driven sweep.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::model::now_millis;

/// Logical collections. Each maps to one RocksDB column family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
    Sessions,
    SessionIndex,
    Events,
    Operations,
    SyncState,
    Templates,
    TemplateVersions,
}

impl Collection {
    pub const ALL: [Collection; 7] = [
        Collection::Sessions,
        Collection::SessionIndex,
        Collection::Events,
        Collection::Operations,
        Collection::SyncState,
        Collection::Templates,
        Collection::TemplateVersions,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Collection::Sessions => "sessions",
            Collection::SessionIndex => "session_index",
            Collection::Events => "events",
            Collection::Operations => "operations",
            Collection::SyncState => "sync_state",
            Collection::Templates => "templates",
            Collection::TemplateVersions => "template_versions",
        }
    }
}

/// `(partition, sort)` address within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemKey {
    pub partition: String,
    pub sort: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

/// Stored value plus store-managed metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredItem {
    pub value: Vec<u8>,
    /// Incremented on every put; 1 for a freshly created item
    pub revision: u64,
    /// Expiry instant in epoch millis (None = retained indefinitely)
    pub expires_at: Option<u64>,
}

impl StoredItem {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Decode the JSON record body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_slice(&self.value)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))
    }
}

/// Encode a record body as JSON.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(record).map_err(|e| StoreError::SerializationError(e.to_string()))
}

/// Precondition attached to a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Always,
    /// No live item at the key
    Absent,
    /// A live item exists at the key
    Present,
    /// The live item's revision equals this value
    Revision(u64),
}

impl Condition {
    /// `Revision(r)` when an item was read, `Absent` otherwise.
    pub fn matching(current: Option<&StoredItem>) -> Self {
        match current {
            Some(item) => Condition::Revision(item.revision),
            None => Condition::Absent,
        }
    }

    pub fn holds(&self, current: Option<&StoredItem>) -> bool {
        match (self, current) {
            (Condition::Always, _) => true,
            (Condition::Absent, None) => true,
            (Condition::Present, Some(_)) => true,
            (Condition::Revision(expected), Some(item)) => item.revision == *expected,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Mutation {
    Put {
        collection: Collection,
        key: ItemKey,
        value: Vec<u8>,
        expires_at: Option<u64>,
        condition: Condition,
    },
    Delete {
        collection: Collection,
        key: ItemKey,
        condition: Condition,
    },
}

impl Mutation {
    pub fn collection(&self) -> Collection {
        match self {
            Mutation::Put { collection, .. } | Mutation::Delete { collection, .. } => *collection,
        }
    }

    pub fn key(&self) -> &ItemKey {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key, .. } => key,
        }
    }

    pub fn condition(&self) -> Condition {
        match self {
            Mutation::Put { condition, .. } | Mutation::Delete { condition, .. } => *condition,
        }
    }
}

/// Set of mutations committed all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    mutations: Vec<Mutation>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        mut self,
        collection: Collection,
        key: ItemKey,
        value: Vec<u8>,
        expires_at: Option<u64>,
        condition: Condition,
    ) -> Self {
        self.mutations.push(Mutation::Put {
            collection,
            key,
            value,
            expires_at,
            condition,
        });
        self
    }

    pub fn delete(mut self, collection: Collection, key: ItemKey, condition: Condition) -> Self {
        self.mutations.push(Mutation::Delete {
            collection,
            key,
            condition,
        });
        self
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Backend internal error
    DatabaseError(String),
    /// A mutation's precondition did not hold; nothing was written
    ConditionFailed {
        collection: Collection,
        partition: String,
        sort: String,
    },
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::ConditionFailed {
                collection,
                partition,
                sort,
            } => write!(
                f,
                "Condition failed on {}/{partition}/{sort}",
                collection.name()
            ),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Document store addressed by partition + sort key with conditional
/// writes, per-item expiry and partition range queries.
pub trait Store: Send + Sync {
    /// Read one live item.
    fn get(&self, collection: Collection, key: &ItemKey) -> Result<Option<StoredItem>, StoreError>;

    /// Live items of a partition whose sort key starts with `sort_prefix`,
    /// ascending by sort key.
    fn query(
        &self,
        collection: Collection,
        partition: &str,
        sort_prefix: &str,
    ) -> Result<Vec<(String, StoredItem)>, StoreError>;

    /// Apply every mutation or none of them.
    fn write(&self, batch: Batch) -> Result<(), StoreError>;

    /// Physically drop expired items now. Returns the number removed.
    fn purge_expired(&self) -> Result<u64, StoreError>;

    /// Single conditional put.
    fn put(
        &self,
        collection: Collection,
        key: ItemKey,
        value: Vec<u8>,
        expires_at: Option<u64>,
        condition: Condition,
    ) -> Result<(), StoreError> {
        self.write(Batch::new().put(collection, key, value, expires_at, condition))
    }

    /// Single conditional delete.
    fn delete(
        &self,
        collection: Collection,
        key: ItemKey,
        condition: Condition,
    ) -> Result<(), StoreError> {
        self.write(Batch::new().delete(collection, key, condition))
    }
}

/// Expiry instant `ttl_ms` from now.
pub fn expiry_after(ttl_ms: u64) -> u64 {
    now_millis().saturating_add(ttl_ms)
}

/// Reject keys that would collide with the backend key encoding.
pub(crate) fn validate_key(key: &ItemKey) -> Result<(), StoreError> {
    if key.partition.contains('\0') || key.sort.contains('\0') {
        return Err(StoreError::SerializationError(format!(
            "key contains NUL byte: {:?}/{:?}",
            key.partition, key.sort
        )));
    }
    Ok(())
}

/// Revision a put assigns given the item currently at the key.
pub(crate) fn next_revision(current: Option<&StoredItem>) -> u64 {
    current.map_or(1, |item| item.revision + 1)
}
