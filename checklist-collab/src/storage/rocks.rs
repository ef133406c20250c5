//! RocksDB-backed item store.
//!
//! Column families (one per [`Collection`]):
//! - `sessions`, `session_index`: presence rows, 24h expiry
//! - `events`: event log, 24h expiry
//! - `operations`: operation log, 7d expiry
//! - `sync_state`: one row per entity, never expires
//! - `templates`, `template_versions`: retained indefinitely
//!
//! Key layout: `<partition bytes> 0x00 <sort bytes>`, so a partition scan is a
//! forward prefix iteration. Values are bincode envelopes of [`StoredItem`].
//!
//! Expired items are hidden from reads and dropped by a compaction filter,
//! so nothing has to sweep them explicitly. Conditional batches are
//! serialized through a writer mutex and committed as one `WriteBatch`.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::compaction_filter::Decision;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{
    next_revision, validate_key, Batch, Collection, ItemKey, Mutation, Store, StoreError,
    StoredItem,
};
use crate::model::now_millis;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("checklist_sync_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

fn encode_envelope(item: &StoredItem) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(item, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode_envelope(bytes: &[u8]) -> Result<StoredItem, StoreError> {
    let (item, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(item)
}

/// Build a raw key: partition, NUL separator, sort.
fn raw_key(partition: &str, sort: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(partition.len() + 1 + sort.len());
    key.extend_from_slice(partition.as_bytes());
    key.push(0);
    key.extend_from_slice(sort.as_bytes());
    key
}

/// RocksDB-backed item store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded CF mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes read-check-write of conditional batches
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Collection::ALL
            .iter()
            .map(|collection| {
                ColumnFamilyDescriptor::new(
                    collection.name(),
                    Self::cf_options(*collection, &config, &cache),
                )
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened item store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(collection: Collection, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match collection {
            Collection::Sessions | Collection::SessionIndex | Collection::SyncState => {
                // Small rows, point lookups
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            Collection::Events | Collection::Operations => {
                // Append-heavy, scanned by entity partition
                opts.set_max_write_buffer_number(4);
            }
            Collection::Templates => {
                opts.set_max_write_buffer_number(2);
            }
            Collection::TemplateVersions => {
                // Snapshots arrive already LZ4-compressed
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
        }

        opts.set_compaction_filter("expired_items", |_level: u32, _key: &[u8], value: &[u8]| {
            match decode_envelope(value) {
                Ok(item) if item.is_expired(now_millis()) => Decision::Remove,
                _ => Decision::Keep,
            }
        });

        opts
    }

    /// Get a column family handle.
    fn cf(&self, collection: Collection) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db.cf_handle(collection.name()).ok_or_else(|| {
            StoreError::DatabaseError(format!("Column family '{}' not found", collection.name()))
        })
    }

    /// Read an item regardless of expiry.
    fn read_raw(&self, collection: Collection, key: &ItemKey) -> Result<Option<StoredItem>, StoreError> {
        let cf = self.cf(collection)?;
        match self.db.get_cf(cf, raw_key(&key.partition, &key.sort))? {
            Some(bytes) => Ok(Some(decode_envelope(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Run compaction over every column family so the expiry filter drops
    /// dead rows now instead of at the next natural compaction.
    pub fn compact(&self) -> Result<(), StoreError> {
        for collection in Collection::ALL {
            let cf = self.cf(collection)?;
            self.db.compact_range_cf(cf, None::<&[u8]>, None::<&[u8]>);
        }
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl Store for RocksStore {
    fn get(&self, collection: Collection, key: &ItemKey) -> Result<Option<StoredItem>, StoreError> {
        let now = now_millis();
        Ok(self.read_raw(collection, key)?.filter(|item| !item.is_expired(now)))
    }

    fn query(
        &self,
        collection: Collection,
        partition: &str,
        sort_prefix: &str,
    ) -> Result<Vec<(String, StoredItem)>, StoreError> {
        let cf = self.cf(collection)?;
        let prefix = raw_key(partition, sort_prefix);
        let sort_offset = partition.len() + 1;
        let now = now_millis();

        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for entry in iter {
            let (key, value) = entry.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let item = decode_envelope(&value)?;
            if item.is_expired(now) {
                continue;
            }
            let sort = String::from_utf8(key[sort_offset..].to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            rows.push((sort, item));
        }
        Ok(rows)
    }

    fn write(&self, batch: Batch) -> Result<(), StoreError> {
        for mutation in batch.mutations() {
            validate_key(mutation.key())?;
        }

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))?;
        let now = now_millis();

        let mut write_batch = WriteBatch::default();
        for mutation in batch.into_mutations() {
            // Conditions see live rows only; revisions continue from the raw row.
            let raw = self.read_raw(mutation.collection(), mutation.key())?;
            let current = raw.as_ref().filter(|item| !item.is_expired(now));
            if !mutation.condition().holds(current) {
                let key = mutation.key();
                return Err(StoreError::ConditionFailed {
                    collection: mutation.collection(),
                    partition: key.partition.clone(),
                    sort: key.sort.clone(),
                });
            }

            match mutation {
                Mutation::Put {
                    collection,
                    key,
                    value,
                    expires_at,
                    ..
                } => {
                    let item = StoredItem {
                        value,
                        revision: next_revision(raw.as_ref()),
                        expires_at,
                    };
                    write_batch.put_cf(
                        self.cf(collection)?,
                        raw_key(&key.partition, &key.sort),
                        encode_envelope(&item)?,
                    );
                }
                Mutation::Delete { collection, key, .. } => {
                    write_batch.delete_cf(self.cf(collection)?, raw_key(&key.partition, &key.sort));
                }
            }
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(write_batch, &write_opts)?;
        Ok(())
    }

    fn purge_expired(&self) -> Result<u64, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))?;
        let now = now_millis();

        let mut removed = 0u64;
        let mut batch = WriteBatch::default();
        for collection in Collection::ALL {
            let cf = self.cf(collection)?;
            for entry in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, value) = entry.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
                if decode_envelope(&value)?.is_expired(now) {
                    batch.delete_cf(cf, &key);
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            self.db.write(batch)?;
        }
        Ok(removed)
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
