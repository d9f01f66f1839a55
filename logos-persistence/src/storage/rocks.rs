//! RocksDB-backed update log and meta store.
//!
//! Column families:
//! - `documents`: One registry row per document name (bincode `DocumentRecord`)
//! - `updates`: Update log, keyed by `<name prefix><key: u64 BE>`, LZ4-framed payloads
//! - `meta`: Free-form key/value namespace per document (JSON values)
//!
//! The name prefix is `<len: u32 BE><utf-8 name>`, so names never share a
//! key range and a forward scan from `<prefix><0>` visits one document's log
//! in key order.
//!
//! Every write goes through a single `WriteBatch` while holding the store's
//! write lock. That lock is the only serialization point between sessions
//! that share one `DocumentStore`.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use super::fragment;

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_UPDATES: &str = "updates";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_UPDATES, CF_META];

/// Meta key tags.
const META_TAG_STR: u8 = 1;
const META_TAG_INT: u8 = 2;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_data"),
            block_cache_size: 64 * 1024 * 1024, // 64MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024, // 16MB
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

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("Database error: {0}")]
    Database(String),
    /// Serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Deserialization failed
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    /// A stored update payload could not be unframed
    #[error("Corrupt entry at key {key}: {reason}")]
    CorruptEntry { key: u64, reason: String },
    /// The handle was closed
    #[error("Document handle '{0}' is closed")]
    Closed(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// One row of the update log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEntry {
    /// Store-assigned key, strictly increasing per document, starting at 1
    pub key: u64,
    /// Unframed fragment
    pub payload: Vec<u8>,
}

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Key assigned to the new entry
    pub key: u64,
    /// Highest key that existed before the append
    pub previous_last: Option<u64>,
    /// Live entry count after the append
    pub count: u64,
}

/// Meta namespace key: a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetaKey {
    Str(String),
    Int(i64),
}

impl MetaKey {
    fn encode(&self) -> Vec<u8> {
        match self {
            MetaKey::Str(s) => {
                let mut out = Vec::with_capacity(1 + s.len());
                out.push(META_TAG_STR);
                out.extend_from_slice(s.as_bytes());
                out
            }
            MetaKey::Int(i) => {
                let mut out = Vec::with_capacity(9);
                out.push(META_TAG_INT);
                out.extend_from_slice(&i.to_be_bytes());
                out
            }
        }
    }
}

impl fmt::Display for MetaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaKey::Str(s) => write!(f, "{s:?}"),
            MetaKey::Int(i) => write!(f, "{i}"),
        }
    }
}

impl From<&str> for MetaKey {
    fn from(s: &str) -> Self {
        MetaKey::Str(s.to_string())
    }
}

impl From<String> for MetaKey {
    fn from(s: String) -> Self {
        MetaKey::Str(s)
    }
}

impl From<i64> for MetaKey {
    fn from(i: i64) -> Self {
        MetaKey::Int(i)
    }
}


/// Registry row written the first time a name is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    /// Document name
    pub name: String,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last write timestamp (seconds since epoch)
    pub updated_at: u64,
    /// Number of prefix replacements performed
    pub compactions: u64,
}

impl DocumentRecord {
    fn new(name: &str) -> Self {
        let now = now_secs();
        Self {
            name: name.to_string(),
            created_at: now,
            updated_at: now,
            compactions: 0,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

/// An open document namespace inside a `DocumentStore`.
///
/// Cheap to create; closing it only affects this handle, other sessions
/// holding their own handle on the same name keep working.
#[derive(Debug)]
pub struct DocumentHandle {
    name: String,
    prefix: Vec<u8>,
    open: AtomicBool,
}

impl DocumentHandle {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            prefix: name_prefix(name),
            open: AtomicBool::new(true),
        }
    }

    /// Document name this handle addresses.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether `close` has not been called yet.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::Release);
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(StoreError::Closed(self.name.clone()))
        }
    }

    fn update_key(&self, key: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.prefix.len() + 8);
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(&key.to_be_bytes());
        out
    }

    /// Extract the log key, or `None` if `raw` belongs to another document.
    fn parse_update_key(&self, raw: &[u8]) -> Option<u64> {
        if raw.len() != self.prefix.len() + 8 || !raw.starts_with(&self.prefix) {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&raw[self.prefix.len()..]);
        Some(u64::from_be_bytes(buf))
    }

    fn meta_key(&self, key: &MetaKey) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend_from_slice(&key.encode());
        out
    }
}

/// RocksDB-backed store shared by every session on one database path.
///
/// Provides, per document name:
/// - An append-only update log with store-assigned increasing keys
/// - Atomic prefix replacement for compaction
/// - An independent meta namespace
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode, writes serialized by `write_lock`)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Serializes read-modify-write transactions across sessions
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_UPDATES => {
                // Payloads are already LZ4-framed
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_DOCUMENTS | CF_META => {
                // Small values, point lookups
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup((config.block_cache_size / (1024 * 1024)) as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Namespaces ───────────────────────────────────────────────────

    /// Open the namespaces of a document, creating its registry row if absent.
    ///
    /// Idempotent: opening the same name twice yields two independent
    /// handles over the same data.
    pub fn open_document(&self, name: &str) -> Result<DocumentHandle, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let _guard = self.write_guard();

        if self.db.get_cf(&cf, name.as_bytes())?.is_none() {
            let mut batch = WriteBatch::default();
            batch.put_cf(&cf, name.as_bytes(), DocumentRecord::new(name).encode()?);
            self.write(batch)?;
            log::debug!("Created namespaces for document '{name}'");
        }

        Ok(DocumentHandle::new(name))
    }

    /// Close a handle. Later calls through it fail with `StoreError::Closed`.
    pub fn close(&self, handle: &DocumentHandle) {
        if handle.open.swap(false, Ordering::AcqRel) {
            log::debug!("Closed handle for document '{}'", handle.name);
        }
    }

    /// Check if a document has been opened at least once.
    pub fn document_exists(&self, name: &str) -> Result<bool, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        Ok(self.db.get_cf(&cf, name.as_bytes())?.is_some())
    }

    /// Load the registry row of a document.
    pub fn document_record(&self, name: &str) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db
            .get_cf(&cf, name.as_bytes())?
            .map(|bytes| DocumentRecord::decode(&bytes))
            .transpose()
    }

    /// List all document names in the store.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut names = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            names.push(DocumentRecord::decode(&value)?.name);
        }
        Ok(names)
    }

    /// Delete every update, meta entry and the registry row of a document.
    ///
    /// Open handles on the name stay open and see an empty log afterwards.
    pub fn clear_document(&self, name: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_updates = self.cf(CF_UPDATES)?;
        let cf_meta = self.cf(CF_META)?;
        let prefix = name_prefix(name);

        let _guard = self.write_guard();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_docs, name.as_bytes());

        let mut removed = 0u64;
        for key in self.keys_with_prefix(cf_updates, &prefix)? {
            batch.delete_cf(&cf_updates, &key);
            removed += 1;
        }
        for key in self.keys_with_prefix(cf_meta, &prefix)? {
            batch.delete_cf(&cf_meta, &key);
        }

        self.write(batch)?;
        log::info!("Cleared document '{name}' ({removed} updates removed)");
        Ok(())
    }

    // ─── Update log ───────────────────────────────────────────────────

    /// Append a fragment, assigning it the next key.
    pub fn append(
        &self,
        handle: &DocumentHandle,
        payload: &[u8],
    ) -> Result<AppendOutcome, StoreError> {
        handle.ensure_open()?;
        let cf = self.cf(CF_UPDATES)?;
        let _guard = self.write_guard();

        let previous_last = self.last_key_unlocked(handle)?;
        let key = previous_last.map_or(1, |last| last + 1);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, handle.update_key(key), fragment::encode(payload));
        self.touch_record(&mut batch, handle, false)?;
        self.write(batch)?;

        let count = self.count_unlocked(handle)?;
        Ok(AppendOutcome {
            key,
            previous_last,
            count,
        })
    }

    /// Read the whole log in ascending key order.
    pub fn read_all(&self, handle: &DocumentHandle) -> Result<Vec<UpdateEntry>, StoreError> {
        self.read_since(handle, 0)
    }

    /// Read every entry with `key > cursor`, ascending.
    pub fn read_since(
        &self,
        handle: &DocumentHandle,
        cursor: u64,
    ) -> Result<Vec<UpdateEntry>, StoreError> {
        handle.ensure_open()?;
        self.scan(handle, cursor, u64::MAX)
    }

    /// Read every entry with `key <= upto`, ascending.
    pub fn read_through(
        &self,
        handle: &DocumentHandle,
        upto: u64,
    ) -> Result<Vec<UpdateEntry>, StoreError> {
        handle.ensure_open()?;
        self.scan(handle, 0, upto)
    }

    /// Number of live entries in the log.
    pub fn count(&self, handle: &DocumentHandle) -> Result<u64, StoreError> {
        handle.ensure_open()?;
        self.count_unlocked(handle)
    }

    /// Highest key in the log.
    pub fn last_key(&self, handle: &DocumentHandle) -> Result<Option<u64>, StoreError> {
        handle.ensure_open()?;
        self.last_key_unlocked(handle)
    }

    /// Atomically replace every entry with `key <= upto` by one entry at `upto`.
    ///
    /// Entries above `upto` are never touched, so fragments appended by
    /// another session after the read that chose `upto` survive. Returns
    /// the live entry count after the replacement.
    pub fn replace_prefix(
        &self,
        handle: &DocumentHandle,
        upto: u64,
        merged: &[u8],
    ) -> Result<u64, StoreError> {
        handle.ensure_open()?;
        let cf = self.cf(CF_UPDATES)?;
        let _guard = self.write_guard();

        let start = handle.update_key(0);
        let mut batch = WriteBatch::default();
        let mut removed = 0u64;

        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (raw, _) = item?;
            match handle.parse_update_key(&raw) {
                Some(key) if key <= upto => {
                    batch.delete_cf(&cf, &raw);
                    removed += 1;
                }
                _ => break,
            }
        }

        // Put after the deletes: the batch applies in order, so the key at
        // `upto` ends up holding the merged fragment.
        batch.put_cf(&cf, handle.update_key(upto), fragment::encode(merged));
        self.touch_record(&mut batch, handle, true)?;
        self.write(batch)?;

        let count = self.count_unlocked(handle)?;
        log::debug!(
            "Replaced {removed} entries of '{}' through key {upto} ({count} live)",
            handle.name
        );
        Ok(count)
    }

    // ─── Meta ─────────────────────────────────────────────────────────

    /// Store a meta value (JSON encoded).
    pub fn put_meta<V: Serialize + ?Sized>(
        &self,
        handle: &DocumentHandle,
        key: &MetaKey,
        value: &V,
    ) -> Result<(), StoreError> {
        handle.ensure_open()?;
        let cf = self.cf(CF_META)?;
        let bytes =
            serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, handle.meta_key(key), bytes, &write_opts)?;
        Ok(())
    }

    /// Load a meta value. `Ok(None)` when the key was never set.
    pub fn get_meta<V: DeserializeOwned>(
        &self,
        handle: &DocumentHandle,
        key: &MetaKey,
    ) -> Result<Option<V>, StoreError> {
        handle.ensure_open()?;
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, handle.meta_key(key))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Remove a meta value. Removing an unset key is not an error.
    pub fn delete_meta(&self, handle: &DocumentHandle, key: &MetaKey) -> Result<(), StoreError> {
        handle.ensure_open()?;
        let cf = self.cf(CF_META)?;
        self.db.delete_cf(&cf, handle.meta_key(key))?;
        Ok(())
    }

    // ─── Maintenance ──────────────────────────────────────────────────

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Entries with `after < key <= through`.
    fn scan(
        &self,
        handle: &DocumentHandle,
        after: u64,
        through: u64,
    ) -> Result<Vec<UpdateEntry>, StoreError> {
        let first = match after.checked_add(1) {
            Some(first) if first <= through => first,
            _ => return Ok(Vec::new()),
        };

        let cf = self.cf(CF_UPDATES)?;
        let start = handle.update_key(first);
        let mut entries = Vec::new();

        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (raw, value) = item?;
            let key = match handle.parse_update_key(&raw) {
                Some(key) if key <= through => key,
                _ => break,
            };
            entries.push(UpdateEntry {
                key,
                payload: fragment::decode(key, &value)?,
            });
        }

        Ok(entries)
    }

    fn count_unlocked(&self, handle: &DocumentHandle) -> Result<u64, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let start = handle.update_key(0);
        let mut count = 0u64;
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (raw, _) = item?;
            if handle.parse_update_key(&raw).is_none() {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn last_key_unlocked(&self, handle: &DocumentHandle) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_UPDATES)?;
        let end = handle.update_key(u64::MAX);
        let mut iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&end, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (raw, _) = item?;
                Ok(handle.parse_update_key(&raw))
            }
            None => Ok(None),
        }
    }

    fn keys_with_prefix(
        &self,
        cf: &ColumnFamily,
        prefix: &[u8],
    ) -> Result<Vec<Box<[u8]>>, StoreError> {
        let mut keys = Vec::new();
        for item in self
            .db
            .iterator_cf(&cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (raw, _) = item?;
            if !raw.starts_with(prefix) {
                break;
            }
            keys.push(raw);
        }
        Ok(keys)
    }

    /// Stage a registry update into `batch`.
    fn touch_record(
        &self,
        batch: &mut WriteBatch,
        handle: &DocumentHandle,
        compacted: bool,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut record = self
            .db
            .get_cf(&cf, handle.name.as_bytes())?
            .map(|bytes| DocumentRecord::decode(&bytes))
            .transpose()?
            .unwrap_or_else(|| DocumentRecord::new(&handle.name));
        record.updated_at = now_secs();
        if compacted {
            record.compactions += 1;
        }
        batch.put_cf(&cf, handle.name.as_bytes(), record.encode()?);
        Ok(())
    }
}

/// `<len: u32 BE><name>`.
fn name_prefix(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + name.len());
    out.extend_from_slice(&(name.len() as u32).to_be_bytes());
    out.extend_from_slice(name.as_bytes());
    out
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    /// Create a temp directory for test database.
    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "logos_test_persist_{name}_{}",
            uuid::Uuid::new_v4()
        ))
    }

    /// Clean up test database.
    fn cleanup(path: &Path) {
        let _ = fs::remove_dir_all(path);
    }

    fn open_store(path: &Path) -> DocumentStore {
        DocumentStore::open(StoreConfig::for_testing(path)).unwrap()
    }

    #[test]
    fn test_store_open_close() {
        let path = temp_db_path("open_close");
        let store = open_store(&path);
        assert!(store.path().exists());
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_open_document_is_idempotent() {
        let path = temp_db_path("open_idempotent");
        let store = open_store(&path);

        let a = store.open_document("doc").unwrap();
        store.append(&a, b"one").unwrap();
        let record = store.document_record("doc").unwrap().unwrap();

        let b = store.open_document("doc").unwrap();
        assert_eq!(store.count(&b).unwrap(), 1);
        assert_eq!(store.document_record("doc").unwrap().unwrap().created_at, record.created_at);
        assert_eq!(store.list_documents().unwrap(), vec!["doc".to_string()]);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_append_assigns_increasing_keys() {
        let path = temp_db_path("append");
        let store = open_store(&path);
        let handle = store.open_document("doc").unwrap();

        let first = store.append(&handle, b"a").unwrap();
        let second = store.append(&handle, b"b").unwrap();
        let third = store.append(&handle, b"c").unwrap();

        assert_eq!(first, AppendOutcome { key: 1, previous_last: None, count: 1 });
        assert_eq!(second.key, 2);
        assert_eq!(second.previous_last, Some(1));
        assert_eq!(third.count, 3);

        let all = store.read_all(&handle).unwrap();
        let keys: Vec<u64> = all.iter().map(|e| e.key).collect();
        assert_eq!(keys, vec![1, 2, 3]);
        assert_eq!(all[2].payload, b"c");

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_read_since_and_through() {
        let path = temp_db_path("ranges");
        let store = open_store(&path);
        let handle = store.open_document("doc").unwrap();

        for i in 1..=10u8 {
            store.append(&handle, &[i]).unwrap();
        }

        let since = store.read_since(&handle, 7).unwrap();
        assert_eq!(since.iter().map(|e| e.key).collect::<Vec<_>>(), vec![8, 9, 10]);

        let through = store.read_through(&handle, 3).unwrap();
        assert_eq!(through.iter().map(|e| e.key).collect::<Vec<_>>(), vec![1, 2, 3]);

        assert!(store.read_since(&handle, 10).unwrap().is_empty());
        assert!(store.read_since(&handle, u64::MAX).unwrap().is_empty());
        assert_eq!(store.last_key(&handle).unwrap(), Some(10));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_replace_prefix_keeps_later_entries() {
        let path = temp_db_path("replace");
        let store = open_store(&path);
        let handle = store.open_document("doc").unwrap();

        for i in 1..=6u8 {
            store.append(&handle, &[i]).unwrap();
        }

        let count = store.replace_prefix(&handle, 4, b"merged").unwrap();
        assert_eq!(count, 3);

        let all = store.read_all(&handle).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], UpdateEntry { key: 4, payload: b"merged".to_vec() });
        assert_eq!(all[1].key, 5);
        assert_eq!(all[2].key, 6);

        // Keys keep increasing after a replacement
        assert_eq!(store.append(&handle, b"next").unwrap().key, 7);
        assert_eq!(store.document_record("doc").unwrap().unwrap().compactions, 1);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_replace_whole_log() {
        let path = temp_db_path("replace_all");
        let store = open_store(&path);
        let handle = store.open_document("doc").unwrap();

        for i in 1..=5u8 {
            store.append(&handle, &[i]).unwrap();
        }
        assert_eq!(store.replace_prefix(&handle, 5, b"snapshot").unwrap(), 1);
        assert_eq!(store.read_all(&handle).unwrap()[0].key, 5);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_documents_are_isolated() {
        let path = temp_db_path("isolation");
        let store = open_store(&path);

        // "a" is a byte prefix of "ab"; the length prefix keeps them apart
        let a = store.open_document("a").unwrap();
        let ab = store.open_document("ab").unwrap();

        for i in 0..5u8 {
            store.append(&a, &[i]).unwrap();
        }
        store.append(&ab, b"only").unwrap();
        store.put_meta(&a, &MetaKey::from("k"), &1).unwrap();

        assert_eq!(store.count(&a).unwrap(), 5);
        assert_eq!(store.count(&ab).unwrap(), 1);
        assert_eq!(store.read_all(&ab).unwrap()[0].payload, b"only");
        assert_eq!(store.get_meta::<i32>(&ab, &MetaKey::from("k")).unwrap(), None);

        store.replace_prefix(&a, 5, b"m").unwrap();
        assert_eq!(store.count(&ab).unwrap(), 1);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_meta_roundtrip() {
        let path = temp_db_path("meta");
        let store = open_store(&path);
        let handle = store.open_document("doc").unwrap();

        store.put_meta(&handle, &MetaKey::from("a"), &4).unwrap();
        store.put_meta(&handle, &MetaKey::Int(4), &"meta!").unwrap();

        assert_eq!(store.get_meta::<i32>(&handle, &MetaKey::from("a")).unwrap(), Some(4));
        assert_eq!(
            store.get_meta::<String>(&handle, &MetaKey::Int(4)).unwrap(),
            Some("meta!".to_string())
        );
        // String "4" and integer 4 are different keys
        assert_eq!(store.get_meta::<i32>(&handle, &MetaKey::from("4")).unwrap(), None);

        store.delete_meta(&handle, &MetaKey::from("a")).unwrap();
        assert_eq!(store.get_meta::<i32>(&handle, &MetaKey::from("a")).unwrap(), None);
        store.delete_meta(&handle, &MetaKey::from("never-set")).unwrap();

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_meta_type_mismatch_is_an_error() {
        let path = temp_db_path("meta_mismatch");
        let store = open_store(&path);
        let handle = store.open_document("doc").unwrap();

        store.put_meta(&handle, &MetaKey::from("a"), &"text").unwrap();
        let result = store.get_meta::<u32>(&handle, &MetaKey::from("a"));
        assert!(matches!(result, Err(StoreError::Deserialization(_))));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_closed_handle_rejects_operations() {
        let path = temp_db_path("closed");
        let store = open_store(&path);
        let handle = store.open_document("doc").unwrap();
        let other = store.open_document("doc").unwrap();

        store.close(&handle);
        store.close(&handle);
        assert!(!handle.is_open());
        assert_eq!(
            store.append(&handle, b"x").unwrap_err(),
            StoreError::Closed("doc".to_string())
        );
        assert!(store.get_meta::<i32>(&handle, &MetaKey::from("a")).is_err());

        // Other handles are unaffected
        assert_eq!(store.append(&other, b"x").unwrap().key, 1);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_clear_document() {
        let path = temp_db_path("clear");
        let store = open_store(&path);
        let doc = store.open_document("doc").unwrap();
        let keep = store.open_document("keep").unwrap();

        store.append(&doc, b"1").unwrap();
        store.append(&doc, b"2").unwrap();
        store.put_meta(&doc, &MetaKey::from("m"), &true).unwrap();
        store.append(&keep, b"k").unwrap();

        store.clear_document("doc").unwrap();

        assert!(!store.document_exists("doc").unwrap());
        assert_eq!(store.count(&doc).unwrap(), 0);
        assert_eq!(store.get_meta::<bool>(&doc, &MetaKey::from("m")).unwrap(), None);
        assert_eq!(store.count(&keep).unwrap(), 1);

        // Keys restart once the log is gone
        assert_eq!(store.append(&doc, b"fresh").unwrap().key, 1);

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_log_survives_reopen() {
        let path = temp_db_path("reopen");
        {
            let store = open_store(&path);
            let handle = store.open_document("doc").unwrap();
            store.append(&handle, b"a").unwrap();
            store.append(&handle, b"b").unwrap();
        }
        {
            let store = open_store(&path);
            let handle = store.open_document("doc").unwrap();
            assert_eq!(store.count(&handle).unwrap(), 2);
            assert_eq!(store.append(&handle, b"c").unwrap().key, 3);
        }
        cleanup(&path);
    }

    #[test]
    fn test_corrupt_payload_is_reported() {
        let path = temp_db_path("corrupt");
        let store = open_store(&path);
        let handle = store.open_document("doc").unwrap();
        store.append(&handle, b"fine").unwrap();

        // Write an unframed payload behind the store's back
        let cf = store.cf(CF_UPDATES).unwrap();
        store.db.put_cf(&cf, handle.update_key(2), [1u8, 2]).unwrap();

        let err = store.read_all(&handle).unwrap_err();
        assert!(matches!(err, StoreError::CorruptEntry { key: 2, .. }));

        drop(store);
        cleanup(&path);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.block_cache_size, 64 * 1024 * 1024);
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Closed("doc".into());
        assert!(err.to_string().contains("closed"));

        let err = StoreError::CorruptEntry { key: 9, reason: "bad".into() };
        assert!(err.to_string().contains('9'));
    }
}
