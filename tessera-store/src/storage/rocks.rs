//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `metadata`    — per-id revision tree and winner (bincode)
//! - `revisions`   — revision bodies (JSON, LZ4 compressed, keyed by `id\0rev`)
//! - `local`       — `_local/` documents (JSON)
//! - `attachments` — reference count per stored attachment file
//! - `meta`        — store-wide counters (`doc_count`, `update_seq`)
//!
//! Every revision write is one atomic batch: metadata, body, removal of
//! stemmed bodies, attachment reference counts and counters land together.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde_json::{Map, Value};
use tessera_core::{DocError, DocOk, DocumentData, DocumentMetadata, RevId};

use super::memory::full_doc;
use super::StoreError;
use crate::all_docs::{AllDocsRow, AllDocsSource, PointQuery, PointResult, RowValue};
use crate::backend::{DocBackend, DocWrite, LocalStore, WriteReceipt};
use crate::local;

/// Column family names.
const CF_METADATA: &str = "metadata";
const CF_REVISIONS: &str = "revisions";
const CF_LOCAL: &str = "local";
const CF_ATTACHMENTS: &str = "attachments";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_METADATA, CF_REVISIONS, CF_LOCAL, CF_ATTACHMENTS, CF_META];

const KEY_DOC_COUNT: &[u8] = b"doc_count";
const KEY_UPDATE_SEQ: &[u8] = b"update_seq";

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
            path: PathBuf::from("tessera_data"),
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
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

fn encode_metadata(meta: &DocumentMetadata) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(meta, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode_metadata(bytes: &[u8]) -> Result<DocumentMetadata, StoreError> {
    let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(meta)
}

/// Body key: `<id bytes><0x00><rev text>`.
fn body_key(id: &str, rev: &RevId) -> Vec<u8> {
    let rev = rev.to_string();
    let mut key = Vec::with_capacity(id.len() + 1 + rev.len());
    key.extend_from_slice(id.as_bytes());
    key.push(0);
    key.extend_from_slice(rev.as_bytes());
    key
}

/// RocksDB-backed document store.
///
/// Implements [`DocBackend`], [`LocalStore`] and [`AllDocsSource`].
pub struct DocumentStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    /// Store configuration
    config: StoreConfig,
    /// Live (non-deleted) documents
    doc_count: AtomicI64,
    /// Sequence of the last committed revision write
    update_seq: AtomicU64,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl DocumentStore {
    /// Open the document store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024); // 128MB WAL limit
        db_opts.increase_parallelism(num_cpus());

        // Build column family descriptors with per-CF options
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let cf_opts = Self::cf_options(name, &config);
                ColumnFamilyDescriptor::new(*name, cf_opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let store = Self {
            db,
            config,
            doc_count: AtomicI64::new(0),
            update_seq: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        };
        let doc_count = store.read_counter(KEY_DOC_COUNT)?.map_or(0, i64::from_be_bytes);
        let update_seq = store.read_counter(KEY_UPDATE_SEQ)?.map_or(0, u64::from_be_bytes);
        store.doc_count.store(doc_count, Ordering::SeqCst);
        store.update_seq.store(update_seq, Ordering::SeqCst);
        log::info!(
            "Opened document store at {} ({doc_count} docs, seq {update_seq})",
            store.config.path.display()
        );
        Ok(store)
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        // Block-based table with bloom filter and cache
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_METADATA | CF_LOCAL | CF_ATTACHMENTS => {
                // Small values, point lookups by key
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_REVISIONS => {
                // Bodies are already LZ4 compressed
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::None);
            }
            CF_META => {
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    fn read_counter<const N: usize>(&self, key: &[u8]) -> Result<Option<[u8; N]>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => {
                let buf: [u8; N] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::DeserializationError(format!(
                        "Counter {} has {} bytes",
                        String::from_utf8_lossy(key),
                        bytes.len()
                    ))
                })?;
                Ok(Some(buf))
            }
            None => Ok(None),
        }
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Load the stored metadata of `id`.
    pub fn load_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => decode_metadata(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Load the body of one revision (LZ4 decompressed).
    pub fn load_body(&self, id: &str, rev: &RevId) -> Result<Option<DocumentData>, StoreError> {
        self.load_body_at(&body_key(id, rev))
    }

    fn load_body_at(&self, key: &[u8]) -> Result<Option<DocumentData>, StoreError> {
        let cf = self.cf(CF_REVISIONS)?;
        let Some(compressed) = self.db.get_cf(cf, key)? else {
            return Ok(None);
        };
        let raw = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let data = serde_json::from_slice(&raw)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(data))
    }

    /// Persist one resolved revision in a single atomic batch.
    pub fn store_revision(&self, write: &DocWrite) -> Result<WriteReceipt, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_revs = self.cf(CF_REVISIONS)?;
        let cf_atts = self.cf(CF_ATTACHMENTS)?;
        let cf_counters = self.cf(CF_META)?;

        let meta = &write.doc.metadata;
        let mut batch = WriteBatch::default();
        let mut ref_changes: BTreeMap<String, i64> = BTreeMap::new();

        let key = body_key(&meta.id, &meta.rev);
        // a fresh id has no stored bodies to collide with
        if !write.is_update || self.db.get_cf(cf_revs, &key)?.is_none() {
            let body = serde_json::to_vec(&write.doc.data)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            batch.put_cf(cf_revs, &key, lz4_flex::compress_prepend_size(&body));
            for file in write.doc.data.attachment_files() {
                *ref_changes.entry(file).or_default() += 1;
            }
        }

        for rev in &meta.stemmed_revs {
            let key = body_key(&meta.id, rev);
            if let Some(old) = self.load_body_at(&key)? {
                for file in old.attachment_files() {
                    *ref_changes.entry(file).or_default() -= 1;
                }
                batch.delete_cf(cf_revs, &key);
            }
        }

        let mut orphaned = Vec::new();
        for (file, change) in ref_changes {
            let current = self.attachment_refs(&file)? as i64;
            let next = current + change;
            if next <= 0 {
                batch.delete_cf(cf_atts, file.as_bytes());
                if current > 0 {
                    orphaned.push(file);
                }
            } else {
                batch.put_cf(cf_atts, file.as_bytes(), (next as u64).to_be_bytes());
            }
        }

        batch.put_cf(cf_meta, meta.id.as_bytes(), encode_metadata(&write.stored_metadata())?);

        let seq = self.update_seq.load(Ordering::SeqCst) + 1;
        let doc_count = self.doc_count.load(Ordering::SeqCst) + write.delta;
        batch.put_cf(cf_counters, KEY_UPDATE_SEQ, seq.to_be_bytes());
        batch.put_cf(cf_counters, KEY_DOC_COUNT, doc_count.to_be_bytes());

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        self.update_seq.store(seq, Ordering::SeqCst);
        self.doc_count.store(doc_count, Ordering::SeqCst);
        log::trace!(
            "Stored {} {}{} at seq {seq}",
            meta.id,
            meta.rev,
            if write.rev_deleted { " (deleted)" } else { "" }
        );

        Ok(WriteReceipt {
            seq,
            orphaned_attachments: orphaned,
        })
    }

    /// List every document id with stored metadata.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();

        let iter = self.db.iterator_cf(cf, IteratorMode::Start);
        for item in iter {
            let (key, _) = item.map_err(|e| StoreError::DatabaseError(e.to_string()))?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::DeserializationError("Invalid UTF-8 document id".into()))?;
            ids.push(id);
        }

        Ok(ids)
    }

    /// Number of live (non-deleted) documents.
    pub fn doc_count(&self) -> i64 {
        self.doc_count.load(Ordering::SeqCst)
    }

    /// Sequence of the last committed revision write.
    pub fn update_seq(&self) -> u64 {
        self.update_seq.load(Ordering::SeqCst)
    }

    // ─── Attachments ──────────────────────────────────────────────────

    /// Number of stored revisions referencing an attachment file.
    pub fn attachment_refs(&self, file: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_ATTACHMENTS)?;
        match self.db.get_cf(cf, file.as_bytes())? {
            Some(bytes) => {
                let buf: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::DeserializationError(format!("Bad reference count for {file}"))
                })?;
                Ok(u64::from_be_bytes(buf))
            }
            None => Ok(0),
        }
    }

    // ─── Local documents ──────────────────────────────────────────────

    pub fn load_local(&self, id: &str) -> Result<Option<Map<String, Value>>, StoreError> {
        let cf = self.cf(CF_LOCAL)?;
        match self.db.get_cf(cf, id.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::DeserializationError(e.to_string())),
            None => Ok(None),
        }
    }

    fn put_local_sync(&self, doc: Map<String, Value>) -> Result<DocOk, DocError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))?;
        let existing = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => self.load_local(id)?,
            None => None,
        };
        let (id, stored, ok) = local::prepare_put(doc, existing.as_ref())?;
        let bytes = serde_json::to_vec(&stored)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let cf = self.cf(CF_LOCAL)?;
        self.db.put_cf(cf, id.as_bytes(), bytes).map_err(StoreError::from)?;
        Ok(ok)
    }

    fn remove_local_sync(&self, doc: Map<String, Value>) -> Result<DocOk, DocError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("write lock poisoned".into()))?;
        let existing = match doc.get("_id").and_then(Value::as_str) {
            Some(id) => self.load_local(id)?,
            None => None,
        };
        let (id, ok) = local::check_remove(&doc, existing.as_ref())?;
        let cf = self.cf(CF_LOCAL)?;
        self.db.delete_cf(cf, id.as_bytes()).map_err(StoreError::from)?;
        Ok(ok)
    }

    /// Force a flush of the memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl DocBackend for DocumentStore {
    async fn get_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        self.load_metadata(id)
    }

    async fn write_doc(&self, write: &DocWrite) -> Result<WriteReceipt, StoreError> {
        self.store_revision(write)
    }

    async fn attachment_ref_count(&self, file: &str) -> Result<u64, StoreError> {
        self.attachment_refs(file)
    }
}

impl LocalStore for DocumentStore {
    async fn put_local(&self, doc: Map<String, Value>) -> Result<DocOk, DocError> {
        self.put_local_sync(doc)
    }

    async fn remove_local(&self, doc: Map<String, Value>) -> Result<DocOk, DocError> {
        self.remove_local_sync(doc)
    }
}

impl AllDocsSource for DocumentStore {
    async fn point_query(&self, query: &PointQuery) -> Result<PointResult, StoreError> {
        let rows = match self.load_metadata(&query.key)? {
            Some(meta) => {
                let doc = if query.include_docs && !meta.deleted {
                    self.load_body(&meta.id, &meta.rev)?
                        .map(|body| full_doc(&meta, &body))
                } else {
                    None
                };
                vec![AllDocsRow::Found {
                    id: meta.id.clone(),
                    key: query.key.clone(),
                    value: RowValue {
                        rev: meta.rev.to_string(),
                        deleted: meta.deleted.then_some(true),
                    },
                    doc,
                }]
            }
            None => Vec::new(),
        };
        Ok(PointResult {
            rows,
            total_rows: self.doc_count().max(0) as u64,
            update_seq: query.update_seq.then(|| self.update_seq()),
        })
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
