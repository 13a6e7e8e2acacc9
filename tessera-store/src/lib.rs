//! # tessera-store — Write path for revision-tree documents
//!
//! Applies batches of document writes against a persistent backend while
//! keeping every document's revision tree and the live document count
//! consistent. Attachment bodies are stored once per content digest.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  raw JSON   ┌──────────────┐   DocWrite   ┌───────────────┐
//! │ BulkWriter  │ ──────────► │ process_docs │ ───────────► │ DocBackend    │
//! │ (bulk.rs)   │             │ (batch.rs)   │              │ RocksDB / mem │
//! └──────┬──────┘             └──────────────┘              └───────┬───────┘
//!        │ attachments                                              │ orphaned
//!        ▼                                                          ▼ files
//! ┌─────────────────┐ ◄──────────────────────────────────────────────┘
//! │ AttachmentStore │  content-addressed files, tokio::fs
//! └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`batch`] — per-id grouping, conflict rules, count bookkeeping
//! - [`backend`] — contracts the write path persists through
//! - [`storage`] — RocksDB and in-memory backends
//! - [`attachments`] — content-addressed attachment files
//! - [`local`] — `_local/` document revision rules
//! - [`all_docs`] — keys-only `_all_docs` lookups
//! - [`bulk`] — raw JSON front door

pub mod all_docs;
pub mod attachments;
pub mod backend;
pub mod batch;
pub mod bulk;
pub mod local;
pub mod storage;

// Re-exports for convenience
pub use all_docs::{
    all_docs_keys, AllDocsOptions, AllDocsResponse, AllDocsRow, AllDocsSource, PointQuery,
    PointResult, RowValue,
};
pub use attachments::{AttachmentBody, AttachmentConfig, AttachmentError, AttachmentStore};
pub use backend::{DocBackend, DocWrite, LocalStore, WriteReceipt};
pub use batch::{process_docs, BatchDoc, BatchOptions, BatchOutcome};
pub use bulk::{doc_id, result_to_json, BulkWriter};
pub use storage::{DocumentStore, MemoryBackend, StoreConfig, StoreError};
