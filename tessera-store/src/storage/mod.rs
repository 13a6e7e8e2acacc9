//! Storage backends for the write path.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   DocWrite    ┌───────────────┐
//! │ process_docs │ ────────────► │ DocBackend    │
//! │ (batch.rs)   │               ├───────────────┤
//! └──────┬───────┘               │ DocumentStore │ RocksDB
//!        │ _local/ docs          │ MemoryBackend │ in-process
//!        ▼                       └───────┬───────┘
//! ┌──────────────┐                       │ column families
//! │ LocalStore   │                       ▼
//! └──────────────┘     ┌──────────────────────────────────────┐
//!                      │ CF "metadata"    — revision trees     │
//!                      │ CF "revisions"   — LZ4 bodies         │
//!                      │ CF "local"       — _local/ documents  │
//!                      │ CF "attachments" — reference counts   │
//!                      │ CF "meta"        — doc_count, seq     │
//!                      └──────────────────────────────────────┘
//! ```
//!
//! Both backends report attachment files whose last reference went away
//! with a stemmed revision, so the attachment store can delete them.

pub mod error;
pub mod memory;
pub mod rocks;

pub use error::StoreError;
pub use memory::MemoryBackend;
pub use rocks::{DocumentStore, StoreConfig};
