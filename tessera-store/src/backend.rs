//! Contracts between the write path and whatever persists documents.
//!
//! The orchestrator never touches storage directly: it reads the current
//! metadata of an id, resolves the incoming revision against it and hands
//! the result to [`DocBackend::write_doc`]. `_local/` documents go through
//! [`LocalStore`] instead.

use serde_json::{Map, Value};
use tessera_core::{DocError, DocOk, DocumentMetadata, ParsedDoc, RevId};

use crate::storage::StoreError;

/// One resolved revision, ready to persist.
#[derive(Debug, Clone)]
pub struct DocWrite {
    /// Metadata carries the merged tree and the revisions stemming removed.
    pub doc: ParsedDoc,
    pub winning_rev: RevId,
    pub winning_deleted: bool,
    /// Deletion flag of `doc.metadata.rev` itself, which may differ from
    /// the winner's when the write lands on a losing branch.
    pub rev_deleted: bool,
    /// The id already had stored metadata. Backends skip the existing-body
    /// lookup when this is false.
    pub is_update: bool,
    /// Change to the live document count: -1, 0 or +1.
    pub delta: i64,
    /// Position of the document in its batch.
    pub index: usize,
}

impl DocWrite {
    /// Metadata as stored after this write: the tree plus its winner.
    pub fn stored_metadata(&self) -> DocumentMetadata {
        DocumentMetadata {
            id: self.doc.metadata.id.clone(),
            rev: self.winning_rev.clone(),
            deleted: self.winning_deleted,
            rev_tree: self.doc.metadata.rev_tree.clone(),
            stemmed_revs: Vec::new(),
        }
    }
}

/// What a backend reports back after persisting a revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Update sequence assigned to the write.
    pub seq: u64,
    /// Attachment files no stored revision references any more.
    pub orphaned_attachments: Vec<String>,
}

/// Revision-tree document storage.
#[allow(async_fn_in_trait)]
pub trait DocBackend {
    /// Stored metadata for `id`, reflecting every completed write.
    async fn get_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>, StoreError>;

    /// Durably persist metadata and body of one resolved revision.
    async fn write_doc(&self, write: &DocWrite) -> Result<WriteReceipt, StoreError>;

    /// Stored revisions currently referencing attachment `file`.
    async fn attachment_ref_count(&self, file: &str) -> Result<u64, StoreError>;
}

/// Non-replicated `_local/` documents, last write wins.
#[allow(async_fn_in_trait)]
pub trait LocalStore {
    async fn put_local(&self, doc: Map<String, Value>) -> Result<DocOk, DocError>;

    async fn remove_local(&self, doc: Map<String, Value>) -> Result<DocOk, DocError>;
}
