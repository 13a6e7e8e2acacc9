//! `bulk_docs` front door: raw JSON in, positional results out.
//!
//! ```text
//! raw docs ─► parse ─► attachments ─► process_docs ─► reclaim unreferenced files
//!              │            │
//!              └── errors fill their own result slot
//! ```

use std::collections::BTreeSet;

use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use tessera_core::{is_local_id, parse_doc, DocError, DocOk, ParsedDoc};

use crate::all_docs::{all_docs_keys, AllDocsOptions, AllDocsResponse, AllDocsSource};
use crate::attachments::AttachmentStore;
use crate::backend::{DocBackend, LocalStore};
use crate::batch::{process_docs, BatchDoc, BatchOptions, BatchOutcome};
use crate::storage::StoreError;

/// A document backend paired with the attachment files of the same database.
pub struct BulkWriter<B> {
    backend: B,
    attachments: AttachmentStore,
}

impl<B> BulkWriter<B>
where
    B: DocBackend + LocalStore,
{
    pub fn new(backend: B, attachments: AttachmentStore) -> Self {
        Self {
            backend,
            attachments,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Apply a batch of raw documents.
    ///
    /// The outcome has one result per input, in input order.
    pub async fn bulk_docs(&self, docs: Vec<Value>, opts: &BatchOptions) -> BatchOutcome {
        let (prepared, written): (Vec<_>, Vec<_>) =
            join_all(docs.into_iter().map(|doc| self.prepare(doc, opts)))
                .await
                .into_iter()
                .unzip();

        let outcome = process_docs(&self.backend, &self.backend, prepared, opts).await;

        // files of rejected documents and files stemming orphaned
        let mut candidates: BTreeSet<String> =
            outcome.orphaned_attachments.iter().cloned().collect();
        for (result, files) in outcome.results.iter().zip(written) {
            if result.is_err() {
                candidates.extend(files);
            }
        }
        for file in &candidates {
            self.reclaim(file).await;
        }
        log::debug!(
            "bulk_docs finished: {} results, count delta {}",
            outcome.results.len(),
            outcome.doc_count_delta
        );
        outcome
    }

    /// Parse one document and store its attachment bodies, returning the
    /// files placed in the attachment store along the way.
    async fn prepare(&self, doc: Value, opts: &BatchOptions) -> (BatchDoc, Vec<String>) {
        if let Some(local) = as_local(&doc) {
            return (BatchDoc::Local(local), Vec::new());
        }
        let mut parsed: ParsedDoc = match parse_doc(doc, opts.new_edits, &opts.parse) {
            Ok(parsed) => parsed,
            Err(e) => return (BatchDoc::Rejected(e), Vec::new()),
        };
        let mut written = Vec::new();
        match self.attachments.preprocess(&mut parsed.data, &mut written).await {
            Ok(()) => (BatchDoc::Parsed(parsed), written),
            Err(e) => {
                log::debug!("Attachments of {} rejected: {e}", parsed.id());
                (BatchDoc::Rejected(e.into()), written)
            }
        }
    }

    /// Delete `file` unless a stored revision references it once the whole
    /// batch has committed. A later document of the same batch may have
    /// taken a reference after an earlier write orphaned it.
    async fn reclaim(&self, file: &str) {
        match self.backend.attachment_ref_count(file).await {
            Ok(0) => self.attachments.delete_attachment(file).await,
            Ok(refs) => log::debug!("Keeping attachment {file} ({refs} references)"),
            Err(e) => log::warn!("Keeping attachment {file}, reference count unavailable: {e}"),
        }
    }
}

impl<B> BulkWriter<B>
where
    B: AllDocsSource,
{
    /// `_all_docs` restricted to an explicit key list.
    pub async fn all_docs(&self, opts: &AllDocsOptions) -> Result<AllDocsResponse, StoreError> {
        all_docs_keys(&self.backend, opts).await
    }
}

fn as_local(doc: &Value) -> Option<Map<String, Value>> {
    let obj = doc.as_object()?;
    let id = obj.get("_id")?.as_str()?;
    is_local_id(id).then(|| obj.clone())
}

/// Id a raw document names, for reporting results.
pub fn doc_id(doc: &Value) -> Option<&str> {
    doc.get("_id").and_then(Value::as_str)
}

/// One result in the usual `bulk_docs` response shape.
pub fn result_to_json(id: Option<&str>, result: &Result<DocOk, DocError>) -> Value {
    match result {
        Ok(ok) => json!({ "ok": true, "id": ok.id, "rev": ok.rev }),
        Err(e) => {
            let mut row = json!({
                "error": e.name(),
                "reason": e.to_string(),
                "status": e.status(),
            });
            if let (Some(id), Some(obj)) = (id, row.as_object_mut()) {
                obj.insert("id".into(), Value::String(id.to_string()));
            }
            row
        }
    }
}
