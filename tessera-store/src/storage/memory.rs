//! In-memory backend.
//!
//! Same contracts as the RocksDB store, without durability. Used by tests
//! and by embedders that only need a scratch database. Writes for selected
//! ids can be made to fail, to exercise error paths of the write path.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tessera_core::{DocError, DocOk, DocumentData, DocumentMetadata, RevId};
use tokio::sync::Mutex;

use super::StoreError;
use crate::all_docs::{AllDocsRow, AllDocsSource, PointQuery, PointResult, RowValue};
use crate::backend::{DocBackend, DocWrite, LocalStore, WriteReceipt};
use crate::local;

#[derive(Default)]
struct Inner {
    docs: HashMap<String, DocumentMetadata>,
    bodies: HashMap<(String, RevId), DocumentData>,
    locals: HashMap<String, Map<String, Value>>,
    attachment_refs: HashMap<String, u64>,
    doc_count: i64,
    update_seq: u64,
    fail_ids: HashSet<String>,
    /// Every accepted write, in commit order.
    writes: Vec<(String, RevId)>,
}

impl Inner {
    fn release(&mut self, file: String, orphaned: &mut Vec<String>) {
        if let Some(count) = self.attachment_refs.get_mut(&file) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.attachment_refs.remove(&file);
                orphaned.push(file);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later write of `id` fail.
    pub async fn fail_writes_for(&self, id: impl Into<String>) {
        self.inner.lock().await.fail_ids.insert(id.into());
    }

    pub async fn doc_count(&self) -> i64 {
        self.inner.lock().await.doc_count
    }

    pub async fn update_seq(&self) -> u64 {
        self.inner.lock().await.update_seq
    }

    pub async fn get_body(&self, id: &str, rev: &RevId) -> Option<DocumentData> {
        self.inner
            .lock()
            .await
            .bodies
            .get(&(id.to_string(), rev.clone()))
            .cloned()
    }

    pub async fn get_local(&self, id: &str) -> Option<Map<String, Value>> {
        self.inner.lock().await.locals.get(id).cloned()
    }

    pub async fn attachment_refs(&self, file: &str) -> u64 {
        self.inner
            .lock()
            .await
            .attachment_refs
            .get(file)
            .copied()
            .unwrap_or(0)
    }

    /// Accepted writes in commit order.
    pub async fn writes(&self) -> Vec<(String, RevId)> {
        self.inner.lock().await.writes.clone()
    }
}

impl DocBackend for MemoryBackend {
    async fn get_metadata(&self, id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        Ok(self.inner.lock().await.docs.get(id).cloned())
    }

    async fn write_doc(&self, write: &DocWrite) -> Result<WriteReceipt, StoreError> {
        // let other ids make progress between writes
        tokio::task::yield_now().await;

        let mut inner = self.inner.lock().await;
        let meta = &write.doc.metadata;
        if inner.fail_ids.contains(&meta.id) {
            return Err(StoreError::WriteRejected(format!("injected failure for {}", meta.id)));
        }

        let key = (meta.id.clone(), meta.rev.clone());
        if !write.is_update || !inner.bodies.contains_key(&key) {
            for file in write.doc.data.attachment_files() {
                *inner.attachment_refs.entry(file).or_default() += 1;
            }
            inner.bodies.insert(key, write.doc.data.clone());
        }

        let mut orphaned = Vec::new();
        for rev in &meta.stemmed_revs {
            if let Some(body) = inner.bodies.remove(&(meta.id.clone(), rev.clone())) {
                for file in body.attachment_files() {
                    inner.release(file, &mut orphaned);
                }
            }
        }

        inner.docs.insert(meta.id.clone(), write.stored_metadata());
        inner.doc_count += write.delta;
        inner.update_seq += 1;
        inner.writes.push((meta.id.clone(), meta.rev.clone()));
        log::trace!(
            "Stored {} {}{} at seq {}",
            meta.id,
            meta.rev,
            if write.rev_deleted { " (deleted)" } else { "" },
            inner.update_seq
        );

        Ok(WriteReceipt {
            seq: inner.update_seq,
            orphaned_attachments: orphaned,
        })
    }

    async fn attachment_ref_count(&self, file: &str) -> Result<u64, StoreError> {
        Ok(self.attachment_refs(file).await)
    }
}

impl LocalStore for MemoryBackend {
    async fn put_local(&self, doc: Map<String, Value>) -> Result<DocOk, DocError> {
        let mut inner = self.inner.lock().await;
        let existing = doc
            .get("_id")
            .and_then(Value::as_str)
            .and_then(|id| inner.locals.get(id));
        let (id, stored, ok) = local::prepare_put(doc, existing)?;
        inner.locals.insert(id, stored);
        Ok(ok)
    }

    async fn remove_local(&self, doc: Map<String, Value>) -> Result<DocOk, DocError> {
        let mut inner = self.inner.lock().await;
        let existing = doc
            .get("_id")
            .and_then(Value::as_str)
            .and_then(|id| inner.locals.get(id));
        let (id, ok) = local::check_remove(&doc, existing)?;
        inner.locals.remove(&id);
        Ok(ok)
    }
}

impl AllDocsSource for MemoryBackend {
    async fn point_query(&self, query: &PointQuery) -> Result<PointResult, StoreError> {
        let inner = self.inner.lock().await;
        let rows = match inner.docs.get(&query.key) {
            Some(meta) => {
                let doc = if query.include_docs && !meta.deleted {
                    inner
                        .bodies
                        .get(&(meta.id.clone(), meta.rev.clone()))
                        .map(|body| full_doc(meta, body))
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
            total_rows: inner.doc_count.max(0) as u64,
            update_seq: query.update_seq.then_some(inner.update_seq),
        })
    }
}

/// Body of the winning revision with `_id` and `_rev` restored.
pub(crate) fn full_doc(meta: &DocumentMetadata, body: &DocumentData) -> Value {
    let mut doc = Map::new();
    doc.insert("_id".into(), Value::String(meta.id.clone()));
    doc.insert("_rev".into(), Value::String(meta.rev.to_string()));
    for (k, v) in &body.0 {
        doc.insert(k.clone(), v.clone());
    }
    Value::Object(doc)
}
