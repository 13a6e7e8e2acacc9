//! Batch write orchestration.
//!
//! ```text
//!  docs ──┬── _local/… ──────────────► LocalStore::put_local / remove_local
//!         │
//!         └── group by id ──┬── "a": [d0, d3] ── one at a time ──┐
//!                           ├── "b": [d1]                        ├─► DocBackend::write_doc
//!                           └── "c": [d2]                        ┘
//! ```
//!
//! Groups run concurrently. Inside a group every document is resolved
//! against the tree the previous document left behind, so two edits of the
//! same id in one batch behave exactly like two consecutive batches.

use std::collections::HashMap;

use futures_util::future::{join, join_all};
use serde_json::{Map, Value};
use tessera_core::{
    is_conflict, merge, parse_doc, DocError, DocOk, DocumentMetadata, ParseOptions, ParsedDoc,
    RevBranch, RevTree, ValidationError, DEFAULT_REV_LIMIT,
};

use crate::backend::{DocBackend, DocWrite, LocalStore};

/// One entry of a batch.
#[derive(Debug, Clone)]
pub enum BatchDoc {
    /// `_local/` document, stored as given.
    Local(Map<String, Value>),
    Parsed(ParsedDoc),
    /// Already failed upstream (parsing, attachments); reported as is.
    Rejected(DocError),
}

/// Batch-wide write options.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// `true` for locally authored edits, `false` for replicated history.
    pub new_edits: bool,
    /// Generations kept per path; 0 means the default.
    pub rev_limit: usize,
    /// The batch is a deletion request: inserting a deleted document fails.
    pub was_delete: bool,
    pub parse: ParseOptions,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            new_edits: true,
            rev_limit: DEFAULT_REV_LIMIT,
            was_delete: false,
            parse: ParseOptions::default(),
        }
    }
}

impl BatchOptions {
    /// Options for applying history pulled from another replica.
    pub fn replication() -> Self {
        Self {
            new_edits: false,
            ..Self::default()
        }
    }

    fn effective_rev_limit(&self) -> usize {
        if self.rev_limit == 0 {
            DEFAULT_REV_LIMIT
        } else {
            self.rev_limit
        }
    }
}

/// Outcome of a batch, in submission order.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<Result<DocOk, DocError>>,
    /// Net change of the live document count.
    pub doc_count_delta: i64,
    /// Attachment files released by stemming, to delete best-effort.
    pub orphaned_attachments: Vec<String>,
}

/// What to do with one document of a group.
#[derive(Debug)]
enum Resolution {
    /// Nothing to write; report success.
    Accept(DocOk),
    Write(Box<DocWrite>),
}

#[derive(Default)]
struct GroupOutcome {
    results: Vec<(usize, Result<DocOk, DocError>)>,
    delta: i64,
    orphaned: Vec<String>,
}

/// Apply a batch of documents.
///
/// Every document gets exactly one result, at its own position; a failure
/// never stops the rest of the batch.
pub async fn process_docs<B, L>(backend: &B, local: &L, docs: Vec<BatchDoc>, opts: &BatchOptions) -> BatchOutcome
where
    B: DocBackend,
    L: LocalStore,
{
    let total = docs.len();
    let mut results: Vec<Option<Result<DocOk, DocError>>> = (0..total).map(|_| None).collect();

    let mut locals = Vec::new();
    let mut groups: Vec<(String, Vec<(usize, ParsedDoc)>)> = Vec::new();
    let mut group_of: HashMap<String, usize> = HashMap::new();

    for (index, doc) in docs.into_iter().enumerate() {
        match doc {
            BatchDoc::Rejected(err) => results[index] = Some(Err(err)),
            BatchDoc::Local(doc) => locals.push((index, doc)),
            BatchDoc::Parsed(doc) => {
                let id = doc.metadata.id.clone();
                match group_of.get(&id) {
                    Some(&g) => groups[g].1.push((index, doc)),
                    None => {
                        group_of.insert(id.clone(), groups.len());
                        groups.push((id, vec![(index, doc)]));
                    }
                }
            }
        }
    }

    log::debug!(
        "Processing batch of {total} docs: {} ids, {} local",
        groups.len(),
        locals.len()
    );

    let local_writes = join_all(
        locals
            .into_iter()
            .map(|(index, doc)| async move { (index, write_local(local, doc).await) }),
    );
    let group_writes = join_all(
        groups
            .into_iter()
            .map(|(id, entries)| process_group(backend, id, entries, opts)),
    );
    let (local_results, group_outcomes) = join(local_writes, group_writes).await;

    let mut outcome = BatchOutcome::default();
    for (index, result) in local_results {
        results[index] = Some(result);
    }
    for group in group_outcomes {
        outcome.doc_count_delta += group.delta;
        outcome.orphaned_attachments.extend(group.orphaned);
        for (index, result) in group.results {
            results[index] = Some(result);
        }
    }
    outcome.results = results
        .into_iter()
        .map(|r| r.unwrap_or_else(|| Err(DocError::Backend("document was not processed".into()))))
        .collect();
    outcome
}

async fn write_local<L: LocalStore>(local: &L, doc: Map<String, Value>) -> Result<DocOk, DocError> {
    if doc.get("_deleted").is_some_and(tessera_core::doc::is_truthy) {
        local.remove_local(doc).await
    } else {
        local.put_local(doc).await
    }
}

/// Run every document of one id, strictly in order.
async fn process_group<B: DocBackend>(
    backend: &B,
    id: String,
    entries: Vec<(usize, ParsedDoc)>,
    opts: &BatchOptions,
) -> GroupOutcome {
    let mut outcome = GroupOutcome::default();

    let mut current = match backend.get_metadata(&id).await {
        Ok(current) => current,
        Err(e) => {
            log::error!("Failed to load metadata for {id}: {e}");
            for (index, _) in entries {
                outcome.results.push((index, Err(e.clone().into())));
            }
            return outcome;
        }
    };

    for (index, doc) in entries {
        let resolution = match &current {
            Some(prev) => resolve_update(prev, doc, index, opts),
            None => resolve_insert(doc, index, opts),
        };
        let write = match resolution {
            Ok(Resolution::Write(write)) => write,
            Ok(Resolution::Accept(ok)) => {
                outcome.results.push((index, Ok(ok)));
                continue;
            }
            Err(e) => {
                log::debug!("Rejected write of {id} at position {index}: {e}");
                outcome.results.push((index, Err(e)));
                continue;
            }
        };

        match backend.write_doc(&write).await {
            Ok(receipt) => {
                outcome.delta += write.delta;
                outcome.orphaned.extend(receipt.orphaned_attachments);
                let meta = &write.doc.metadata;
                outcome
                    .results
                    .push((index, Ok(DocOk::new(meta.id.clone(), &meta.rev))));
                current = Some(write.stored_metadata());
            }
            Err(e) => {
                log::error!("Backend failed to write {id}: {e}");
                outcome.results.push((index, Err(e.into())));
            }
        }
    }
    outcome
}

fn incoming_path(doc: &ParsedDoc) -> Result<RevBranch, DocError> {
    doc.metadata
        .rev_tree
        .branches()
        .first()
        .cloned()
        .ok_or_else(|| ValidationError::InvalidRev(doc.metadata.rev.to_string()).into())
}

/// First write of an id.
fn resolve_insert(mut doc: ParsedDoc, index: usize, opts: &BatchOptions) -> Result<Resolution, DocError> {
    // stemming applies to brand-new documents as well
    let merged = merge(RevTree::new(), incoming_path(&doc)?, opts.effective_rev_limit());
    doc.metadata.rev_tree = merged.tree;
    doc.metadata.stemmed_revs = merged.stemmed_revs;

    let tree = &doc.metadata.rev_tree;
    let winning_rev = tree
        .winning_rev()
        .ok_or_else(|| DocError::from(ValidationError::InvalidRev(doc.metadata.rev.to_string())))?;
    let deleted = tree.is_deleted(&winning_rev);

    if opts.was_delete && deleted {
        return Err(DocError::NotFound("deleted".into()));
    }
    // an edit naming a parent revision the store has never seen
    if opts.new_edits && tree.root_is_missing() {
        return Err(DocError::Conflict);
    }

    Ok(Resolution::Write(Box::new(DocWrite {
        doc,
        winning_rev,
        winning_deleted: deleted,
        rev_deleted: deleted,
        is_update: false,
        delta: if deleted { 0 } else { 1 },
        index,
    })))
}

/// Write against an existing tree.
fn resolve_update(
    prev: &DocumentMetadata,
    mut doc: ParsedDoc,
    index: usize,
    opts: &BatchOptions,
) -> Result<Resolution, DocError> {
    if !opts.new_edits && prev.rev_tree.contains(&doc.metadata.rev) {
        return Ok(Resolution::Accept(DocOk::new(
            doc.metadata.id.clone(),
            &doc.metadata.rev,
        )));
    }

    let previous_winner = prev.rev_tree.winning_rev();
    let previously_deleted = previous_winner
        .as_ref()
        .is_some_and(|rev| prev.rev_tree.is_deleted(rev));
    let deleted = doc.metadata.deleted;

    // Recreating a deleted document: graft the new body onto the tombstone
    // instead of starting a competing history at generation 1.
    if previously_deleted && !deleted && opts.new_edits && doc.metadata.rev.is_root() {
        if let Some(winner) = &previous_winner {
            let mut body = std::mem::take(&mut doc.data.0);
            body.insert("_rev".into(), Value::String(winner.to_string()));
            body.insert("_id".into(), Value::String(doc.metadata.id.clone()));
            doc = parse_doc(Value::Object(body), true, &opts.parse)?;
        }
    }

    let merged = merge(
        prev.rev_tree.clone(),
        incoming_path(&doc)?,
        opts.effective_rev_limit(),
    );
    if opts.new_edits && is_conflict(previously_deleted, deleted, merged.conflicts) {
        return Err(DocError::Conflict);
    }
    doc.metadata.rev_tree = merged.tree;
    doc.metadata.stemmed_revs = merged.stemmed_revs;

    let tree = &doc.metadata.rev_tree;
    let winning_rev = tree
        .winning_rev()
        .ok_or_else(|| DocError::from(ValidationError::InvalidRev(doc.metadata.rev.to_string())))?;
    let winning_deleted = tree.is_deleted(&winning_rev);
    let delta = match (previously_deleted, winning_deleted) {
        (false, true) => -1,
        (true, false) => 1,
        _ => 0,
    };
    let rev_deleted = if doc.metadata.rev == winning_rev {
        winning_deleted
    } else {
        tree.is_deleted(&doc.metadata.rev)
    };

    Ok(Resolution::Write(Box::new(DocWrite {
        doc,
        winning_rev,
        winning_deleted,
        rev_deleted,
        is_update: true,
        delta,
        index,
    })))
}
