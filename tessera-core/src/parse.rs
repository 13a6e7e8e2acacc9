//! Turning caller documents into [`ParsedDoc`]s.
//!
//! ```text
//!   {"_id":"a","_rev":"1-x","foo":1}
//!            │
//!            ▼  split reserved / ordinary members
//!   metadata {id:"a", rev:"2-<hash>", rev_tree:[1-x(missing) → 2-<hash>]}
//!   data     {"foo":1}
//! ```
//!
//! New edits mint a revision; replicated edits carry one (`_revisions` or
//! `_rev`) and are taken as given.

use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::doc::{is_truthy, DocumentData, DocumentMetadata, ParsedDoc};
use crate::error::{DocError, ValidationError};
use crate::rev::RevId;
use crate::tree::{RevBranch, RevNode, RevTree};

/// Where a reserved (`_`-prefixed) member ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldClass {
    Metadata,
    Data,
}

/// Every `_`-prefixed member a document may carry. Anything else is rejected.
pub static RESERVED_FIELDS: &[(&str, FieldClass)] = &[
    ("_id", FieldClass::Metadata),
    ("_rev", FieldClass::Metadata),
    ("_attachments", FieldClass::Data),
    ("_deleted", FieldClass::Metadata),
    ("_revisions", FieldClass::Metadata),
    ("_revs_info", FieldClass::Metadata),
    ("_conflicts", FieldClass::Metadata),
    ("_deleted_conflicts", FieldClass::Metadata),
    ("_local_seq", FieldClass::Metadata),
    ("_rev_tree", FieldClass::Metadata),
    // replication bookkeeping documents
    ("_replication_id", FieldClass::Data),
    ("_replication_state", FieldClass::Data),
    ("_replication_state_time", FieldClass::Data),
    ("_replication_state_reason", FieldClass::Data),
    ("_replication_stats", FieldClass::Data),
    // Sync Gateway
    ("_removed", FieldClass::Metadata),
];

/// Classification of a member name; `None` for a rejected reserved name.
pub fn classify_field(key: &str) -> Option<FieldClass> {
    if !key.starts_with('_') {
        return Some(FieldClass::Data);
    }
    RESERVED_FIELDS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, class)| *class)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOptions {
    /// Derive new revision hashes from content instead of at random.
    pub deterministic_revs: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            deterministic_revs: true,
        }
    }
}

/// `_local/…` ids bypass revision trees.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with("_local/")
}

/// Check an `_id` member.
pub fn validate_id(id: Option<&Value>) -> Result<&str, ValidationError> {
    let id = match id {
        None => return Err(ValidationError::MissingId),
        Some(v) if !is_truthy(v) => return Err(ValidationError::MissingId),
        Some(Value::String(s)) => s.as_str(),
        Some(_) => return Err(ValidationError::InvalidId),
    };
    if id.starts_with('_') && !(id.starts_with("_design") || id.starts_with("_local")) {
        return Err(ValidationError::ReservedId(id.to_string()));
    }
    Ok(id)
}

/// Hash for a freshly minted revision.
///
/// Deterministic mode hashes the JSON form of the document (id and prior
/// revision included, revision tree excluded), so identical edits on two
/// replicas produce the same revision.
pub fn new_rev_hash(doc: &Map<String, Value>, deterministic: bool) -> String {
    if !deterministic {
        return uuid::Uuid::new_v4().simple().to_string();
    }
    let mut doc = doc.clone();
    doc.remove("_rev_tree");
    // serializing a map of JSON values cannot fail
    let body = serde_json::to_vec(&doc).unwrap_or_default();
    hex::encode(Md5::digest(&body))
}

#[derive(Deserialize)]
struct Revisions {
    start: u64,
    ids: Vec<String>,
}

/// Chain of `_revisions.ids` (newest first); only the newest is available.
fn tree_from_revisions(raw: &Value, deleted: bool) -> Result<(RevTree, RevId), ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidRevisions(reason.to_string());
    let revisions: Revisions =
        serde_json::from_value(raw.clone()).map_err(|e| invalid(&e.to_string()))?;
    let len = revisions.ids.len() as u64;
    if len == 0 {
        return Err(invalid("ids must not be empty"));
    }
    if revisions.start < len {
        return Err(invalid("start is lower than the number of ids"));
    }
    let pos = revisions.start - len + 1;

    let mut ids = revisions.ids.into_iter();
    let newest = ids.next().ok_or_else(|| invalid("ids must not be empty"))?;
    let mut node = RevNode::available(newest.clone(), deleted);
    for ancestor in ids {
        node = RevNode::missing(ancestor).with_child(node);
    }
    Ok((
        RevTree::single(RevBranch::new(pos, node)),
        RevId::new(revisions.start, newest),
    ))
}

fn rev_member(doc: &Map<String, Value>) -> Result<RevId, ValidationError> {
    match doc.get("_rev") {
        Some(Value::String(rev)) => RevId::parse(rev),
        Some(other) => Err(ValidationError::InvalidRev(other.to_string())),
        None => Err(ValidationError::InvalidRev(String::new())),
    }
}

/// Split a caller document into metadata and data, assigning or reading its
/// revision and building the single-lineage tree to merge.
pub fn parse_doc(doc: Value, new_edits: bool, opts: &ParseOptions) -> Result<ParsedDoc, DocError> {
    let Value::Object(mut doc) = doc else {
        return Err(ValidationError::NotAnObject.into());
    };
    let deleted = doc.get("_deleted").is_some_and(is_truthy);

    let (rev_tree, rev) = if new_edits {
        if !doc.get("_id").is_some_and(is_truthy) {
            doc.insert("_id".into(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        let hash = new_rev_hash(&doc, opts.deterministic_revs);
        if doc.get("_rev").is_some_and(is_truthy) {
            let prior = rev_member(&doc)?;
            let pos = prior.pos;
            // the prior generation must leave room for its child
            let next = pos
                .checked_add(1)
                .ok_or_else(|| ValidationError::InvalidRev(prior.to_string()))?;
            let branch = RevBranch::new(
                pos,
                RevNode::missing(prior.hash).with_child(RevNode::available(hash.clone(), deleted)),
            );
            (RevTree::single(branch), RevId::new(next, hash))
        } else {
            let branch = RevBranch::new(1, RevNode::available(hash.clone(), deleted));
            (RevTree::single(branch), RevId::new(1, hash))
        }
    } else if let Some(revisions) = doc.get("_revisions").filter(|v| is_truthy(v)) {
        tree_from_revisions(revisions, deleted)?
    } else {
        let rev = rev_member(&doc)?;
        let branch = RevBranch::new(rev.pos, RevNode::available(rev.hash.clone(), deleted));
        (RevTree::single(branch), rev)
    };

    let id = validate_id(doc.get("_id"))?.to_string();
    doc.insert("_rev".into(), Value::String(rev.to_string()));

    let mut data = Map::new();
    for (key, value) in doc {
        match classify_field(&key) {
            None => return Err(ValidationError::BadSpecialMember(key).into()),
            Some(FieldClass::Data) => {
                data.insert(key, value);
            }
            // id, rev and deletion are carried as typed fields; the other
            // reserved members only describe the document and are dropped
            Some(FieldClass::Metadata) => {}
        }
    }

    Ok(ParsedDoc {
        metadata: DocumentMetadata {
            id,
            rev,
            deleted,
            rev_tree,
            stemmed_revs: Vec::new(),
        },
        data: DocumentData(data),
    })
}
