//! Revision rules for `_local/` documents.
//!
//! Local documents have no tree. Their revision is a plain counter,
//! `0-1`, `0-2`, …, and a write must name the revision it replaces.

use serde_json::{Map, Value};
use tessera_core::{DocError, DocOk, ValidationError};

/// Revision reported for a removed local document.
pub const REMOVED_LOCAL_REV: &str = "0-0";

fn local_id(doc: &Map<String, Value>) -> Result<String, DocError> {
    match doc.get("_id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
        Some(_) => Err(ValidationError::InvalidId.into()),
        None => Err(ValidationError::MissingId.into()),
    }
}

fn rev_of(doc: &Map<String, Value>) -> Option<&str> {
    doc.get("_rev").and_then(Value::as_str).filter(|r| !r.is_empty())
}

/// Counter part of a `0-N` revision.
fn counter(rev: &str) -> Result<u64, DocError> {
    rev.split('-')
        .nth(1)
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| ValidationError::InvalidRev(rev.to_string()).into())
}

/// Check a put against the stored document and stamp the next revision.
///
/// Returns the id, the document as it must be stored and the result.
pub fn prepare_put(
    mut doc: Map<String, Value>,
    existing: Option<&Map<String, Value>>,
) -> Result<(String, Map<String, Value>, DocOk), DocError> {
    let id = local_id(&doc)?;
    let old_rev = rev_of(&doc).map(str::to_string);
    match (existing, old_rev.as_deref()) {
        (None, Some(_)) => return Err(DocError::Conflict),
        (Some(stored), rev) if rev_of(stored) != rev => return Err(DocError::Conflict),
        _ => {}
    }
    let next = match old_rev.as_deref() {
        Some(rev) => counter(rev)? + 1,
        None => 1,
    };
    let rev = format!("0-{next}");
    doc.insert("_rev".into(), Value::String(rev.clone()));
    let ok = DocOk::new(id.clone(), rev);
    Ok((id, doc, ok))
}

/// Check a removal against the stored document.
pub fn check_remove(
    doc: &Map<String, Value>,
    existing: Option<&Map<String, Value>>,
) -> Result<(String, DocOk), DocError> {
    let id = local_id(doc)?;
    let Some(stored) = existing else {
        return Err(DocError::NotFound("missing".into()));
    };
    if rev_of(stored) != rev_of(doc) {
        return Err(DocError::Conflict);
    }
    Ok((id.clone(), DocOk::new(id, REMOVED_LOCAL_REV)))
}
