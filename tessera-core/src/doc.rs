//! Parsed documents: tree-ready metadata plus the user-visible body.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attachment::Attachment;
use crate::error::ValidationError;
use crate::rev::RevId;
use crate::tree::RevTree;

/// Everything the store needs to place a revision in a document's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub id: String,
    /// Revision carried by this write (not necessarily the winner).
    pub rev: RevId,
    /// Deletion flag carried by this write.
    pub deleted: bool,
    pub rev_tree: RevTree,
    /// Revisions cut by the last merge; never persisted.
    #[serde(skip)]
    pub stemmed_revs: Vec<RevId>,
}

/// Document body: every ordinary field plus the reserved data fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentData(pub Map<String, Value>);

impl DocumentData {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn has_attachments(&self) -> bool {
        self.0
            .get("_attachments")
            .and_then(Value::as_object)
            .is_some_and(|atts| !atts.is_empty())
    }

    /// Decode the `_attachments` member, in declaration order.
    pub fn attachments(&self) -> Result<Vec<(String, Attachment)>, ValidationError> {
        let Some(raw) = self.0.get("_attachments") else {
            return Ok(Vec::new());
        };
        let Some(atts) = raw.as_object() else {
            return Err(ValidationError::BadAttachment {
                name: "_attachments".into(),
                reason: "must be an object".into(),
            });
        };
        atts.iter()
            .map(|(name, value)| {
                serde_json::from_value::<Attachment>(value.clone())
                    .map(|att| (name.clone(), att))
                    .map_err(|e| ValidationError::BadAttachment {
                        name: name.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect()
    }

    /// Replace the `_attachments` member.
    pub fn set_attachments(&mut self, atts: Vec<(String, Attachment)>) {
        let map: Map<String, Value> = atts
            .into_iter()
            .filter_map(|(name, att)| serde_json::to_value(att).ok().map(|v| (name, v)))
            .collect();
        self.0.insert("_attachments".into(), Value::Object(map));
    }

    /// Stored file names of every attachment that carries a digest.
    pub fn attachment_files(&self) -> Vec<String> {
        self.attachments()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(_, att)| att.file_name().ok())
            .collect()
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// A caller document split into metadata and data.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDoc {
    pub metadata: DocumentMetadata,
    pub data: DocumentData,
}

impl ParsedDoc {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

/// Successful outcome of one write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocOk {
    pub id: String,
    pub rev: String,
}

impl DocOk {
    pub fn new(id: impl Into<String>, rev: impl ToString) -> Self {
        Self {
            id: id.into(),
            rev: rev.to_string(),
        }
    }
}

/// JavaScript-style truthiness, used for flags such as `_deleted`.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
