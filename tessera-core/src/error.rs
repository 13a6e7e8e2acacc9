//! Per-document error taxonomy.
//!
//! Every failure produced while parsing or writing a document lands in that
//! document's result slot. Nothing here aborts a batch.

use thiserror::Error;

/// Input that can never be accepted, no matter how often it is retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Document must be a JSON object")]
    NotAnObject,
    #[error("Bad special document member: {0}")]
    BadSpecialMember(String),
    #[error("_id is required for puts")]
    MissingId,
    #[error("_id field must contain a string")]
    InvalidId,
    #[error("Only reserved document ids may start with underscore: {0}")]
    ReservedId(String),
    #[error("Invalid rev format: {0}")]
    InvalidRev(String),
    #[error("Invalid _revisions: {0}")]
    InvalidRevisions(String),
    #[error("Bad attachment {name}: {reason}")]
    BadAttachment { name: String, reason: String },
}

/// Outcome of a single rejected document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Document update conflict")]
    Conflict,
    #[error("missing: {0}")]
    NotFound(String),
    #[error("Backend failure: {0}")]
    Backend(String),
}

impl DocError {
    /// HTTP-style status code, as reported to replication peers.
    pub fn status(&self) -> u16 {
        match self {
            DocError::Validation(_) => 400,
            DocError::Conflict => 409,
            DocError::NotFound(_) => 404,
            DocError::Backend(_) => 500,
        }
    }

    /// Short machine-readable error name.
    pub fn name(&self) -> &'static str {
        match self {
            DocError::Validation(ValidationError::BadSpecialMember(_)) => "doc_validation",
            DocError::Validation(_) => "bad_request",
            DocError::Conflict => "conflict",
            DocError::NotFound(_) => "not_found",
            DocError::Backend(_) => "backend_failure",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DocError::Conflict)
    }
}
