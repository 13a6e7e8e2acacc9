//! Document model for the tessera store: revision ids, revision trees with
//! their merge and winner rules, the document parser and attachment
//! descriptors. Nothing in this crate touches disk.

pub mod attachment;
pub mod doc;
pub mod error;
pub mod parse;
pub mod rev;
pub mod tree;

pub use attachment::{attachment_file_name, md5_digest, Attachment};
pub use doc::{DocOk, DocumentData, DocumentMetadata, ParsedDoc};
pub use error::{DocError, ValidationError};
pub use parse::{is_local_id, parse_doc, validate_id, ParseOptions};
pub use rev::RevId;
pub use tree::{
    is_conflict, merge, MergeConflict, MergeResult, RevBranch, RevNode, RevStatus, RevTree,
    DEFAULT_REV_LIMIT,
};
