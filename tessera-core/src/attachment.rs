//! Attachment descriptors and content addressing.
//!
//! An attachment body is identified by the MD5 of its raw bytes, written as
//! `md5-<base64>`. The stored file name is the same digest in hex plus the
//! subtype of the declared content type, so identical bytes of the same
//! type always land on the same file.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const DIGEST_PREFIX: &str = "md5-";

/// One entry of a document's `_attachments` member.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    /// Base64 body, a file reference, or (once stored) the stored file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Already stored by an earlier revision; nothing to upload.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stub: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revpos: Option<u64>,
}

impl Attachment {
    /// Stored file name, available once the digest is known.
    pub fn file_name(&self) -> Result<String, ValidationError> {
        let digest = self.digest.as_deref().ok_or_else(|| ValidationError::BadAttachment {
            name: self.content_type.clone(),
            reason: "attachment has no digest".into(),
        })?;
        attachment_file_name(digest, &self.content_type)
    }
}

/// `md5-` digest of raw attachment bytes.
pub fn md5_digest(bytes: &[u8]) -> String {
    format!("{DIGEST_PREFIX}{}", STANDARD.encode(Md5::digest(bytes)))
}

/// Deterministic storage name: hex of the decoded digest, a dot, and the
/// part of the content type after its last `/`.
pub fn attachment_file_name(digest: &str, content_type: &str) -> Result<String, ValidationError> {
    let encoded = digest.strip_prefix(DIGEST_PREFIX).unwrap_or(digest);
    let raw = STANDARD
        .decode(encoded)
        .map_err(|e| ValidationError::BadAttachment {
            name: digest.to_string(),
            reason: format!("digest is not valid base64: {e}"),
        })?;
    let extension = content_type
        .rsplit_once('/')
        .map_or(content_type, |(_, subtype)| subtype);
    Ok(format!("{}.{extension}", hex::encode(raw)))
}

/// Decode an inline body, accepting an optional `data:` URI header.
pub fn decode_inline(name: &str, data: &str) -> Result<Vec<u8>, ValidationError> {
    let payload = data.split_once(',').map_or(data, |(_, body)| body);
    STANDARD
        .decode(payload.trim())
        .map_err(|_| ValidationError::BadAttachment {
            name: name.to_string(),
            reason: "Attachment is not a valid base64 string".into(),
        })
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
