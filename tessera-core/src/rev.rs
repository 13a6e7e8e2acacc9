//! Revision identifiers: `<generation>-<hash>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// A single revision of a document.
///
/// `pos` is the generation (distance from the root of the history, starting
/// at 1); `hash` is the opaque content-derived token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RevId {
    pub pos: u64,
    pub hash: String,
}

impl RevId {
    pub fn new(pos: u64, hash: impl Into<String>) -> Self {
        Self {
            pos,
            hash: hash.into(),
        }
    }

    /// Parse the textual form. The generation must be all digits and the
    /// hash must be non-empty; everything after the first `-` is the hash.
    pub fn parse(rev: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidRev(rev.to_string());
        let (left, right) = rev.split_once('-').ok_or_else(invalid)?;
        if left.is_empty() || !left.bytes().all(|b| b.is_ascii_digit()) || right.is_empty() {
            return Err(invalid());
        }
        let pos = left.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(pos, right))
    }

    /// First generation of a history (no parent).
    pub fn is_root(&self) -> bool {
        self.pos == 1
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pos, self.hash)
    }
}

impl FromStr for RevId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
