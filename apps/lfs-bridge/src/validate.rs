//! Gatekeeping for host-supplied identifiers and paths.
//!
//! Everything the host sends is untrusted. Object ids end up in directory
//! names and bridge payloads, paths end up in file opens, so both are checked
//! here before any other module sees them.

use std::fmt;

use thiserror::Error;

pub const OID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("object id must be exactly {OID_LEN} hexadecimal characters")]
    InvalidFormat,
    #[error("path must not contain '..' segments")]
    PathTraversal,
    #[error("path is empty")]
    Empty,
    #[error("path contains a NUL byte")]
    NulByte,
}

/// A validated object id, normalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Oid(String);

impl Oid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(oid[0:2], oid[2:4])`, the two fan-out directory levels.
    pub fn shards(&self) -> (&str, &str) {
        (&self.0[0..2], &self.0[2..4])
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Oid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

pub fn validate_oid(raw: &str) -> Result<Oid, ValidationError> {
    if raw.len() != OID_LEN || !raw.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidFormat);
    }
    Ok(Oid(raw.to_ascii_lowercase()))
}

pub fn validate_path(raw: &str) -> Result<(), ValidationError> {
    if raw.is_empty() {
        return Err(ValidationError::Empty);
    }
    if raw.contains('\0') {
        return Err(ValidationError::NulByte);
    }
    // Both separators are checked regardless of platform; a Windows-style
    // `..\` must not slip through on unix either.
    if raw.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(ValidationError::PathTraversal);
    }
    Ok(())
}
