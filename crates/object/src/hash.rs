use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ObjectError;

/// Number of bytes in a SHA-256 digest.
pub const HASH_LEN: usize = 32;

/// Digest of the canonical byte encoding of a complete object.
///
/// Two equal-content writes produce the same `ContentHash`; every revision
/// of a logical object gets a fresh one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; HASH_LEN]);

/// Digest of the canonical encoding restricted to identity-forming fields.
///
/// Stable across edits of non-identity fields, so all versions of a logical
/// object share one `IdHash`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdHash([u8; HASH_LEN]);

/// A specific revision of a logical object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionRef {
    pub id: IdHash,
    pub content: ContentHash,
}

fn sha256(bytes: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn parse_hex(input: &str) -> Result<[u8; HASH_LEN], ObjectError> {
    if input.len() != HASH_LEN * 2 {
        return Err(ObjectError::InvalidEncoding(format!(
            "expected {} hex chars, got {}",
            HASH_LEN * 2,
            input.len()
        )));
    }
    let mut out = [0u8; HASH_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        let pair = &input[i * 2..i * 2 + 2];
        *byte = u8::from_str_radix(pair, 16)
            .map_err(|_| ObjectError::InvalidEncoding(format!("invalid hex pair `{pair}`")))?;
    }
    Ok(out)
}

fn to_hex(bytes: &[u8; HASH_LEN]) -> String {
    let mut out = String::with_capacity(HASH_LEN * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl ContentHash {
    /// Hash raw bytes. Callers hashing objects should go through
    /// [`crate::encode::content_hash`] so canonical encoding is applied.
    pub fn of(bytes: &[u8]) -> Self {
        Self(sha256(bytes))
    }

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }
}

impl IdHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(sha256(bytes))
    }

    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }
}

impl FromStr for ContentHash {
    type Err = ObjectError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_hex(input)?))
    }
}

impl FromStr for IdHash {
    type Err = ObjectError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(Self(parse_hex(input)?))
    }
}

// Truncated form for logs; the full digest round-trips via to_hex/FromStr.
impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}…", &self.to_hex()[..12])
    }
}

impl fmt::Display for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}…", &self.to_hex()[..12])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({self})")
    }
}

impl fmt::Debug for IdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdHash({self})")
    }
}
