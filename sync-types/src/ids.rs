//! Identity and fingerprint types for trisync.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::borrow::Borrow;
use std::fmt;

use crate::SyncError;

/// Identifier of a logical document, stable across renames.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(String);

impl Guid {
    /// Create a Guid from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Guid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Guid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for Guid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Guid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self.0)
    }
}

/// SHA-256 fingerprint of document contents, stored as lowercase hex.
///
/// Replicas are compared by hash while idle so that no document text needs
/// to stay resident.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    /// Hash the given contents.
    pub fn of(contents: &str) -> Self {
        let digest = Sha256::digest(contents.as_bytes());
        Self(hex::encode(digest))
    }

    /// Parse a hash from its hex representation.
    pub fn from_hex(value: &str) -> Result<Self, SyncError> {
        let valid = value.len() == 64
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(SyncError::InvalidHash(value.to_string()))
        }
    }

    /// The hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this hash fingerprints `contents`.
    pub fn matches(&self, contents: &str) -> bool {
        *self == Self::of(contents)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.0[..12])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_display_is_raw_string() {
        let guid = Guid::from("notes/a.md");
        assert_eq!(guid.to_string(), "notes/a.md");
        assert_eq!(format!("{:?}", guid), "Guid(notes/a.md)");
    }

    #[test]
    fn content_hash_is_sha256_hex() {
        // sha256("hello")
        let hash = ContentHash::of("hello");
        assert_eq!(
            hash.as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn content_hash_matches_contents() {
        let hash = ContentHash::of("hello world");
        assert!(hash.matches("hello world"));
        assert!(!hash.matches("hello"));
    }

    #[test]
    fn content_hash_rejects_bad_hex() {
        assert!(ContentHash::from_hex("abc").is_err());
        assert!(ContentHash::from_hex(&"G".repeat(64)).is_err());
        assert!(ContentHash::from_hex(&"A".repeat(64)).is_err());
        assert!(ContentHash::from_hex(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn content_hash_serde_validates() {
        let json = serde_json::to_string(&ContentHash::of("x")).unwrap();
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ContentHash::of("x"));

        let bad: Result<ContentHash, _> = serde_json::from_str("\"nope\"");
        assert!(bad.is_err());
    }
}
