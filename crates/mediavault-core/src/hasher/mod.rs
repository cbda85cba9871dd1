//! Content identity: stable 256-bit hashes over file content.
//!
//! Identity is computed before any enrichment touches a file. Formats whose
//! mutable metadata can be cleanly separated from the payload (MP3 ID3 tags,
//! PNG text chunks) are hashed over a metadata-free view once the stream
//! parses as that format; everything else is hashed over the full byte
//! stream, so editing embedded metadata in those formats changes identity.

pub mod identity;
pub mod xxhash;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use identity::{hash_bytes, hash_file, hash_reader, HashingReader};
pub use xxhash::partial_hash_reader;

/// Hex-encoded BLAKE3 digest identifying an asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentHash(String);

impl ContentHash {
    pub const HEX_LEN: usize = 64;

    pub fn from_digest(hash: blake3::Hash) -> Self {
        ContentHash(hash.to_hex().to_string())
    }

    pub fn parse(s: &str) -> Result<Self, crate::Error> {
        let s = s.trim().to_ascii_lowercase();
        if s.len() != Self::HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(crate::Error::Other(format!("'{}' is not a content hash", s)));
        }
        Ok(ContentHash(s))
    }

    /// Values read back from the registry were validated on the way in.
    pub(crate) fn from_stored(s: String) -> Self {
        ContentHash(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ContentHash {
    type Error = crate::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ContentHash::parse(&value)
    }
}

impl From<ContentHash> for String {
    fn from(value: ContentHash) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case() {
        let upper = "AB".repeat(32);
        let hash = ContentHash::parse(&upper).unwrap();
        assert_eq!(hash.as_str(), "ab".repeat(32));
        assert_eq!(hash.short().len(), 12);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ContentHash::parse("abc").is_err());
        assert!(ContentHash::parse(&"zz".repeat(32)).is_err());
    }
}
