//! Content hashes and cache key formats.
//!
//! Keys are derived from content alone so that two jobs submitting identical
//! media share cached embeddings and results.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 digest of a media item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Length of a hex-encoded SHA-256 digest.
    pub const HEX_LEN: usize = 64;

    /// Hash raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(format!("{:x}", digest))
    }

    /// Parse a caller-supplied digest. Uppercase hex is normalized.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() == Self::HEX_LEN && s.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(s.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cache key for an artifact derived from content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Intermediate feature embedding: `embed:{content_hash}`
    Embedding(ContentHash),
    /// Finalized detection result: `result:{content_hash}`
    Result(ContentHash),
}

impl CacheKey {
    pub fn embedding(hash: &ContentHash) -> Self {
        CacheKey::Embedding(hash.clone())
    }

    pub fn result(hash: &ContentHash) -> Self {
        CacheKey::Result(hash.clone())
    }

    /// Render the storage key.
    pub fn render(&self) -> String {
        match self {
            CacheKey::Embedding(h) => format!("embed:{}", h),
            CacheKey::Result(h) => format!("result:{}", h),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let a = ContentHash::of_bytes(b"same media");
        let b = ContentHash::of_bytes(b"same media");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), ContentHash::HEX_LEN);
        assert_ne!(a, ContentHash::of_bytes(b"other media"));
    }

    #[test]
    fn test_parse_normalizes_case() {
        let upper = "A".repeat(64);
        let parsed = ContentHash::parse(&upper).unwrap();
        assert_eq!(parsed.as_str(), "a".repeat(64));
    }

    #[test]
    fn test_parse_rejects_bad_digest() {
        assert!(ContentHash::parse("abc").is_none());
        assert!(ContentHash::parse(&"z".repeat(64)).is_none());
    }

    #[test]
    fn test_key_format() {
        let hash = ContentHash::parse(&"ab".repeat(32)).unwrap();
        assert_eq!(
            CacheKey::embedding(&hash).render(),
            format!("embed:{}", "ab".repeat(32))
        );
        assert_eq!(
            CacheKey::result(&hash).to_string(),
            format!("result:{}", "ab".repeat(32))
        );
    }
}
