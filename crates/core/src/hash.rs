//! Content hashing for identity columns.
//!
//! Resource configs, caches, and versions are content-addressed: two
//! identical source/params/version documents must hash to the same value on
//! every node in the cluster. Hashing therefore goes through a canonical
//! JSON encoding (object keys sorted) before SHA-256.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 content hash represented as 32 bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Create a new ContentHash from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute SHA-256 hash of data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidHash(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex_str =
                std::str::from_utf8(chunk).map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidHash(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash an arbitrary JSON document canonically.
///
/// `serde_json` keeps object keys in a sorted map, so serializing a `Value`
/// yields a canonical byte sequence regardless of the key order the caller
/// built the document in.
pub fn json_hash(value: &serde_json::Value) -> crate::Result<ContentHash> {
    let bytes = serde_json::to_vec(value)?;
    Ok(ContentHash::compute(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let hash = ContentHash::compute(b"hello world");
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
    }

    #[test]
    fn test_from_hex_rejects_bad_length() {
        assert!(ContentHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_json_hash_is_key_order_independent() {
        let a = json!({"uri": "git://example.com", "branch": "main"});
        let b = json!({"branch": "main", "uri": "git://example.com"});
        assert_eq!(json_hash(&a).unwrap(), json_hash(&b).unwrap());
    }

    #[test]
    fn test_json_hash_distinguishes_values() {
        let a = json!({"branch": "main"});
        let b = json!({"branch": "dev"});
        assert_ne!(json_hash(&a).unwrap(), json_hash(&b).unwrap());
    }
}
