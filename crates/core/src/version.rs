//! Resource version identity and check metadata.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A resource version: an ordered key-value document reported by a check.
///
/// Versions are content-addressed; the hash of the canonical JSON encoding
/// is the identity used for deduplication within a config scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(pub BTreeMap<String, String>);

impl Version {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor for single-field versions (`{"ref": "abc"}`).
    pub fn single(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(key.into(), value.into());
        Self(map)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The content hash identifying this version.
    pub fn content_hash(&self) -> crate::Result<ContentHash> {
        let bytes = serde_json::to_vec(&self.0)?;
        Ok(ContentHash::compute(&bytes))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Version {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

/// A named metadata field attached to a discovered version (commit author,
/// message, and the like). Purely informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

impl MetadataField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}
