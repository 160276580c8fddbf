//! Opaque span-context carrier for distributed tracing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A propagated trace context, persisted alongside versions and replayed
/// when related work resumes. The store treats the contents as opaque.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpanContext(pub BTreeMap<String, String>);

impl SpanContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
