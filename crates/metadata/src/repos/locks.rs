//! Named advisory locks.
//!
//! Distributed mutual exclusion beyond row-level conditional updates, for
//! operations that must not run twice concurrently for the same logical
//! resource (one lock per resource-config-scope serializes checking).
//! Acquisition is a conditional insert into the lock table; release is a
//! delete. Holders that die without releasing leave the row behind, so the
//! scheduler that drives checking should release on all paths.

use crate::error::MetadataResult;
use async_trait::async_trait;

/// The lock name serializing checks for a resource config scope.
pub fn scope_checking_lock_name(scope_id: i64) -> String {
    format!("resource-config-scope-checking:{scope_id}")
}

/// Repository for named advisory locks.
#[async_trait]
pub trait LockRepo: Send + Sync {
    /// Attempt to take the named lock. Returns false if it is already held.
    async fn try_acquire_lock(&self, name: &str) -> MetadataResult<bool>;

    /// Release the named lock. Returns false if it was not held.
    async fn release_lock(&self, name: &str) -> MetadataResult<bool>;
}
