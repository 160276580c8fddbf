//! Base resource type identity registry.

use crate::error::MetadataResult;
use crate::models::BaseResourceTypeRow;
use async_trait::async_trait;

/// Repository for base resource type identities.
#[async_trait]
pub trait BaseResourceTypeRepo: Send + Sync {
    /// Return the stable id for a base resource type name, creating it if
    /// new. Concurrent callers racing to create the same name converge on
    /// one id (upsert-on-conflict, never check-then-insert).
    async fn find_or_create_base_resource_type(
        &self,
        name: &str,
    ) -> MetadataResult<BaseResourceTypeRow>;

    /// Look up a base resource type by name.
    async fn find_base_resource_type(
        &self,
        name: &str,
    ) -> MetadataResult<Option<BaseResourceTypeRow>>;
}
