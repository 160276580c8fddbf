//! Resource cache identity and users.

use crate::error::MetadataResult;
use crate::models::{BaseResourceTypeRow, ResourceCacheRow, ResourceConfigRow};
use async_trait::async_trait;
use capstan_core::Version;
use time::OffsetDateTime;

/// A vicarious reference keeping a resource cache alive: a durable build,
/// or an in-memory build that has no durable row and expires on age alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceCacheUser {
    Build(i64),
    InMemoryBuild {
        id: i64,
        create_time: OffsetDateTime,
    },
}

/// Everything that identifies a resource cache: which type fetched it (by
/// base type name, or a parent cache for custom types), at which version,
/// with which source and params.
#[derive(Debug, Clone)]
pub struct ResourceCacheDescriptor {
    pub resource_type: String,
    pub version: Version,
    pub source: serde_json::Value,
    pub params: serde_json::Value,
    /// Set when the resource type's own image is a cached fetch; the
    /// config is then parented by that cache instead of a base type.
    pub created_by_resource_cache_id: Option<i64>,
}

/// A resource cache with its full ancestry, walked down to the origin base
/// resource type. `links[0]` is the requested cache; each subsequent link
/// is the cache backing the previous link's resource type image.
#[derive(Debug, Clone)]
pub struct ResourceCacheChain {
    pub links: Vec<(ResourceCacheRow, ResourceConfigRow)>,
    pub origin_base_resource_type: BaseResourceTypeRow,
}

impl ResourceCacheChain {
    pub fn cache(&self) -> &ResourceCacheRow {
        &self.links[0].0
    }
}

/// Repository for resource cache identities.
#[async_trait]
pub trait ResourceCacheRepo: Send + Sync {
    /// Upsert the cache identity and bind it to `user` in one transaction,
    /// so the cache cannot be collected out from under the operation that
    /// just requested it. Returns `BaseResourceTypeNotFound` when the type
    /// cannot be resolved.
    async fn find_or_create_resource_cache(
        &self,
        user: ResourceCacheUser,
        descriptor: &ResourceCacheDescriptor,
    ) -> MetadataResult<ResourceCacheRow>;

    /// Read-only lookup reconstructing the full parent chain.
    async fn find_resource_cache_by_id(
        &self,
        id: i64,
    ) -> MetadataResult<Option<ResourceCacheChain>>;

    /// The base resource type a cache transitively originates from.
    async fn origin_base_resource_type(
        &self,
        resource_cache_id: i64,
    ) -> MetadataResult<Option<BaseResourceTypeRow>>;
}
