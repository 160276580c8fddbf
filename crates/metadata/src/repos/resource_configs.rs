//! Resource config identity, scopes, and the version ledger.

use crate::error::MetadataResult;
use crate::models::{
    ResourceConfigCheckSessionRow, ResourceConfigRow, ResourceConfigScopeRow,
    ResourceConfigVersionRow,
};
use async_trait::async_trait;
use capstan_core::{MetadataField, SpanContext, Version};
use time::OffsetDateTime;

/// How a resource config comes into existence: directly from a
/// worker-provided base type, or from a custom type whose image is itself a
/// resource cache. Exactly one variant applies to any config.
#[derive(Debug, Clone)]
pub enum ResourceConfigDescriptor {
    BaseResourceType {
        name: String,
        source: serde_json::Value,
    },
    ResourceCache {
        resource_cache_id: i64,
        source: serde_json::Value,
    },
}

impl ResourceConfigDescriptor {
    pub fn source(&self) -> &serde_json::Value {
        match self {
            Self::BaseResourceType { source, .. } => source,
            Self::ResourceCache { source, .. } => source,
        }
    }
}

/// A version reported by a check, in the order the check reported it.
#[derive(Debug, Clone, Default)]
pub struct NewVersion {
    pub version: Version,
    pub metadata: Vec<MetadataField>,
    pub span_context: Option<SpanContext>,
}

impl NewVersion {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            metadata: Vec::new(),
            span_context: None,
        }
    }
}

/// Repository for resource configs, their scopes, and version history.
#[async_trait]
pub trait ResourceConfigRepo: Send + Sync {
    /// Upsert the content-addressed config row for a descriptor. Returns
    /// `BaseResourceTypeNotFound` when the named base type is not
    /// registered, and `ResourceCacheDisappeared` when the parent cache is
    /// gone.
    async fn find_or_create_resource_config(
        &self,
        descriptor: &ResourceConfigDescriptor,
    ) -> MetadataResult<ResourceConfigRow>;

    /// Upsert the scope row keyed by (config, resource-or-shared). A
    /// resource migrating between shared and per-resource scoping gets a
    /// distinct scope.
    async fn find_or_create_resource_config_scope(
        &self,
        resource_config_id: i64,
        resource_id: Option<i64>,
    ) -> MetadataResult<ResourceConfigScopeRow>;

    /// Save a batch of versions in the order the check reported them.
    ///
    /// Idempotent per version content hash; non-empty metadata is merged on
    /// conflict. If any version in the batch is new, the check order of
    /// every version in the batch is re-bumped to reflect the reported
    /// order, and jobs consuming this scope without passed constraints are
    /// flagged for rescheduling (in descending job id order, to keep lock
    /// acquisition ordering consistent across scopes). Returns the number
    /// of genuinely new versions.
    async fn save_versions(
        &self,
        scope_id: i64,
        versions: &[NewVersion],
    ) -> MetadataResult<usize>;

    /// The scope's most recent version by check order, if any is visible.
    async fn latest_version(
        &self,
        scope_id: i64,
    ) -> MetadataResult<Option<ResourceConfigVersionRow>>;

    /// Look up a specific version by content.
    async fn find_version(
        &self,
        scope_id: i64,
        version: &Version,
    ) -> MetadataResult<Option<ResourceConfigVersionRow>>;

    /// All visible versions, newest check order first.
    async fn versions(&self, scope_id: i64) -> MetadataResult<Vec<ResourceConfigVersionRow>>;

    /// Record that a check started, with the build and plan that ran it.
    /// Returns false if the scope is gone.
    async fn update_last_check_start(
        &self,
        scope_id: i64,
        build_id: Option<i64>,
        plan: Option<&serde_json::Value>,
    ) -> MetadataResult<bool>;

    /// Record that a check finished. Returns false if the scope is gone.
    async fn update_last_check_end(&self, scope_id: i64, succeeded: bool)
        -> MetadataResult<bool>;

    /// Find or create the active check session for a config on a worker
    /// capability. Sessions own resource-check containers; once expired
    /// they stop justifying the container's existence.
    async fn find_or_create_check_session(
        &self,
        resource_config_id: i64,
        worker_base_resource_type_id: i64,
        expires_at: OffsetDateTime,
    ) -> MetadataResult<ResourceConfigCheckSessionRow>;
}
