//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// Workers & capabilities
// =============================================================================

/// Worker lifecycle state as reported by the worker registry.
///
/// Stalled workers are excluded from the missing/unknown/orphaned GC sweeps:
/// no trustworthy handle report exists for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Running,
    Stalled,
    Landing,
    Landed,
    Retiring,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stalled => "stalled",
            Self::Landing => "landing",
            Self::Landed => "landed",
            Self::Retiring => "retiring",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "stalled" => Some(Self::Stalled),
            "landing" => Some(Self::Landing),
            "landed" => Some(Self::Landed),
            "retiring" => Some(Self::Retiring),
            _ => None,
        }
    }
}

/// Worker record.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerRow {
    pub name: String,
    pub state: String,
    pub ephemeral: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Base resource type identity: a resource type implementation provided
/// directly by workers, keyed by name.
#[derive(Debug, Clone, FromRow)]
pub struct BaseResourceTypeRow {
    pub id: i64,
    pub name: String,
}

/// The capability a worker currently provides for a base resource type.
///
/// Replacing image/version retires the row's id; that retirement is what
/// invalidates cache placements tagged with it.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerBaseResourceTypeRow {
    pub id: i64,
    pub worker_name: String,
    pub base_resource_type_id: i64,
    pub image: String,
    pub version: String,
}

// =============================================================================
// Resource configs, scopes, versions
// =============================================================================

/// Content-addressed resource configuration identity.
///
/// Exactly one of `base_resource_type_id` / `resource_cache_id` is set: a
/// config is created either from a worker-provided base type or from a
/// custom type whose image is itself a resource cache.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceConfigRow {
    pub id: i64,
    pub base_resource_type_id: Option<i64>,
    pub resource_cache_id: Option<i64>,
    pub source_hash: String,
    pub source_ciphertext: Vec<u8>,
    pub source_nonce: Option<String>,
}

/// Version-history partition for a resource config.
///
/// `resource_id = NULL` means the history is shared across every resource
/// using the exact same config; otherwise it is private to one resource.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceConfigScopeRow {
    pub id: i64,
    pub resource_config_id: i64,
    pub resource_id: Option<i64>,
    pub last_check_start_time: Option<OffsetDateTime>,
    pub last_check_end_time: Option<OffsetDateTime>,
    pub last_check_succeeded: bool,
    pub last_check_build_id: Option<i64>,
    pub last_check_plan_ciphertext: Option<Vec<u8>>,
    pub last_check_plan_nonce: Option<String>,
}

/// A discovered version within a scope's ledger.
///
/// `check_order = 0` means the version is not yet part of the visible
/// history; orders are assigned (and re-assigned for out-of-order checks)
/// when a version batch is saved.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceConfigVersionRow {
    pub id: i64,
    pub resource_config_scope_id: i64,
    pub version: String,
    pub version_sha256: String,
    pub metadata: String,
    pub check_order: i64,
    pub span_context: Option<String>,
}

/// An active checking session for a resource config on a particular worker
/// capability. Owns resource-check containers; expiry orphans them.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceConfigCheckSessionRow {
    pub id: i64,
    pub resource_config_id: i64,
    pub worker_base_resource_type_id: i64,
    pub expires_at: OffsetDateTime,
}

// =============================================================================
// Resource caches & placement
// =============================================================================

/// Content-addressed resource cache identity: a config fetched at a version
/// with particular params. Created lazily, never mutated.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceCacheRow {
    pub id: i64,
    pub resource_config_id: i64,
    pub version: String,
    pub version_sha256: String,
    pub params_hash: String,
}

/// Record that a resource cache's bytes physically exist on a worker.
///
/// `worker_base_resource_type_id` is the capability generation that was
/// current when the cache was placed. It becomes NULL (and `invalid_since`
/// is stamped) when that capability is retired; the row itself is kept so
/// builds that started before the invalidation can still resolve it.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerResourceCacheRow {
    pub id: i64,
    pub worker_name: String,
    pub resource_cache_id: i64,
    pub worker_base_resource_type_id: Option<i64>,
    pub invalid_since: Option<OffsetDateTime>,
}

/// Task cache identity on a worker: (job, step, path).
#[derive(Debug, Clone, FromRow)]
pub struct WorkerTaskCacheRow {
    pub id: i64,
    pub worker_name: String,
    pub job_id: i64,
    pub step_name: String,
    pub path: String,
}

/// Resource certs bundle present on a worker.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerResourceCertsRow {
    pub id: i64,
    pub worker_name: String,
    pub certs_path: String,
}

/// A free-standing artifact produced by a build step.
#[derive(Debug, Clone, FromRow)]
pub struct WorkerArtifactRow {
    pub id: i64,
    pub name: String,
    pub build_id: Option<i64>,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Containers & volumes
// =============================================================================

/// Worker-side container record.
#[derive(Debug, Clone, FromRow)]
pub struct ContainerRow {
    pub id: i64,
    pub handle: String,
    pub worker_name: String,
    pub team_id: Option<i64>,
    pub state: String,
    pub plan_id: Option<String>,
    pub build_id: Option<i64>,
    pub image_check_container_id: Option<i64>,
    pub image_get_container_id: Option<i64>,
    pub resource_config_check_session_id: Option<i64>,
    pub missing_since: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Worker-side volume record.
///
/// At most one owner column is set; which one determines the volume type.
/// `parent_id`/`parent_state` form a composite foreign key to
/// `volumes(id, state)`, which is the mechanism that blocks destroying a
/// parent while children exist.
#[derive(Debug, Clone, FromRow)]
pub struct VolumeRow {
    pub id: i64,
    pub handle: String,
    pub worker_name: String,
    pub team_id: Option<i64>,
    pub state: String,
    pub path: Option<String>,
    pub parent_id: Option<i64>,
    pub parent_state: Option<String>,
    pub container_id: Option<i64>,
    pub worker_resource_cache_id: Option<i64>,
    pub worker_base_resource_type_id: Option<i64>,
    pub worker_task_cache_id: Option<i64>,
    pub worker_resource_certs_id: Option<i64>,
    pub worker_artifact_id: Option<i64>,
    pub missing_since: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Volume ownership kind, derived from which owner column is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeType {
    Container,
    Resource,
    ResourceType,
    TaskCache,
    ResourceCerts,
    Artifact,
    Unknown,
}

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Resource => "resource",
            Self::ResourceType => "resource-type",
            Self::TaskCache => "task-cache",
            Self::ResourceCerts => "resource-certs",
            Self::Artifact => "artifact",
            Self::Unknown => "unknown",
        }
    }
}

impl VolumeRow {
    /// Classify the volume by its owner columns. A blessed cache volume may
    /// still carry its originating container id, so the cache reference
    /// takes precedence.
    pub fn volume_type(&self) -> VolumeType {
        if self.worker_base_resource_type_id.is_some() {
            VolumeType::ResourceType
        } else if self.worker_resource_cache_id.is_some() {
            VolumeType::Resource
        } else if self.container_id.is_some() {
            VolumeType::Container
        } else if self.worker_task_cache_id.is_some() {
            VolumeType::TaskCache
        } else if self.worker_resource_certs_id.is_some() {
            VolumeType::ResourceCerts
        } else if self.worker_artifact_id.is_some() {
            VolumeType::Artifact
        } else {
            VolumeType::Unknown
        }
    }
}

// =============================================================================
// Builds, jobs, resources (collaborator surface)
// =============================================================================

/// Build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Errored => "errored",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Errored | Self::Aborted
        )
    }
}

/// Durable build record: the narrow surface the cache layer consumes from
/// the build registry (existence, interceptibility, completion, start time).
#[derive(Debug, Clone, FromRow)]
pub struct BuildRow {
    pub id: i64,
    pub name: String,
    pub team_id: Option<i64>,
    pub status: String,
    pub interceptible: bool,
    pub completed: bool,
    pub start_time: Option<OffsetDateTime>,
    pub end_time: Option<OffsetDateTime>,
}

/// Job record: consulted only to request rescheduling when new versions land.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub name: String,
    pub schedule_requested: Option<OffsetDateTime>,
}

/// Pipeline resource record: anchors per-resource scopes and keeps configs
/// reachable.
#[derive(Debug, Clone, FromRow)]
pub struct ResourceRow {
    pub id: i64,
    pub name: String,
    pub resource_config_id: Option<i64>,
    pub resource_config_scope_id: Option<i64>,
}
