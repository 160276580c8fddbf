//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    BaseResourceTypeRepo, BuildRepo, ContainerRepo, GcRepo, LockRepo, ResourceCacheRepo,
    ResourceConfigRepo, VolumeRepo, WorkerRepo, WorkerResourceCacheRepo,
};
use async_trait::async_trait;
use capstan_core::EncryptionStrategy;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    WorkerRepo
    + BaseResourceTypeRepo
    + ResourceConfigRepo
    + ResourceCacheRepo
    + WorkerResourceCacheRepo
    + ContainerRepo
    + VolumeRepo
    + BuildRepo
    + GcRepo
    + LockRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    encryption: Arc<dyn EncryptionStrategy>,
}

impl SqliteStore {
    /// Create a new SQLite store and run migrations.
    pub async fn new(
        path: impl AsRef<Path>,
        busy_timeout_secs: Option<u64>,
        encryption: Arc<dyn EncryptionStrategy>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MetadataError::Config(format!("creating {parent:?}: {e}")))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // Prevent transient "database is locked" errors under concurrent access.
            .busy_timeout(StdDuration::from_secs(busy_timeout_secs.unwrap_or(5)));

        let pool = SqlitePoolOptions::new()
            // SQLite permits limited write concurrency; a single connection
            // serializes the short transactions this store issues and avoids
            // persistent "database is locked" failures under load.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool, encryption };
        store.migrate().await?;

        tracing::info!(path = %path.display(), "opened metadata store");

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::error::{is_foreign_key_violation, is_unique_violation};
    use crate::models::*;
    use crate::repos::{
        ContainerOwner, NewVersion, ResourceCacheChain, ResourceCacheDescriptor,
        ResourceCacheUser, ResourceConfigDescriptor, WorkerResourceTypeSpec,
    };
    use crate::state::LifecycleState;
    use capstan_core::{json_hash, Version};
    use sqlx::SqliteConnection;
    use std::collections::HashSet;
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn now() -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(", ")
    }

    fn new_handle() -> String {
        Uuid::new_v4().to_string()
    }

    fn encode_json<T: serde::Serialize>(value: &T) -> MetadataResult<String> {
        serde_json::to_string(value)
            .map_err(|e| MetadataError::Internal(format!("encoding json: {e}")))
    }

    // =========================================================================
    // Transaction-scoped helpers shared across repositories
    // =========================================================================

    async fn find_or_create_base_resource_type_tx(
        conn: &mut SqliteConnection,
        name: &str,
    ) -> MetadataResult<BaseResourceTypeRow> {
        // Upsert-on-conflict so concurrent first creators converge on one id.
        // The no-op DO UPDATE makes RETURNING yield the existing row.
        let row = sqlx::query_as::<_, BaseResourceTypeRow>(
            "INSERT INTO base_resource_types (name) VALUES (?)
             ON CONFLICT(name) DO UPDATE SET name = excluded.name
             RETURNING id, name",
        )
        .bind(name)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    async fn find_base_resource_type_tx(
        conn: &mut SqliteConnection,
        name: &str,
    ) -> MetadataResult<Option<BaseResourceTypeRow>> {
        let row = sqlx::query_as::<_, BaseResourceTypeRow>(
            "SELECT * FROM base_resource_types WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(conn)
        .await?;
        Ok(row)
    }

    /// Which parent a resource config hangs off.
    enum ConfigParent {
        BaseResourceType(i64),
        ResourceCache(i64),
    }

    async fn find_or_create_resource_config_tx(
        conn: &mut SqliteConnection,
        encryption: &dyn EncryptionStrategy,
        parent: ConfigParent,
        source: &serde_json::Value,
    ) -> MetadataResult<ResourceConfigRow> {
        let (parent_column, parent_id) = match parent {
            ConfigParent::BaseResourceType(id) => ("base_resource_type_id", id),
            ConfigParent::ResourceCache(id) => ("resource_cache_id", id),
        };

        let source_hash = json_hash(source)?.to_hex();

        let select_sql =
            format!("SELECT * FROM resource_configs WHERE {parent_column} = ? AND source_hash = ?");

        if let Some(row) = sqlx::query_as::<_, ResourceConfigRow>(&select_sql)
            .bind(parent_id)
            .bind(&source_hash)
            .fetch_optional(&mut *conn)
            .await?
        {
            return Ok(row);
        }

        let source_bytes =
            serde_json::to_vec(source).map_err(|e| MetadataError::Internal(e.to_string()))?;
        let (ciphertext, nonce) = encryption.encrypt(&source_bytes)?;

        // INSERT OR IGNORE + re-select rather than ON CONFLICT: the identity
        // index is partial (one per parent kind), which upsert conflict
        // targets cannot name.
        let insert_sql = format!(
            "INSERT OR IGNORE INTO resource_configs
                 ({parent_column}, source_hash, source_ciphertext, source_nonce)
             VALUES (?, ?, ?, ?)"
        );
        sqlx::query(&insert_sql)
            .bind(parent_id)
            .bind(&source_hash)
            .bind(&ciphertext)
            .bind(&nonce)
            .execute(&mut *conn)
            .await?;

        sqlx::query_as::<_, ResourceConfigRow>(&select_sql)
            .bind(parent_id)
            .bind(&source_hash)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| {
                MetadataError::Internal("resource config vanished during upsert".to_string())
            })
    }

    async fn find_or_create_worker_resource_cache_tx(
        conn: &mut SqliteConnection,
        worker_name: &str,
        resource_cache_id: i64,
        worker_base_resource_type_id: i64,
    ) -> MetadataResult<(WorkerResourceCacheRow, bool)> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO worker_resource_caches
                 (worker_name, resource_cache_id, worker_base_resource_type_id)
             VALUES (?, ?, ?)",
        )
        .bind(worker_name)
        .bind(resource_cache_id)
        .bind(worker_base_resource_type_id)
        .execute(&mut *conn)
        .await?;

        let created = result.rows_affected() > 0;

        let row = sqlx::query_as::<_, WorkerResourceCacheRow>(
            "SELECT * FROM worker_resource_caches WHERE worker_name = ? AND resource_cache_id = ?",
        )
        .bind(worker_name)
        .bind(resource_cache_id)
        .fetch_one(&mut *conn)
        .await?;

        Ok((row, created))
    }

    /// Walk the cache -> config -> parent cache chain down to the origin
    /// base resource type. An explicit loop with a seen-set, not recursion:
    /// chains are caller-constructed data and must not be trusted to be
    /// acyclic.
    async fn resource_cache_chain_tx(
        conn: &mut SqliteConnection,
        id: i64,
    ) -> MetadataResult<Option<ResourceCacheChain>> {
        let mut links: Vec<(ResourceCacheRow, ResourceConfigRow)> = Vec::new();
        let mut seen: HashSet<i64> = HashSet::new();
        let mut current = id;

        loop {
            if !seen.insert(current) {
                return Err(MetadataError::InvalidResourceCacheChain(format!(
                    "cycle through resource cache {current}"
                )));
            }

            let cache = sqlx::query_as::<_, ResourceCacheRow>(
                "SELECT * FROM resource_caches WHERE id = ?",
            )
            .bind(current)
            .fetch_optional(&mut *conn)
            .await?;

            let cache = match cache {
                Some(cache) => cache,
                None if links.is_empty() => return Ok(None),
                None => {
                    return Err(MetadataError::InvalidResourceCacheChain(format!(
                        "parent cache {current} disappeared"
                    )))
                }
            };

            let config = sqlx::query_as::<_, ResourceConfigRow>(
                "SELECT * FROM resource_configs WHERE id = ?",
            )
            .bind(cache.resource_config_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| {
                MetadataError::InvalidResourceCacheChain(format!(
                    "config {} for cache {} disappeared",
                    cache.resource_config_id, cache.id
                ))
            })?;

            if let Some(brt_id) = config.base_resource_type_id {
                let origin = sqlx::query_as::<_, BaseResourceTypeRow>(
                    "SELECT * FROM base_resource_types WHERE id = ?",
                )
                .bind(brt_id)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| {
                    MetadataError::InvalidResourceCacheChain(format!(
                        "base resource type {brt_id} disappeared"
                    ))
                })?;

                links.push((cache, config));
                return Ok(Some(ResourceCacheChain {
                    links,
                    origin_base_resource_type: origin,
                }));
            }

            let parent = config.resource_cache_id.ok_or_else(|| {
                MetadataError::InvalidResourceCacheChain(format!(
                    "config {} has neither base type nor parent cache",
                    config.id
                ))
            })?;

            links.push((cache, config));
            current = parent;
        }
    }

    /// The worker's current capability row for the cache's origin base
    /// resource type, plus the origin type name for error reporting.
    async fn find_worker_capability_for_cache_tx(
        conn: &mut SqliteConnection,
        worker_name: &str,
        resource_cache_id: i64,
    ) -> MetadataResult<(Option<i64>, String)> {
        let chain = resource_cache_chain_tx(&mut *conn, resource_cache_id)
            .await?
            .ok_or(MetadataError::ResourceCacheDisappeared(resource_cache_id))?;
        let origin = chain.origin_base_resource_type;

        let wbrt: Option<(i64,)> = sqlx::query_as(
            "SELECT wbrt.id
             FROM worker_base_resource_types wbrt
             JOIN base_resource_types brt ON brt.id = wbrt.base_resource_type_id
             WHERE wbrt.worker_name = ? AND brt.name = ?",
        )
        .bind(worker_name)
        .bind(&origin.name)
        .fetch_optional(&mut *conn)
        .await?;

        Ok((wbrt.map(|(id,)| id), origin.name))
    }

    // =========================================================================
    // Lifecycle state machine
    // =========================================================================

    enum TransitionOutcome {
        Done,
        Gone,
        WrongState(String),
    }

    /// Apply a conditional state transition and classify the result.
    ///
    /// The WHERE clause accepts both source and target state, so a retried
    /// transition is a no-op success. Zero affected rows is classified by a
    /// follow-up read rather than guessed at.
    async fn lifecycle_transition(
        pool: &Pool<Sqlite>,
        table: &'static str,
        id: i64,
        target: LifecycleState,
    ) -> MetadataResult<TransitionOutcome> {
        let source = target.transition_source().ok_or_else(|| {
            MetadataError::Internal(format!("{target} is not a transition target"))
        })?;

        let update_sql = format!("UPDATE {table} SET state = ? WHERE id = ? AND state IN (?, ?)");
        let result = sqlx::query(&update_sql)
            .bind(target.as_str())
            .bind(id)
            .bind(source.as_str())
            .bind(target.as_str())
            .execute(pool)
            .await?;

        if result.rows_affected() > 0 {
            return Ok(TransitionOutcome::Done);
        }

        let select_sql = format!("SELECT state FROM {table} WHERE id = ?");
        let current: Option<(String,)> = sqlx::query_as(&select_sql)
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(match current {
            None => TransitionOutcome::Gone,
            Some((state,)) => TransitionOutcome::WrongState(state),
        })
    }

    // =========================================================================
    // Workers & capabilities
    // =========================================================================

    #[async_trait]
    impl WorkerRepo for SqliteStore {
        async fn save_worker(
            &self,
            name: &str,
            state: WorkerState,
            ephemeral: bool,
            resource_types: &[WorkerResourceTypeSpec],
        ) -> MetadataResult<WorkerRow> {
            let mut tx = self.pool.begin().await?;
            let saved_at = now();

            // A worker mid-landing/retiring that re-registers as running
            // keeps its lifecycle state; only an explicit flip changes it.
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT state FROM workers WHERE name = ?")
                    .bind(name)
                    .fetch_optional(&mut *tx)
                    .await?;

            let effective_state = match (&existing, state) {
                (Some((current,)), WorkerState::Running)
                    if current == "landing" || current == "retiring" =>
                {
                    current.clone()
                }
                _ => state.as_str().to_string(),
            };

            let worker = sqlx::query_as::<_, WorkerRow>(
                "INSERT INTO workers (name, state, ephemeral, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(name) DO UPDATE SET
                     state = excluded.state,
                     ephemeral = excluded.ephemeral,
                     updated_at = excluded.updated_at
                 RETURNING *",
            )
            .bind(name)
            .bind(&effective_state)
            .bind(ephemeral)
            .bind(saved_at)
            .bind(saved_at)
            .fetch_one(&mut *tx)
            .await?;

            let mut fresh_ids: Vec<i64> = Vec::with_capacity(resource_types.len());

            for spec in resource_types {
                let brt = find_or_create_base_resource_type_tx(&mut tx, &spec.resource_type)
                    .await?;

                // A changed image/version retires the old capability id.
                // Placements tagged with it lose their capability reference
                // (and get stamped) before the row goes away.
                let invalidated = sqlx::query(
                    "UPDATE worker_resource_caches
                     SET worker_base_resource_type_id = NULL, invalid_since = ?
                     WHERE worker_base_resource_type_id IN (
                         SELECT id FROM worker_base_resource_types
                         WHERE worker_name = ? AND base_resource_type_id = ?
                           AND (image != ? OR version != ?))",
                )
                .bind(saved_at)
                .bind(name)
                .bind(brt.id)
                .bind(&spec.image)
                .bind(&spec.version)
                .execute(&mut *tx)
                .await?;

                if invalidated.rows_affected() > 0 {
                    tracing::debug!(
                        worker = name,
                        resource_type = %spec.resource_type,
                        placements = invalidated.rows_affected(),
                        "capability changed; invalidated cache placements"
                    );
                }

                sqlx::query(
                    "DELETE FROM worker_base_resource_types
                     WHERE worker_name = ? AND base_resource_type_id = ?
                       AND (image != ? OR version != ?)",
                )
                .bind(name)
                .bind(brt.id)
                .bind(&spec.image)
                .bind(&spec.version)
                .execute(&mut *tx)
                .await?;

                let wbrt = sqlx::query_as::<_, WorkerBaseResourceTypeRow>(
                    "INSERT INTO worker_base_resource_types
                         (worker_name, base_resource_type_id, image, version)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(worker_name, base_resource_type_id) DO UPDATE SET
                         image = excluded.image,
                         version = excluded.version
                     RETURNING *",
                )
                .bind(name)
                .bind(brt.id)
                .bind(&spec.image)
                .bind(&spec.version)
                .fetch_one(&mut *tx)
                .await?;

                fresh_ids.push(wbrt.id);
            }

            // Resource types dropped from the report retire their capability
            // rows the same way.
            if fresh_ids.is_empty() {
                sqlx::query(
                    "UPDATE worker_resource_caches
                     SET worker_base_resource_type_id = NULL, invalid_since = ?
                     WHERE worker_base_resource_type_id IN (
                         SELECT id FROM worker_base_resource_types WHERE worker_name = ?)",
                )
                .bind(saved_at)
                .bind(name)
                .execute(&mut *tx)
                .await?;

                sqlx::query("DELETE FROM worker_base_resource_types WHERE worker_name = ?")
                    .bind(name)
                    .execute(&mut *tx)
                    .await?;
            } else {
                let ph = placeholders(fresh_ids.len());

                let sql = format!(
                    "UPDATE worker_resource_caches
                     SET worker_base_resource_type_id = NULL, invalid_since = ?
                     WHERE worker_base_resource_type_id IN (
                         SELECT id FROM worker_base_resource_types
                         WHERE worker_name = ? AND id NOT IN ({ph}))"
                );
                let mut query = sqlx::query(&sql).bind(saved_at).bind(name);
                for id in &fresh_ids {
                    query = query.bind(id);
                }
                query.execute(&mut *tx).await?;

                let sql = format!(
                    "DELETE FROM worker_base_resource_types
                     WHERE worker_name = ? AND id NOT IN ({ph})"
                );
                let mut query = sqlx::query(&sql).bind(name);
                for id in &fresh_ids {
                    query = query.bind(id);
                }
                query.execute(&mut *tx).await?;
            }

            tx.commit().await?;
            Ok(worker)
        }

        async fn find_worker(&self, name: &str) -> MetadataResult<Option<WorkerRow>> {
            let row = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn workers(&self) -> MetadataResult<Vec<WorkerRow>> {
            let rows = sqlx::query_as::<_, WorkerRow>("SELECT * FROM workers ORDER BY name")
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn set_worker_state(
            &self,
            name: &str,
            state: WorkerState,
        ) -> MetadataResult<bool> {
            let result = sqlx::query("UPDATE workers SET state = ?, updated_at = ? WHERE name = ?")
                .bind(state.as_str())
                .bind(now())
                .bind(name)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn prune_worker(&self, name: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM workers WHERE name = ?")
                .bind(name)
                .execute(&self.pool)
                .await?;

            if result.rows_affected() > 0 {
                tracing::info!(worker = name, "pruned worker");
            }

            Ok(result.rows_affected() > 0)
        }
    }

    #[async_trait]
    impl BaseResourceTypeRepo for SqliteStore {
        async fn find_or_create_base_resource_type(
            &self,
            name: &str,
        ) -> MetadataResult<BaseResourceTypeRow> {
            let mut conn = self.pool.acquire().await?;
            find_or_create_base_resource_type_tx(&mut conn, name).await
        }

        async fn find_base_resource_type(
            &self,
            name: &str,
        ) -> MetadataResult<Option<BaseResourceTypeRow>> {
            let mut conn = self.pool.acquire().await?;
            find_base_resource_type_tx(&mut conn, name).await
        }
    }

    // =========================================================================
    // Resource configs, scopes, versions
    // =========================================================================

    #[async_trait]
    impl ResourceConfigRepo for SqliteStore {
        async fn find_or_create_resource_config(
            &self,
            descriptor: &ResourceConfigDescriptor,
        ) -> MetadataResult<ResourceConfigRow> {
            let mut tx = self.pool.begin().await?;

            let config = match descriptor {
                ResourceConfigDescriptor::BaseResourceType { name, source } => {
                    let brt = find_base_resource_type_tx(&mut tx, name).await?.ok_or_else(
                        || MetadataError::BaseResourceTypeNotFound { name: name.clone() },
                    )?;
                    find_or_create_resource_config_tx(
                        &mut tx,
                        self.encryption.as_ref(),
                        ConfigParent::BaseResourceType(brt.id),
                        source,
                    )
                    .await?
                }
                ResourceConfigDescriptor::ResourceCache {
                    resource_cache_id,
                    source,
                } => {
                    let parent: Option<(i64,)> =
                        sqlx::query_as("SELECT id FROM resource_caches WHERE id = ?")
                            .bind(resource_cache_id)
                            .fetch_optional(&mut *tx)
                            .await?;
                    if parent.is_none() {
                        return Err(MetadataError::ResourceCacheDisappeared(*resource_cache_id));
                    }
                    find_or_create_resource_config_tx(
                        &mut tx,
                        self.encryption.as_ref(),
                        ConfigParent::ResourceCache(*resource_cache_id),
                        source,
                    )
                    .await?
                }
            };

            tx.commit().await?;
            Ok(config)
        }

        async fn find_or_create_resource_config_scope(
            &self,
            resource_config_id: i64,
            resource_id: Option<i64>,
        ) -> MetadataResult<ResourceConfigScopeRow> {
            let mut tx = self.pool.begin().await?;

            // The identity indexes are partial (shared vs per-resource), so
            // this is select, insert-or-ignore, re-select rather than a
            // single upsert.
            let select_sql = match resource_id {
                Some(_) => {
                    "SELECT * FROM resource_config_scopes
                     WHERE resource_config_id = ? AND resource_id = ?"
                }
                None => {
                    "SELECT * FROM resource_config_scopes
                     WHERE resource_config_id = ? AND resource_id IS NULL"
                }
            };

            let mut select =
                sqlx::query_as::<_, ResourceConfigScopeRow>(select_sql).bind(resource_config_id);
            if let Some(rid) = resource_id {
                select = select.bind(rid);
            }
            if let Some(row) = select.fetch_optional(&mut *tx).await? {
                tx.commit().await?;
                return Ok(row);
            }

            sqlx::query(
                "INSERT OR IGNORE INTO resource_config_scopes (resource_config_id, resource_id)
                 VALUES (?, ?)",
            )
            .bind(resource_config_id)
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;

            let mut select =
                sqlx::query_as::<_, ResourceConfigScopeRow>(select_sql).bind(resource_config_id);
            if let Some(rid) = resource_id {
                select = select.bind(rid);
            }
            let row = select.fetch_optional(&mut *tx).await?.ok_or_else(|| {
                MetadataError::Internal("resource config scope vanished during upsert".to_string())
            })?;

            tx.commit().await?;
            Ok(row)
        }

        async fn save_versions(
            &self,
            scope_id: i64,
            versions: &[NewVersion],
        ) -> MetadataResult<usize> {
            let mut tx = self.pool.begin().await?;

            let mut batch_hashes: Vec<String> = Vec::with_capacity(versions.len());
            let mut new_count = 0usize;

            for v in versions {
                let version_json = encode_json(&v.version)?;
                let version_sha = v.version.content_hash()?.to_hex();
                let metadata_json = encode_json(&v.metadata)?;
                let span_json = match &v.span_context {
                    Some(ctx) => Some(encode_json(ctx)?),
                    None => None,
                };

                // Idempotent per content hash; a re-reported version keeps
                // its row, merging any newly supplied metadata.
                let (check_order,): (i64,) = sqlx::query_as(
                    "INSERT INTO resource_config_versions
                         (resource_config_scope_id, version, version_sha256, metadata, span_context)
                     VALUES (?, ?, ?, ?, ?)
                     ON CONFLICT(resource_config_scope_id, version_sha256) DO UPDATE SET
                         metadata = CASE
                             WHEN excluded.metadata != '[]' THEN excluded.metadata
                             ELSE resource_config_versions.metadata
                         END,
                         span_context = COALESCE(excluded.span_context, resource_config_versions.span_context)
                     RETURNING check_order",
                )
                .bind(scope_id)
                .bind(&version_json)
                .bind(&version_sha)
                .bind(&metadata_json)
                .bind(&span_json)
                .fetch_one(&mut *tx)
                .await?;

                if check_order == 0 {
                    new_count += 1;
                }
                batch_hashes.push(version_sha);
            }

            if new_count > 0 {
                // Any novelty re-bumps every version in the batch, in the
                // reported order: a check implementation that returns
                // versions out of historical order still ends up with the
                // reported ordering as the visible history.
                for version_sha in &batch_hashes {
                    sqlx::query(
                        "UPDATE resource_config_versions
                         SET check_order = (
                             SELECT COALESCE(MAX(check_order), 0) + 1
                             FROM resource_config_versions
                             WHERE resource_config_scope_id = ?1)
                         WHERE resource_config_scope_id = ?1
                           AND version_sha256 = ?2
                           AND check_order <= (
                             SELECT COALESCE(MAX(check_order), 0)
                             FROM resource_config_versions
                             WHERE resource_config_scope_id = ?1)",
                    )
                    .bind(scope_id)
                    .bind(version_sha)
                    .execute(&mut *tx)
                    .await?;
                }

                // Descending job id order keeps row-lock acquisition
                // consistent when multiple scopes flag overlapping job sets
                // concurrently.
                let job_ids: Vec<(i64,)> = sqlx::query_as(
                    "SELECT DISTINCT j.id
                     FROM jobs j
                     JOIN job_scope_inputs jsi ON jsi.job_id = j.id
                     WHERE jsi.resource_config_scope_id = ? AND jsi.passed_constrained = 0
                     ORDER BY j.id DESC",
                )
                .bind(scope_id)
                .fetch_all(&mut *tx)
                .await?;

                let requested_at = now();
                for (job_id,) in &job_ids {
                    sqlx::query("UPDATE jobs SET schedule_requested = ? WHERE id = ?")
                        .bind(requested_at)
                        .bind(job_id)
                        .execute(&mut *tx)
                        .await?;
                }

                tracing::debug!(
                    scope_id,
                    new_versions = new_count,
                    jobs_flagged = job_ids.len(),
                    "saved new resource versions"
                );
            }

            tx.commit().await?;
            Ok(new_count)
        }

        async fn latest_version(
            &self,
            scope_id: i64,
        ) -> MetadataResult<Option<ResourceConfigVersionRow>> {
            let row = sqlx::query_as::<_, ResourceConfigVersionRow>(
                "SELECT * FROM resource_config_versions
                 WHERE resource_config_scope_id = ? AND check_order > 0
                 ORDER BY check_order DESC
                 LIMIT 1",
            )
            .bind(scope_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_version(
            &self,
            scope_id: i64,
            version: &Version,
        ) -> MetadataResult<Option<ResourceConfigVersionRow>> {
            let version_sha = version.content_hash()?.to_hex();
            let row = sqlx::query_as::<_, ResourceConfigVersionRow>(
                "SELECT * FROM resource_config_versions
                 WHERE resource_config_scope_id = ? AND version_sha256 = ?",
            )
            .bind(scope_id)
            .bind(&version_sha)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn versions(
            &self,
            scope_id: i64,
        ) -> MetadataResult<Vec<ResourceConfigVersionRow>> {
            let rows = sqlx::query_as::<_, ResourceConfigVersionRow>(
                "SELECT * FROM resource_config_versions
                 WHERE resource_config_scope_id = ? AND check_order > 0
                 ORDER BY check_order DESC",
            )
            .bind(scope_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn update_last_check_start(
            &self,
            scope_id: i64,
            build_id: Option<i64>,
            plan: Option<&serde_json::Value>,
        ) -> MetadataResult<bool> {
            let (ciphertext, nonce) = match plan {
                Some(plan) => {
                    let bytes = serde_json::to_vec(plan)
                        .map_err(|e| MetadataError::Internal(e.to_string()))?;
                    let (ciphertext, nonce) = self.encryption.encrypt(&bytes)?;
                    (Some(ciphertext), nonce)
                }
                None => (None, None),
            };

            let result = sqlx::query(
                "UPDATE resource_config_scopes
                 SET last_check_start_time = ?,
                     last_check_build_id = ?,
                     last_check_plan_ciphertext = ?,
                     last_check_plan_nonce = ?
                 WHERE id = ?",
            )
            .bind(now())
            .bind(build_id)
            .bind(&ciphertext)
            .bind(&nonce)
            .bind(scope_id)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() > 0)
        }

        async fn update_last_check_end(
            &self,
            scope_id: i64,
            succeeded: bool,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE resource_config_scopes
                 SET last_check_end_time = ?, last_check_succeeded = ?
                 WHERE id = ?",
            )
            .bind(now())
            .bind(succeeded)
            .bind(scope_id)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected() > 0)
        }

        async fn find_or_create_check_session(
            &self,
            resource_config_id: i64,
            worker_base_resource_type_id: i64,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<ResourceConfigCheckSessionRow> {
            let mut tx = self.pool.begin().await?;

            // Expired sessions don't count; the caller gets a fresh one and
            // the expired row waits for the session GC pass.
            let existing = sqlx::query_as::<_, ResourceConfigCheckSessionRow>(
                "SELECT * FROM resource_config_check_sessions
                 WHERE resource_config_id = ? AND worker_base_resource_type_id = ?
                   AND expires_at > ?",
            )
            .bind(resource_config_id)
            .bind(worker_base_resource_type_id)
            .bind(now())
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                tx.commit().await?;
                return Ok(row);
            }

            let row = sqlx::query_as::<_, ResourceConfigCheckSessionRow>(
                "INSERT INTO resource_config_check_sessions
                     (resource_config_id, worker_base_resource_type_id, expires_at)
                 VALUES (?, ?, ?)
                 RETURNING *",
            )
            .bind(resource_config_id)
            .bind(worker_base_resource_type_id)
            .bind(expires_at)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row)
        }
    }

    // =========================================================================
    // Resource caches & placement
    // =========================================================================

    #[async_trait]
    impl ResourceCacheRepo for SqliteStore {
        async fn find_or_create_resource_cache(
            &self,
            user: ResourceCacheUser,
            descriptor: &ResourceCacheDescriptor,
        ) -> MetadataResult<ResourceCacheRow> {
            let mut tx = self.pool.begin().await?;

            let config = match descriptor.created_by_resource_cache_id {
                Some(parent_id) => {
                    let parent: Option<(i64,)> =
                        sqlx::query_as("SELECT id FROM resource_caches WHERE id = ?")
                            .bind(parent_id)
                            .fetch_optional(&mut *tx)
                            .await?;
                    if parent.is_none() {
                        return Err(MetadataError::ResourceCacheDisappeared(parent_id));
                    }
                    find_or_create_resource_config_tx(
                        &mut tx,
                        self.encryption.as_ref(),
                        ConfigParent::ResourceCache(parent_id),
                        &descriptor.source,
                    )
                    .await?
                }
                None => {
                    let brt = find_base_resource_type_tx(&mut tx, &descriptor.resource_type)
                        .await?
                        .ok_or_else(|| MetadataError::BaseResourceTypeNotFound {
                            name: descriptor.resource_type.clone(),
                        })?;
                    find_or_create_resource_config_tx(
                        &mut tx,
                        self.encryption.as_ref(),
                        ConfigParent::BaseResourceType(brt.id),
                        &descriptor.source,
                    )
                    .await?
                }
            };

            let version_json = encode_json(&descriptor.version)?;
            let version_sha = descriptor.version.content_hash()?.to_hex();
            let params_hash = json_hash(&descriptor.params)?.to_hex();

            let cache = sqlx::query_as::<_, ResourceCacheRow>(
                "INSERT INTO resource_caches
                     (resource_config_id, version, version_sha256, params_hash)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(resource_config_id, version_sha256, params_hash) DO UPDATE SET
                     version = excluded.version
                 RETURNING *",
            )
            .bind(config.id)
            .bind(&version_json)
            .bind(&version_sha)
            .bind(&params_hash)
            .fetch_one(&mut *tx)
            .await?;

            // The user row rides in the same transaction, so the cache
            // cannot be collected out from under the operation that just
            // requested it.
            match user {
                ResourceCacheUser::Build(build_id) => {
                    sqlx::query(
                        "INSERT OR IGNORE INTO resource_cache_users (resource_cache_id, build_id)
                         VALUES (?, ?)",
                    )
                    .bind(cache.id)
                    .bind(build_id)
                    .execute(&mut *tx)
                    .await?;
                }
                ResourceCacheUser::InMemoryBuild { id, create_time } => {
                    sqlx::query(
                        "INSERT OR IGNORE INTO resource_cache_users
                             (resource_cache_id, in_memory_build_id, in_memory_build_create_time)
                         VALUES (?, ?, ?)",
                    )
                    .bind(cache.id)
                    .bind(id)
                    .bind(create_time)
                    .execute(&mut *tx)
                    .await?;
                }
            }

            tx.commit().await?;
            Ok(cache)
        }

        async fn find_resource_cache_by_id(
            &self,
            id: i64,
        ) -> MetadataResult<Option<ResourceCacheChain>> {
            let mut conn = self.pool.acquire().await?;
            resource_cache_chain_tx(&mut conn, id).await
        }

        async fn origin_base_resource_type(
            &self,
            resource_cache_id: i64,
        ) -> MetadataResult<Option<BaseResourceTypeRow>> {
            let chain = self.find_resource_cache_by_id(resource_cache_id).await?;
            Ok(chain.map(|c| c.origin_base_resource_type))
        }
    }

    #[async_trait]
    impl WorkerResourceCacheRepo for SqliteStore {
        async fn find_worker_resource_cache(
            &self,
            worker_name: &str,
            resource_cache_id: i64,
            as_of: OffsetDateTime,
        ) -> MetadataResult<Option<WorkerResourceCacheRow>> {
            // A placement is usable if its capability reference is intact,
            // or if it was invalidated after the caller's build started.
            let row = sqlx::query_as::<_, WorkerResourceCacheRow>(
                "SELECT * FROM worker_resource_caches
                 WHERE worker_name = ? AND resource_cache_id = ?
                   AND (worker_base_resource_type_id IS NOT NULL OR invalid_since > ?)",
            )
            .bind(worker_name)
            .bind(resource_cache_id)
            .bind(as_of)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_or_create_worker_resource_cache(
            &self,
            worker_name: &str,
            resource_cache_id: i64,
            worker_base_resource_type_id: i64,
        ) -> MetadataResult<(WorkerResourceCacheRow, bool)> {
            let mut tx = self.pool.begin().await?;
            let out = find_or_create_worker_resource_cache_tx(
                &mut tx,
                worker_name,
                resource_cache_id,
                worker_base_resource_type_id,
            )
            .await?;
            tx.commit().await?;
            Ok(out)
        }
    }

    // =========================================================================
    // Containers
    // =========================================================================

    // Owner-gone predicate; requires the FROM clause below and one bind
    // (now) for session expiry.
    const ORPHANED_CONTAINER_PREDICATE: &str = "
        (c.build_id IS NULL AND c.image_check_container_id IS NULL
         AND c.image_get_container_id IS NULL AND c.resource_config_check_session_id IS NULL)
        OR (c.build_id IS NOT NULL AND (b.id IS NULL OR b.interceptible = 0))
        OR (c.image_check_container_id IS NOT NULL AND (icc.id IS NULL OR icc.state != 'creating'))
        OR (c.image_get_container_id IS NOT NULL AND (igc.id IS NULL OR igc.state != 'creating'))
        OR (c.resource_config_check_session_id IS NOT NULL
            AND (rccs.id IS NULL OR rccs.expires_at <= ?))";

    const ORPHANED_CONTAINER_FROM: &str = "
        FROM containers c
        LEFT JOIN builds b ON b.id = c.build_id
        LEFT JOIN containers icc ON icc.id = c.image_check_container_id
        LEFT JOIN containers igc ON igc.id = c.image_get_container_id
        LEFT JOIN resource_config_check_sessions rccs
            ON rccs.id = c.resource_config_check_session_id";

    #[async_trait]
    impl ContainerRepo for SqliteStore {
        async fn create_container(
            &self,
            worker_name: &str,
            owner: &ContainerOwner,
            team_id: Option<i64>,
        ) -> MetadataResult<ContainerRow> {
            let handle = new_handle();
            let created_at = now();

            // One insert per owner kind; each variant contributes exactly
            // its own columns.
            let row = match owner {
                ContainerOwner::Build { build_id, plan_id } => {
                    sqlx::query_as::<_, ContainerRow>(
                        "INSERT INTO containers
                             (handle, worker_name, team_id, state, build_id, plan_id, created_at)
                         VALUES (?, ?, ?, 'creating', ?, ?, ?)
                         RETURNING *",
                    )
                    .bind(&handle)
                    .bind(worker_name)
                    .bind(team_id)
                    .bind(build_id)
                    .bind(plan_id)
                    .bind(created_at)
                    .fetch_one(&self.pool)
                    .await?
                }
                ContainerOwner::ImageCheck { container_id } => {
                    sqlx::query_as::<_, ContainerRow>(
                        "INSERT INTO containers
                             (handle, worker_name, team_id, state, image_check_container_id, created_at)
                         VALUES (?, ?, ?, 'creating', ?, ?)
                         RETURNING *",
                    )
                    .bind(&handle)
                    .bind(worker_name)
                    .bind(team_id)
                    .bind(container_id)
                    .bind(created_at)
                    .fetch_one(&self.pool)
                    .await?
                }
                ContainerOwner::ImageGet { container_id } => {
                    sqlx::query_as::<_, ContainerRow>(
                        "INSERT INTO containers
                             (handle, worker_name, team_id, state, image_get_container_id, created_at)
                         VALUES (?, ?, ?, 'creating', ?, ?)
                         RETURNING *",
                    )
                    .bind(&handle)
                    .bind(worker_name)
                    .bind(team_id)
                    .bind(container_id)
                    .bind(created_at)
                    .fetch_one(&self.pool)
                    .await?
                }
                ContainerOwner::ResourceConfigCheckSession { session_id } => {
                    sqlx::query_as::<_, ContainerRow>(
                        "INSERT INTO containers
                             (handle, worker_name, team_id, state, resource_config_check_session_id, created_at)
                         VALUES (?, ?, ?, 'creating', ?, ?)
                         RETURNING *",
                    )
                    .bind(&handle)
                    .bind(worker_name)
                    .bind(team_id)
                    .bind(session_id)
                    .bind(created_at)
                    .fetch_one(&self.pool)
                    .await?
                }
            };

            Ok(row)
        }

        async fn find_container_by_handle(
            &self,
            handle: &str,
        ) -> MetadataResult<Option<ContainerRow>> {
            let row =
                sqlx::query_as::<_, ContainerRow>("SELECT * FROM containers WHERE handle = ?")
                    .bind(handle)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn find_container_for_owner(
            &self,
            worker_name: &str,
            owner: &ContainerOwner,
        ) -> MetadataResult<Option<ContainerRow>> {
            let row = match owner {
                ContainerOwner::Build { build_id, plan_id } => {
                    sqlx::query_as::<_, ContainerRow>(
                        "SELECT * FROM containers
                         WHERE worker_name = ? AND build_id = ? AND plan_id = ?
                         ORDER BY id DESC
                         LIMIT 1",
                    )
                    .bind(worker_name)
                    .bind(build_id)
                    .bind(plan_id)
                    .fetch_optional(&self.pool)
                    .await?
                }
                ContainerOwner::ImageCheck { container_id } => {
                    sqlx::query_as::<_, ContainerRow>(
                        "SELECT * FROM containers
                         WHERE worker_name = ? AND image_check_container_id = ?
                         ORDER BY id DESC
                         LIMIT 1",
                    )
                    .bind(worker_name)
                    .bind(container_id)
                    .fetch_optional(&self.pool)
                    .await?
                }
                ContainerOwner::ImageGet { container_id } => {
                    sqlx::query_as::<_, ContainerRow>(
                        "SELECT * FROM containers
                         WHERE worker_name = ? AND image_get_container_id = ?
                         ORDER BY id DESC
                         LIMIT 1",
                    )
                    .bind(worker_name)
                    .bind(container_id)
                    .fetch_optional(&self.pool)
                    .await?
                }
                ContainerOwner::ResourceConfigCheckSession { session_id } => {
                    sqlx::query_as::<_, ContainerRow>(
                        "SELECT * FROM containers
                         WHERE worker_name = ? AND resource_config_check_session_id = ?
                         ORDER BY id DESC
                         LIMIT 1",
                    )
                    .bind(worker_name)
                    .bind(session_id)
                    .fetch_optional(&self.pool)
                    .await?
                }
            };
            Ok(row)
        }

        async fn container_created(&self, id: i64) -> MetadataResult<()> {
            match lifecycle_transition(&self.pool, "containers", id, LifecycleState::Created)
                .await?
            {
                TransitionOutcome::Done => Ok(()),
                TransitionOutcome::Gone => Err(MetadataError::ContainerDisappeared(id)),
                TransitionOutcome::WrongState(_) => Err(MetadataError::ContainerMarkStateFailed {
                    id,
                    state: LifecycleState::Created,
                }),
            }
        }

        async fn container_failed(&self, id: i64) -> MetadataResult<()> {
            match lifecycle_transition(&self.pool, "containers", id, LifecycleState::Failed)
                .await?
            {
                TransitionOutcome::Done => Ok(()),
                TransitionOutcome::Gone => Err(MetadataError::ContainerDisappeared(id)),
                TransitionOutcome::WrongState(_) => Err(MetadataError::ContainerMarkStateFailed {
                    id,
                    state: LifecycleState::Failed,
                }),
            }
        }

        async fn container_destroying(&self, id: i64) -> MetadataResult<()> {
            match lifecycle_transition(&self.pool, "containers", id, LifecycleState::Destroying)
                .await?
            {
                TransitionOutcome::Done => Ok(()),
                TransitionOutcome::Gone => Err(MetadataError::ContainerDisappeared(id)),
                TransitionOutcome::WrongState(_) => Err(MetadataError::ContainerMarkStateFailed {
                    id,
                    state: LifecycleState::Destroying,
                }),
            }
        }

        async fn destroy_container(&self, id: i64) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM containers WHERE id = ? AND state IN ('destroying', 'failed')",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn find_orphaned_containers(&self) -> MetadataResult<Vec<ContainerRow>> {
            let sql = format!(
                "SELECT c.* {ORPHANED_CONTAINER_FROM} WHERE ({ORPHANED_CONTAINER_PREDICATE})
                 ORDER BY c.id"
            );
            let rows = sqlx::query_as::<_, ContainerRow>(&sql)
                .bind(now())
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn destroy_orphaned_containers(&self) -> MetadataResult<u64> {
            // Bulk sweep at the repository level: orphans go straight to
            // destroying without walking the per-row state machine.
            let sql = format!(
                "UPDATE containers SET state = 'destroying'
                 WHERE state IN ('creating', 'created')
                   AND id IN (SELECT c.id {ORPHANED_CONTAINER_FROM}
                              WHERE ({ORPHANED_CONTAINER_PREDICATE}))"
            );
            let result = sqlx::query(&sql).bind(now()).execute(&self.pool).await?;

            if result.rows_affected() > 0 {
                tracing::debug!(
                    count = result.rows_affected(),
                    "moved orphaned containers to destroying"
                );
            }

            Ok(result.rows_affected())
        }

        async fn destroy_failed_containers(&self) -> MetadataResult<u64> {
            let result =
                sqlx::query("UPDATE containers SET state = 'destroying' WHERE state = 'failed'")
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        }

        async fn find_destroying_container_handles(
            &self,
            worker_name: &str,
        ) -> MetadataResult<Vec<String>> {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT handle FROM containers
                 WHERE worker_name = ? AND state = 'destroying'
                 ORDER BY handle",
            )
            .bind(worker_name)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|(h,)| h).collect())
        }

        async fn remove_destroying_containers(
            &self,
            worker_name: &str,
            still_held: &[String],
        ) -> MetadataResult<u64> {
            let result = if still_held.is_empty() {
                sqlx::query("DELETE FROM containers WHERE worker_name = ? AND state = 'destroying'")
                    .bind(worker_name)
                    .execute(&self.pool)
                    .await?
            } else {
                let ph = placeholders(still_held.len());
                let sql = format!(
                    "DELETE FROM containers
                     WHERE worker_name = ? AND state = 'destroying' AND handle NOT IN ({ph})"
                );
                let mut query = sqlx::query(&sql).bind(worker_name);
                for handle in still_held {
                    query = query.bind(handle);
                }
                query.execute(&self.pool).await?
            };

            Ok(result.rows_affected())
        }

        async fn update_containers_missing_since(
            &self,
            worker_name: &str,
            reported_handles: &[String],
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            let marked_at = now();

            if !reported_handles.is_empty() {
                let ph = placeholders(reported_handles.len());
                let sql = format!(
                    "UPDATE containers SET missing_since = NULL
                     WHERE worker_name = ? AND missing_since IS NOT NULL AND handle IN ({ph})"
                );
                let mut query = sqlx::query(&sql).bind(worker_name);
                for handle in reported_handles {
                    query = query.bind(handle);
                }
                query.execute(&mut *tx).await?;
            }

            let db_handles: Vec<(String,)> = sqlx::query_as(
                "SELECT handle FROM containers WHERE worker_name = ? AND missing_since IS NULL",
            )
            .bind(worker_name)
            .fetch_all(&mut *tx)
            .await?;

            let reported: HashSet<&str> = reported_handles.iter().map(|h| h.as_str()).collect();
            let unreported: Vec<&str> = db_handles
                .iter()
                .map(|(h,)| h.as_str())
                .filter(|h| !reported.contains(h))
                .collect();

            if !unreported.is_empty() {
                let ph = placeholders(unreported.len());
                // a creating container may legitimately not exist on the
                // worker yet
                let sql = format!(
                    "UPDATE containers SET missing_since = ?
                     WHERE worker_name = ? AND state != 'creating' AND handle IN ({ph})"
                );
                let mut query = sqlx::query(&sql).bind(marked_at).bind(worker_name);
                for handle in &unreported {
                    query = query.bind(*handle);
                }
                query.execute(&mut *tx).await?;
            }

            tx.commit().await?;
            Ok(())
        }

        async fn remove_missing_containers(
            &self,
            grace_period: Duration,
        ) -> MetadataResult<u64> {
            let cutoff = now() - grace_period;
            let result = sqlx::query(
                "DELETE FROM containers WHERE id IN (
                     SELECT c.id FROM containers c
                     JOIN workers w ON w.name = c.worker_name
                     WHERE c.state = 'created' AND w.state != 'stalled'
                       AND c.missing_since IS NOT NULL AND c.missing_since < ?)",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected())
        }

        async fn destroy_unknown_containers(
            &self,
            worker_name: &str,
            reported_handles: &[String],
        ) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;

            let db_handles: Vec<(String,)> =
                sqlx::query_as("SELECT handle FROM containers WHERE worker_name = ?")
                    .bind(worker_name)
                    .fetch_all(&mut *tx)
                    .await?;

            let known: HashSet<&str> = db_handles.iter().map(|(h,)| h.as_str()).collect();
            let unknown: Vec<&str> = reported_handles
                .iter()
                .map(|h| h.as_str())
                .filter(|h| !known.contains(h))
                .collect();

            if unknown.is_empty() {
                return Ok(0);
            }

            let created_at = now();
            for handle in &unknown {
                sqlx::query(
                    "INSERT INTO containers (handle, worker_name, state, created_at)
                     VALUES (?, ?, 'destroying', ?)",
                )
                .bind(*handle)
                .bind(worker_name)
                .bind(created_at)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;

            tracing::debug!(
                worker = worker_name,
                count = unknown.len(),
                "marked unknown containers for destruction"
            );

            Ok(unknown.len() as u64)
        }
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    async fn find_or_create_worker_task_cache_tx(
        conn: &mut SqliteConnection,
        worker_name: &str,
        job_id: i64,
        step_name: &str,
        path: &str,
    ) -> MetadataResult<WorkerTaskCacheRow> {
        let row = sqlx::query_as::<_, WorkerTaskCacheRow>(
            "INSERT INTO worker_task_caches (worker_name, job_id, step_name, path)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(worker_name, job_id, step_name, path) DO UPDATE SET
                 path = excluded.path
             RETURNING *",
        )
        .bind(worker_name)
        .bind(job_id)
        .bind(step_name)
        .bind(path)
        .fetch_one(conn)
        .await?;
        Ok(row)
    }

    #[async_trait]
    impl VolumeRepo for SqliteStore {
        async fn find_or_create_worker_task_cache(
            &self,
            worker_name: &str,
            job_id: i64,
            step_name: &str,
            path: &str,
        ) -> MetadataResult<WorkerTaskCacheRow> {
            let mut conn = self.pool.acquire().await?;
            find_or_create_worker_task_cache_tx(&mut conn, worker_name, job_id, step_name, path)
                .await
        }

        async fn find_or_create_worker_resource_certs(
            &self,
            worker_name: &str,
            certs_path: &str,
        ) -> MetadataResult<WorkerResourceCertsRow> {
            let row = sqlx::query_as::<_, WorkerResourceCertsRow>(
                "INSERT INTO worker_resource_certs (worker_name, certs_path)
                 VALUES (?, ?)
                 ON CONFLICT(worker_name, certs_path) DO UPDATE SET
                     certs_path = excluded.certs_path
                 RETURNING *",
            )
            .bind(worker_name)
            .bind(certs_path)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn create_container_volume(
            &self,
            worker_name: &str,
            container_id: i64,
            path: &str,
            team_id: Option<i64>,
        ) -> MetadataResult<VolumeRow> {
            let row = sqlx::query_as::<_, VolumeRow>(
                "INSERT INTO volumes
                     (handle, worker_name, team_id, state, path, container_id, created_at)
                 VALUES (?, ?, ?, 'creating', ?, ?, ?)
                 RETURNING *",
            )
            .bind(new_handle())
            .bind(worker_name)
            .bind(team_id)
            .bind(path)
            .bind(container_id)
            .bind(now())
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn create_base_resource_type_volume(
            &self,
            worker_base_resource_type_id: i64,
            team_id: Option<i64>,
        ) -> MetadataResult<VolumeRow> {
            let worker: Option<(String,)> = sqlx::query_as(
                "SELECT worker_name FROM worker_base_resource_types WHERE id = ?",
            )
            .bind(worker_base_resource_type_id)
            .fetch_optional(&self.pool)
            .await?;

            let (worker_name,) = worker.ok_or_else(|| {
                MetadataError::NotFound(format!(
                    "worker base resource type {worker_base_resource_type_id}"
                ))
            })?;

            let row = sqlx::query_as::<_, VolumeRow>(
                "INSERT INTO volumes
                     (handle, worker_name, team_id, state, worker_base_resource_type_id, created_at)
                 VALUES (?, ?, ?, 'creating', ?, ?)
                 RETURNING *",
            )
            .bind(new_handle())
            .bind(&worker_name)
            .bind(team_id)
            .bind(worker_base_resource_type_id)
            .bind(now())
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn create_task_cache_volume(
            &self,
            worker_task_cache_id: i64,
            team_id: Option<i64>,
        ) -> MetadataResult<VolumeRow> {
            let worker: Option<(String,)> =
                sqlx::query_as("SELECT worker_name FROM worker_task_caches WHERE id = ?")
                    .bind(worker_task_cache_id)
                    .fetch_optional(&self.pool)
                    .await?;

            let (worker_name,) = worker.ok_or_else(|| {
                MetadataError::NotFound(format!("worker task cache {worker_task_cache_id}"))
            })?;

            let row = sqlx::query_as::<_, VolumeRow>(
                "INSERT INTO volumes
                     (handle, worker_name, team_id, state, worker_task_cache_id, created_at)
                 VALUES (?, ?, ?, 'creating', ?, ?)
                 RETURNING *",
            )
            .bind(new_handle())
            .bind(&worker_name)
            .bind(team_id)
            .bind(worker_task_cache_id)
            .bind(now())
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn create_resource_certs_volume(
            &self,
            worker_resource_certs_id: i64,
        ) -> MetadataResult<VolumeRow> {
            let worker: Option<(String,)> =
                sqlx::query_as("SELECT worker_name FROM worker_resource_certs WHERE id = ?")
                    .bind(worker_resource_certs_id)
                    .fetch_optional(&self.pool)
                    .await?;

            let (worker_name,) = worker.ok_or_else(|| {
                MetadataError::NotFound(format!(
                    "worker resource certs {worker_resource_certs_id}"
                ))
            })?;

            let row = sqlx::query_as::<_, VolumeRow>(
                "INSERT INTO volumes
                     (handle, worker_name, state, worker_resource_certs_id, created_at)
                 VALUES (?, ?, 'creating', ?, ?)
                 RETURNING *",
            )
            .bind(new_handle())
            .bind(&worker_name)
            .bind(worker_resource_certs_id)
            .bind(now())
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn create_child_volume(
            &self,
            parent_id: i64,
            container_id: i64,
            path: &str,
        ) -> MetadataResult<VolumeRow> {
            let parent = sqlx::query_as::<_, VolumeRow>("SELECT * FROM volumes WHERE id = ?")
                .bind(parent_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(MetadataError::VolumeMissing(parent_id))?;

            if parent.state != "created" {
                return Err(MetadataError::Internal(format!(
                    "parent volume {} is {}, not created",
                    parent_id, parent.state
                )));
            }

            // parent_state pins 'created' through the composite foreign key;
            // the parent cannot leave created while this row exists.
            let row = sqlx::query_as::<_, VolumeRow>(
                "INSERT INTO volumes
                     (handle, worker_name, team_id, state, path,
                      parent_id, parent_state, container_id, created_at)
                 VALUES (?, ?, ?, 'creating', ?, ?, 'created', ?, ?)
                 RETURNING *",
            )
            .bind(new_handle())
            .bind(&parent.worker_name)
            .bind(parent.team_id)
            .bind(path)
            .bind(parent_id)
            .bind(container_id)
            .bind(now())
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_volume_by_handle(
            &self,
            handle: &str,
        ) -> MetadataResult<Option<VolumeRow>> {
            let row = sqlx::query_as::<_, VolumeRow>("SELECT * FROM volumes WHERE handle = ?")
                .bind(handle)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn find_resource_cache_volume(
            &self,
            worker_name: &str,
            resource_cache_id: i64,
            as_of: OffsetDateTime,
        ) -> MetadataResult<Option<VolumeRow>> {
            let placement = self
                .find_worker_resource_cache(worker_name, resource_cache_id, as_of)
                .await?;

            let placement = match placement {
                Some(placement) => placement,
                None => return Ok(None),
            };

            let row = sqlx::query_as::<_, VolumeRow>(
                "SELECT * FROM volumes
                 WHERE worker_resource_cache_id = ? AND state = 'created'",
            )
            .bind(placement.id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_container_volumes(
            &self,
            container_id: i64,
        ) -> MetadataResult<Vec<VolumeRow>> {
            let rows = sqlx::query_as::<_, VolumeRow>(
                "SELECT * FROM volumes WHERE container_id = ? AND state = 'created' ORDER BY id",
            )
            .bind(container_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn volume_created(&self, id: i64) -> MetadataResult<()> {
            match lifecycle_transition(&self.pool, "volumes", id, LifecycleState::Created).await? {
                TransitionOutcome::Done => Ok(()),
                TransitionOutcome::Gone => Err(MetadataError::VolumeMissing(id)),
                TransitionOutcome::WrongState(_) => Err(MetadataError::VolumeMarkCreatedFailed(id)),
            }
        }

        async fn volume_failed(&self, id: i64) -> MetadataResult<()> {
            match lifecycle_transition(&self.pool, "volumes", id, LifecycleState::Failed).await? {
                TransitionOutcome::Done => Ok(()),
                TransitionOutcome::Gone => Err(MetadataError::VolumeMissing(id)),
                TransitionOutcome::WrongState(_) => Err(MetadataError::VolumeMarkStateFailed {
                    id,
                    state: LifecycleState::Failed,
                }),
            }
        }

        async fn volume_destroying(&self, id: i64) -> MetadataResult<()> {
            let outcome =
                lifecycle_transition(&self.pool, "volumes", id, LifecycleState::Destroying).await;

            match outcome {
                Err(MetadataError::Database(err)) if is_foreign_key_violation(&err) => Err(
                    MetadataError::VolumeCannotBeDestroyedWithChildrenPresent(id),
                ),
                Err(err) => Err(err),
                Ok(TransitionOutcome::Done) => Ok(()),
                Ok(TransitionOutcome::Gone) => Err(MetadataError::VolumeMissing(id)),
                Ok(TransitionOutcome::WrongState(_)) => Err(MetadataError::VolumeMarkStateFailed {
                    id,
                    state: LifecycleState::Destroying,
                }),
            }
        }

        async fn destroy_volume(&self, id: i64) -> MetadataResult<bool> {
            let result = sqlx::query(
                "DELETE FROM volumes WHERE id = ? AND state IN ('destroying', 'failed')",
            )
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn initialize_resource_cache(
            &self,
            volume_id: i64,
            resource_cache_id: i64,
        ) -> MetadataResult<Option<WorkerResourceCacheRow>> {
            let mut tx = self.pool.begin().await?;

            let volume = sqlx::query_as::<_, VolumeRow>("SELECT * FROM volumes WHERE id = ?")
                .bind(volume_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(MetadataError::VolumeMissing(volume_id))?;

            if volume.state != "created" {
                return Err(MetadataError::Internal(format!(
                    "volume {} is {}, expected created",
                    volume_id, volume.state
                )));
            }

            let (capability, origin_name) = find_worker_capability_for_cache_tx(
                &mut tx,
                &volume.worker_name,
                resource_cache_id,
            )
            .await?;

            let wbrt_id = capability.ok_or_else(|| {
                MetadataError::WorkerBaseResourceTypeDisappeared {
                    worker: volume.worker_name.clone(),
                    name: origin_name,
                }
            })?;

            self.bless_cache_volume(tx, volume_id, resource_cache_id, &volume.worker_name, wbrt_id)
                .await
        }

        async fn initialize_streamed_resource_cache(
            &self,
            volume_id: i64,
            resource_cache_id: i64,
            source_worker_resource_cache_id: i64,
        ) -> MetadataResult<Option<WorkerResourceCacheRow>> {
            let mut tx = self.pool.begin().await?;

            let volume = sqlx::query_as::<_, VolumeRow>("SELECT * FROM volumes WHERE id = ?")
                .bind(volume_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(MetadataError::VolumeMissing(volume_id))?;

            if volume.state != "created" {
                return Err(MetadataError::Internal(format!(
                    "volume {} is {}, expected created",
                    volume_id, volume.state
                )));
            }

            let source = sqlx::query_as::<_, WorkerResourceCacheRow>(
                "SELECT * FROM worker_resource_caches WHERE id = ?",
            )
            .bind(source_worker_resource_cache_id)
            .fetch_optional(&mut *tx)
            .await?;

            // The source placement disappearing or losing its capability
            // reference means the cache was invalidated after the step
            // started streaming. The volume keeps its bytes for the build;
            // it just doesn't become a cache.
            let source = match source {
                Some(source) => source,
                None => return Ok(None),
            };
            if source.worker_base_resource_type_id.is_none() {
                return Ok(None);
            }

            // The placement is tagged with the destination worker's own
            // capability: each worker's placement validity stays independent
            // of the worker the bytes came from.
            let (capability, _origin_name) = find_worker_capability_for_cache_tx(
                &mut tx,
                &volume.worker_name,
                resource_cache_id,
            )
            .await?;

            let wbrt_id = match capability {
                Some(id) => id,
                None => return Ok(None),
            };

            self.bless_cache_volume(tx, volume_id, resource_cache_id, &volume.worker_name, wbrt_id)
                .await
        }

        async fn initialize_task_cache(
            &self,
            volume_id: i64,
            job_id: i64,
            step_name: &str,
            path: &str,
        ) -> MetadataResult<bool> {
            let mut tx = self.pool.begin().await?;

            let volume = sqlx::query_as::<_, VolumeRow>("SELECT * FROM volumes WHERE id = ?")
                .bind(volume_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(MetadataError::VolumeMissing(volume_id))?;

            let task_cache = find_or_create_worker_task_cache_tx(
                &mut tx,
                &volume.worker_name,
                job_id,
                step_name,
                path,
            )
            .await?;

            // Detach any previously blessed volume so it gets collected as
            // an ordinary orphan.
            sqlx::query("UPDATE volumes SET worker_task_cache_id = NULL WHERE worker_task_cache_id = ?")
                .bind(task_cache.id)
                .execute(&mut *tx)
                .await?;

            let result = sqlx::query("UPDATE volumes SET worker_task_cache_id = ? WHERE id = ?")
                .bind(task_cache.id)
                .bind(volume_id)
                .execute(&mut *tx)
                .await;

            match result {
                Err(err) if is_unique_violation(&err) => {
                    // another volume was blessed as the cache volume - leave
                    // this one owned by its container
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
                Ok(result) if result.rows_affected() == 0 => {
                    return Err(MetadataError::VolumeMissing(volume_id));
                }
                Ok(_) => {}
            }

            tx.commit().await?;
            Ok(true)
        }

        async fn initialize_artifact(
            &self,
            volume_id: i64,
            name: &str,
            build_id: Option<i64>,
        ) -> MetadataResult<WorkerArtifactRow> {
            let mut tx = self.pool.begin().await?;

            let artifact = sqlx::query_as::<_, WorkerArtifactRow>(
                "INSERT INTO worker_artifacts (name, build_id, created_at)
                 VALUES (?, ?, ?)
                 RETURNING *",
            )
            .bind(name)
            .bind(build_id)
            .bind(now())
            .fetch_one(&mut *tx)
            .await?;

            let result = sqlx::query("UPDATE volumes SET worker_artifact_id = ? WHERE id = ?")
                .bind(artifact.id)
                .bind(volume_id)
                .execute(&mut *tx)
                .await?;

            if result.rows_affected() == 0 {
                return Err(MetadataError::VolumeMissing(volume_id));
            }

            tx.commit().await?;
            Ok(artifact)
        }

        async fn find_orphaned_volumes(&self) -> MetadataResult<Vec<VolumeRow>> {
            let rows = sqlx::query_as::<_, VolumeRow>(
                "SELECT v.* FROM volumes v
                 JOIN workers w ON w.name = v.worker_name
                 WHERE v.state = 'created'
                   AND v.container_id IS NULL
                   AND v.worker_resource_cache_id IS NULL
                   AND v.worker_base_resource_type_id IS NULL
                   AND v.worker_task_cache_id IS NULL
                   AND v.worker_resource_certs_id IS NULL
                   AND v.worker_artifact_id IS NULL
                   AND w.state IN ('running', 'landing', 'retiring')
                 ORDER BY v.id",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn destroy_orphaned_volumes(&self) -> MetadataResult<u64> {
            let orphaned = self.find_orphaned_volumes().await?;

            let mut count = 0u64;
            for volume in orphaned {
                match self.volume_destroying(volume.id).await {
                    Ok(()) => count += 1,
                    // children go first; the parent is picked up next pass
                    Err(MetadataError::VolumeCannotBeDestroyedWithChildrenPresent(_)) => {}
                    // raced with another destroyer or the worker sweep
                    Err(MetadataError::VolumeMissing(_))
                    | Err(MetadataError::VolumeMarkStateFailed { .. }) => {}
                    Err(err) => return Err(err),
                }
            }

            if count > 0 {
                tracing::debug!(count, "moved orphaned volumes to destroying");
            }

            Ok(count)
        }

        async fn destroy_failed_volumes(&self) -> MetadataResult<u64> {
            let result = sqlx::query("DELETE FROM volumes WHERE state = 'failed'")
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected())
        }

        async fn find_destroying_volume_handles(
            &self,
            worker_name: &str,
        ) -> MetadataResult<Vec<String>> {
            let rows: Vec<(String,)> = sqlx::query_as(
                "SELECT handle FROM volumes
                 WHERE worker_name = ? AND state = 'destroying'
                 ORDER BY handle",
            )
            .bind(worker_name)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(|(h,)| h).collect())
        }

        async fn remove_destroying_volumes(
            &self,
            worker_name: &str,
            still_held: &[String],
        ) -> MetadataResult<u64> {
            let result = if still_held.is_empty() {
                sqlx::query("DELETE FROM volumes WHERE worker_name = ? AND state = 'destroying'")
                    .bind(worker_name)
                    .execute(&self.pool)
                    .await?
            } else {
                let ph = placeholders(still_held.len());
                let sql = format!(
                    "DELETE FROM volumes
                     WHERE worker_name = ? AND state = 'destroying' AND handle NOT IN ({ph})"
                );
                let mut query = sqlx::query(&sql).bind(worker_name);
                for handle in still_held {
                    query = query.bind(handle);
                }
                query.execute(&self.pool).await?
            };

            Ok(result.rows_affected())
        }

        async fn update_volumes_missing_since(
            &self,
            worker_name: &str,
            reported_handles: &[String],
        ) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            let marked_at = now();

            if !reported_handles.is_empty() {
                let ph = placeholders(reported_handles.len());
                let sql = format!(
                    "UPDATE volumes SET missing_since = NULL
                     WHERE worker_name = ? AND missing_since IS NOT NULL AND handle IN ({ph})"
                );
                let mut query = sqlx::query(&sql).bind(worker_name);
                for handle in reported_handles {
                    query = query.bind(handle);
                }
                query.execute(&mut *tx).await?;
            }

            let db_handles: Vec<(String,)> = sqlx::query_as(
                "SELECT handle FROM volumes WHERE worker_name = ? AND missing_since IS NULL",
            )
            .bind(worker_name)
            .fetch_all(&mut *tx)
            .await?;

            let reported: HashSet<&str> = reported_handles.iter().map(|h| h.as_str()).collect();
            let unreported: Vec<&str> = db_handles
                .iter()
                .map(|(h,)| h.as_str())
                .filter(|h| !reported.contains(h))
                .collect();

            if !unreported.is_empty() {
                let ph = placeholders(unreported.len());
                let sql = format!(
                    "UPDATE volumes SET missing_since = ?
                     WHERE worker_name = ? AND state != 'creating' AND handle IN ({ph})"
                );
                let mut query = sqlx::query(&sql).bind(marked_at).bind(worker_name);
                for handle in &unreported {
                    query = query.bind(*handle);
                }
                query.execute(&mut *tx).await?;
            }

            tx.commit().await?;
            Ok(())
        }

        async fn remove_missing_volumes(&self, grace_period: Duration) -> MetadataResult<u64> {
            let cutoff = now() - grace_period;
            let result = sqlx::query(
                "DELETE FROM volumes WHERE id IN (
                     SELECT v.id FROM volumes v
                     JOIN workers w ON w.name = v.worker_name
                     WHERE v.state = 'created' AND w.state != 'stalled'
                       AND v.missing_since IS NOT NULL AND v.missing_since < ?)",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            Ok(result.rows_affected())
        }

        async fn destroy_unknown_volumes(
            &self,
            worker_name: &str,
            reported_handles: &[String],
        ) -> MetadataResult<u64> {
            let mut tx = self.pool.begin().await?;

            let db_handles: Vec<(String,)> =
                sqlx::query_as("SELECT handle FROM volumes WHERE worker_name = ?")
                    .bind(worker_name)
                    .fetch_all(&mut *tx)
                    .await?;

            let known: HashSet<&str> = db_handles.iter().map(|(h,)| h.as_str()).collect();
            let unknown: Vec<&str> = reported_handles
                .iter()
                .map(|h| h.as_str())
                .filter(|h| !known.contains(h))
                .collect();

            if unknown.is_empty() {
                return Ok(0);
            }

            let created_at = now();
            for handle in &unknown {
                sqlx::query(
                    "INSERT INTO volumes (handle, worker_name, state, created_at)
                     VALUES (?, ?, 'destroying', ?)",
                )
                .bind(*handle)
                .bind(worker_name)
                .bind(created_at)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;

            tracing::debug!(
                worker = worker_name,
                count = unknown.len(),
                "marked unknown volumes for destruction"
            );

            Ok(unknown.len() as u64)
        }
    }

    impl SqliteStore {
        /// Point a volume at a placement, creating the placement under the
        /// given capability. Shared by local and streamed initialization.
        /// Consumes the transaction: commits on success, drops (rolls back)
        /// on the silent no-op paths.
        async fn bless_cache_volume(
            &self,
            mut tx: sqlx::Transaction<'_, Sqlite>,
            volume_id: i64,
            resource_cache_id: i64,
            worker_name: &str,
            worker_base_resource_type_id: i64,
        ) -> MetadataResult<Option<WorkerResourceCacheRow>> {
            let (placement, valid) = find_or_create_worker_resource_cache_tx(
                &mut tx,
                worker_name,
                resource_cache_id,
                worker_base_resource_type_id,
            )
            .await?;

            if !valid {
                // a placement already exists for this (worker, cache), from
                // another volume that won the race; don't commit
                return Ok(None);
            }

            let result = sqlx::query(
                "UPDATE volumes SET worker_resource_cache_id = ?, team_id = NULL WHERE id = ?",
            )
            .bind(placement.id)
            .bind(volume_id)
            .execute(&mut *tx)
            .await;

            match result {
                Err(err) if is_unique_violation(&err) => {
                    // another volume was blessed as the cache volume - leave
                    // this one owned by its container so it expires with it
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
                Ok(result) if result.rows_affected() == 0 => {
                    return Err(MetadataError::VolumeMissing(volume_id));
                }
                Ok(_) => {}
            }

            tx.commit().await?;
            Ok(Some(placement))
        }
    }

    // =========================================================================
    // Builds (collaborator surface)
    // =========================================================================

    #[async_trait]
    impl BuildRepo for SqliteStore {
        async fn create_build(
            &self,
            name: &str,
            team_id: Option<i64>,
        ) -> MetadataResult<BuildRow> {
            let row = sqlx::query_as::<_, BuildRow>(
                "INSERT INTO builds (name, team_id) VALUES (?, ?) RETURNING *",
            )
            .bind(name)
            .bind(team_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn start_build(
            &self,
            id: i64,
            start_time: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE builds SET status = 'started', start_time = ?
                 WHERE id = ? AND completed = 0",
            )
            .bind(start_time)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn finish_build(&self, id: i64, status: BuildStatus) -> MetadataResult<bool> {
            if !status.is_completed() {
                return Err(MetadataError::Internal(format!(
                    "{} is not a terminal build status",
                    status.as_str()
                )));
            }

            let result = sqlx::query(
                "UPDATE builds SET status = ?, completed = 1, end_time = ? WHERE id = ?",
            )
            .bind(status.as_str())
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn set_build_interceptible(
            &self,
            id: i64,
            interceptible: bool,
        ) -> MetadataResult<bool> {
            let result = sqlx::query("UPDATE builds SET interceptible = ? WHERE id = ?")
                .bind(interceptible)
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn find_build(&self, id: i64) -> MetadataResult<Option<BuildRow>> {
            let row = sqlx::query_as::<_, BuildRow>("SELECT * FROM builds WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    #[async_trait]
    impl GcRepo for SqliteStore {
        async fn clean_up_invalid_worker_resource_caches(
            &self,
            limit: u32,
        ) -> MetadataResult<u64> {
            // A placement is preserved while any running build's start time
            // precedes its invalidation; that build is still entitled to
            // resolve it. A running build with no recorded start time
            // preserves every invalidated placement.
            let result = sqlx::query(
                "DELETE FROM worker_resource_caches WHERE id IN (
                     SELECT wrc.id FROM worker_resource_caches wrc
                     WHERE wrc.worker_base_resource_type_id IS NULL
                       AND NOT EXISTS (
                           SELECT 1 FROM builds b
                           WHERE b.completed = 0 AND b.status = 'started'
                             AND (b.start_time IS NULL OR b.start_time < wrc.invalid_since))
                     LIMIT ?)",
            )
            .bind(limit)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                tracing::debug!(
                    count = result.rows_affected(),
                    "deleted invalidated cache placements"
                );
            }

            Ok(result.rows_affected())
        }

        async fn clean_up_expired_resource_cache_users(
            &self,
            in_memory_window: Duration,
        ) -> MetadataResult<u64> {
            let finished = sqlx::query(
                "DELETE FROM resource_cache_users
                 WHERE build_id IS NOT NULL
                   AND build_id IN (SELECT id FROM builds WHERE completed = 1 AND interceptible = 0)",
            )
            .execute(&self.pool)
            .await?;

            // In-memory builds have no durable row to consult; their user
            // rows expire on wall-clock age alone.
            let cutoff = now() - in_memory_window;
            let in_memory = sqlx::query(
                "DELETE FROM resource_cache_users
                 WHERE in_memory_build_id IS NOT NULL AND in_memory_build_create_time < ?",
            )
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

            Ok(finished.rows_affected() + in_memory.rows_affected())
        }

        async fn clean_up_unreferenced_resource_caches(
            &self,
            limit: u32,
        ) -> MetadataResult<u64> {
            // A cache that parents a live config (a custom type's image) is
            // excluded; referential integrity would reject the delete anyway.
            let result = sqlx::query(
                "DELETE FROM resource_caches WHERE id IN (
                     SELECT rc.id FROM resource_caches rc
                     WHERE NOT EXISTS (
                           SELECT 1 FROM resource_cache_users u WHERE u.resource_cache_id = rc.id)
                       AND NOT EXISTS (
                           SELECT 1 FROM resource_configs cfg WHERE cfg.resource_cache_id = rc.id)
                     LIMIT ?)",
            )
            .bind(limit)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                tracing::debug!(
                    count = result.rows_affected(),
                    "deleted unreferenced resource caches"
                );
            }

            Ok(result.rows_affected())
        }

        async fn clean_up_unreferenced_resource_configs(
            &self,
            limit: u32,
        ) -> MetadataResult<u64> {
            // Scopes, versions, and expired check sessions cascade with the
            // config row.
            let result = sqlx::query(
                "DELETE FROM resource_configs WHERE id IN (
                     SELECT cfg.id FROM resource_configs cfg
                     WHERE NOT EXISTS (
                           SELECT 1 FROM resource_caches rc WHERE rc.resource_config_id = cfg.id)
                       AND NOT EXISTS (
                           SELECT 1 FROM resources r WHERE r.resource_config_id = cfg.id)
                       AND NOT EXISTS (
                           SELECT 1 FROM resource_config_check_sessions s
                           WHERE s.resource_config_id = cfg.id AND s.expires_at > ?)
                     LIMIT ?)",
            )
            .bind(now())
            .bind(limit)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                tracing::debug!(
                    count = result.rows_affected(),
                    "deleted unreferenced resource configs"
                );
            }

            Ok(result.rows_affected())
        }

        async fn clean_up_expired_check_sessions(&self) -> MetadataResult<u64> {
            let result =
                sqlx::query("DELETE FROM resource_config_check_sessions WHERE expires_at <= ?")
                    .bind(now())
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        }

        async fn clean_up_unused_base_resource_types(&self) -> MetadataResult<u64> {
            let result = sqlx::query(
                "DELETE FROM base_resource_types WHERE id IN (
                     SELECT brt.id FROM base_resource_types brt
                     WHERE NOT EXISTS (
                           SELECT 1 FROM worker_base_resource_types wbrt
                           WHERE wbrt.base_resource_type_id = brt.id)
                       AND NOT EXISTS (
                           SELECT 1 FROM resource_configs cfg
                           WHERE cfg.base_resource_type_id = brt.id))",
            )
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        }
    }

    // =========================================================================
    // Advisory locks
    // =========================================================================

    #[async_trait]
    impl LockRepo for SqliteStore {
        async fn try_acquire_lock(&self, name: &str) -> MetadataResult<bool> {
            let result =
                sqlx::query("INSERT OR IGNORE INTO named_locks (name, acquired_at) VALUES (?, ?)")
                    .bind(name)
                    .bind(now())
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn release_lock(&self, name: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM named_locks WHERE name = ?")
                .bind(name)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() > 0)
        }
    }
}

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
-- Workers
CREATE TABLE IF NOT EXISTS workers (
    name TEXT PRIMARY KEY,
    state TEXT NOT NULL DEFAULT 'running',
    ephemeral INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Base resource types
CREATE TABLE IF NOT EXISTS base_resource_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Worker capability table: which base resource type, at which image and
-- version, a worker currently provides. Replacing image/version retires the
-- row id, which is what invalidates placements tagged with it.
CREATE TABLE IF NOT EXISTS worker_base_resource_types (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    base_resource_type_id INTEGER NOT NULL REFERENCES base_resource_types(id) ON DELETE CASCADE,
    image TEXT NOT NULL,
    version TEXT NOT NULL,
    UNIQUE (worker_name, base_resource_type_id)
);

-- Builds (collaborator surface)
CREATE TABLE IF NOT EXISTS builds (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL DEFAULT '',
    team_id INTEGER,
    status TEXT NOT NULL DEFAULT 'pending',
    interceptible INTEGER NOT NULL DEFAULT 1,
    completed INTEGER NOT NULL DEFAULT 0,
    start_time TEXT,
    end_time TEXT
);

-- Resource configs: content-addressed (type + source). Exactly one parent
-- column is set. The parent-cache reference deliberately has no ON DELETE
-- action: a cache backing a custom type's image cannot be deleted while
-- configs derive from it.
CREATE TABLE IF NOT EXISTS resource_configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    base_resource_type_id INTEGER REFERENCES base_resource_types(id) ON DELETE CASCADE,
    resource_cache_id INTEGER REFERENCES resource_caches(id),
    source_hash TEXT NOT NULL,
    source_ciphertext BLOB NOT NULL,
    source_nonce TEXT,
    CHECK ((base_resource_type_id IS NULL) != (resource_cache_id IS NULL))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_configs_brt_source
    ON resource_configs (base_resource_type_id, source_hash)
    WHERE base_resource_type_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_configs_cache_source
    ON resource_configs (resource_cache_id, source_hash)
    WHERE resource_cache_id IS NOT NULL;

-- Resources (collaborator surface): anchors per-resource scopes and keeps
-- configs reachable.
CREATE TABLE IF NOT EXISTS resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    resource_config_id INTEGER REFERENCES resource_configs(id) ON DELETE SET NULL,
    resource_config_scope_id INTEGER REFERENCES resource_config_scopes(id) ON DELETE SET NULL
);

-- Resource config scopes: the version-history partition. resource_id NULL
-- means the history is shared across all resources using the exact config.
CREATE TABLE IF NOT EXISTS resource_config_scopes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_config_id INTEGER NOT NULL REFERENCES resource_configs(id) ON DELETE CASCADE,
    resource_id INTEGER REFERENCES resources(id) ON DELETE CASCADE,
    last_check_start_time TEXT,
    last_check_end_time TEXT,
    last_check_succeeded INTEGER NOT NULL DEFAULT 0,
    last_check_build_id INTEGER,
    last_check_plan_ciphertext BLOB,
    last_check_plan_nonce TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_scopes_shared
    ON resource_config_scopes (resource_config_id) WHERE resource_id IS NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_scopes_per_resource
    ON resource_config_scopes (resource_config_id, resource_id) WHERE resource_id IS NOT NULL;

-- Version ledger. check_order 0 = not yet part of the visible history.
CREATE TABLE IF NOT EXISTS resource_config_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_config_scope_id INTEGER NOT NULL REFERENCES resource_config_scopes(id) ON DELETE CASCADE,
    version TEXT NOT NULL,
    version_sha256 TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '[]',
    check_order INTEGER NOT NULL DEFAULT 0,
    span_context TEXT,
    UNIQUE (resource_config_scope_id, version_sha256)
);
CREATE INDEX IF NOT EXISTS idx_versions_order
    ON resource_config_versions (resource_config_scope_id, check_order);

-- Check sessions own resource-check containers; expiry orphans them.
CREATE TABLE IF NOT EXISTS resource_config_check_sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_config_id INTEGER NOT NULL REFERENCES resource_configs(id) ON DELETE CASCADE,
    worker_base_resource_type_id INTEGER NOT NULL REFERENCES worker_base_resource_types(id) ON DELETE CASCADE,
    expires_at TEXT NOT NULL
);

-- Resource caches: content-addressed (config + version + params).
CREATE TABLE IF NOT EXISTS resource_caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_config_id INTEGER NOT NULL REFERENCES resource_configs(id) ON DELETE CASCADE,
    version TEXT NOT NULL,
    version_sha256 TEXT NOT NULL,
    params_hash TEXT NOT NULL,
    UNIQUE (resource_config_id, version_sha256, params_hash)
);

-- Cache users: vicarious references keeping a cache alive. The cache
-- reference deliberately has no ON DELETE action: a cache with live users
-- cannot be deleted.
CREATE TABLE IF NOT EXISTS resource_cache_users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    resource_cache_id INTEGER NOT NULL REFERENCES resource_caches(id),
    build_id INTEGER REFERENCES builds(id) ON DELETE CASCADE,
    in_memory_build_id INTEGER,
    in_memory_build_create_time TEXT,
    CHECK ((build_id IS NULL) != (in_memory_build_id IS NULL))
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_users_build
    ON resource_cache_users (resource_cache_id, build_id) WHERE build_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_users_in_memory
    ON resource_cache_users (resource_cache_id, in_memory_build_id) WHERE in_memory_build_id IS NOT NULL;

-- Placements: a cache's bytes exist on a worker, tagged with the capability
-- generation current at placement time. Invalidation nulls the tag and
-- stamps invalid_since; the row is kept so builds that started before the
-- invalidation can still resolve it.
CREATE TABLE IF NOT EXISTS worker_resource_caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    resource_cache_id INTEGER NOT NULL REFERENCES resource_caches(id) ON DELETE CASCADE,
    worker_base_resource_type_id INTEGER REFERENCES worker_base_resource_types(id) ON DELETE SET NULL,
    invalid_since TEXT,
    UNIQUE (worker_name, resource_cache_id)
);

-- Task caches, resource certs, artifacts
CREATE TABLE IF NOT EXISTS worker_task_caches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    job_id INTEGER NOT NULL,
    step_name TEXT NOT NULL,
    path TEXT NOT NULL,
    UNIQUE (worker_name, job_id, step_name, path)
);
CREATE TABLE IF NOT EXISTS worker_resource_certs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    certs_path TEXT NOT NULL,
    UNIQUE (worker_name, certs_path)
);
CREATE TABLE IF NOT EXISTS worker_artifacts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    build_id INTEGER REFERENCES builds(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL
);

-- Jobs flagged for rescheduling when new versions land
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    schedule_requested TEXT
);
CREATE TABLE IF NOT EXISTS job_scope_inputs (
    job_id INTEGER NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    resource_config_scope_id INTEGER NOT NULL REFERENCES resource_config_scopes(id) ON DELETE CASCADE,
    passed_constrained INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (job_id, resource_config_scope_id)
);

-- Containers
CREATE TABLE IF NOT EXISTS containers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    handle TEXT NOT NULL UNIQUE,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    team_id INTEGER,
    state TEXT NOT NULL DEFAULT 'creating',
    plan_id TEXT,
    build_id INTEGER REFERENCES builds(id) ON DELETE SET NULL,
    image_check_container_id INTEGER REFERENCES containers(id) ON DELETE SET NULL,
    image_get_container_id INTEGER REFERENCES containers(id) ON DELETE SET NULL,
    resource_config_check_session_id INTEGER REFERENCES resource_config_check_sessions(id) ON DELETE SET NULL,
    missing_since TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_containers_worker_state ON containers (worker_name, state);

-- Volumes. UNIQUE (id, state) backs the composite parent foreign key: a
-- child row pins its parent's created state, so moving the parent out of
-- created while children exist is a foreign-key violation. Deleting a
-- parent row cascades to children (worker pruning).
CREATE TABLE IF NOT EXISTS volumes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    handle TEXT NOT NULL UNIQUE,
    worker_name TEXT NOT NULL REFERENCES workers(name) ON DELETE CASCADE,
    team_id INTEGER,
    state TEXT NOT NULL DEFAULT 'creating',
    path TEXT,
    parent_id INTEGER,
    parent_state TEXT,
    container_id INTEGER REFERENCES containers(id) ON DELETE SET NULL,
    worker_resource_cache_id INTEGER REFERENCES worker_resource_caches(id) ON DELETE SET NULL,
    worker_base_resource_type_id INTEGER REFERENCES worker_base_resource_types(id) ON DELETE SET NULL,
    worker_task_cache_id INTEGER REFERENCES worker_task_caches(id) ON DELETE SET NULL,
    worker_resource_certs_id INTEGER REFERENCES worker_resource_certs(id) ON DELETE SET NULL,
    worker_artifact_id INTEGER REFERENCES worker_artifacts(id) ON DELETE SET NULL,
    missing_since TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (id, state),
    FOREIGN KEY (parent_id, parent_state) REFERENCES volumes(id, state) ON DELETE CASCADE
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_volumes_worker_resource_cache
    ON volumes (worker_resource_cache_id) WHERE worker_resource_cache_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_volumes_worker_task_cache
    ON volumes (worker_task_cache_id) WHERE worker_task_cache_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_volumes_worker_state ON volumes (worker_name, state);
CREATE INDEX IF NOT EXISTS idx_volumes_parent ON volumes (parent_id);

-- Named advisory locks
CREATE TABLE IF NOT EXISTS named_locks (
    name TEXT PRIMARY KEY,
    acquired_at TEXT NOT NULL
);
"#;
