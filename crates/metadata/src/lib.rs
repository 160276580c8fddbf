//! Persistent cluster state for Capstan.
//!
//! This crate provides the control-plane data model:
//! - Base resource type identities and per-worker capability rows
//! - Content-addressed resource configs, scopes, and the version ledger
//! - Content-addressed resource caches, their users, and per-worker
//!   placement with capability-generation invalidation
//! - The container/volume lifecycle state machines
//! - Reachability-based garbage collection passes
//! - Named advisory locks

pub mod error;
pub mod models;
pub mod repos;
pub mod state;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use state::LifecycleState;
pub use store::{MetadataStore, SqliteStore};

use capstan_core::{EncryptionStrategy, MetadataConfig};
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(
    config: &MetadataConfig,
    encryption: Arc<dyn EncryptionStrategy>,
) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            busy_timeout_secs,
        } => {
            let store = SqliteStore::new(path, *busy_timeout_secs, encryption).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::NoEncryption;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("metadata.db");
        let config = MetadataConfig::Sqlite {
            path: db_path.clone(),
            busy_timeout_secs: None,
        };

        let store = from_config(&config, Arc::new(NoEncryption)).await.unwrap();
        store.health_check().await.unwrap();
        assert!(db_path.exists());
    }
}
