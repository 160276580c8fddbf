//! Shared test store setup.

pub mod fixtures;

use capstan_core::NoEncryption;
use capstan_metadata::{MetadataResult, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;

/// A test metadata store backed by a temp-dir SQLite file, cleaned up on
/// drop.
pub struct TestStore {
    pub store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestStore {
    pub async fn new() -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path, None, Arc::new(NoEncryption)).await?;

        Ok(Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        })
    }

    pub fn store(&self) -> Arc<SqliteStore> {
        self.store.clone()
    }
}
