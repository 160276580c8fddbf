//! Store configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Metadata store backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite file-backed store.
    Sqlite {
        path: PathBuf,
        #[serde(default)]
        busy_timeout_secs: Option<u64>,
    },
}
