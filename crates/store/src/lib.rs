//! Key/value store implementations for Scuttle.
//!
//! Session snapshots persist through the `KvStore` trait defined in
//! `scuttle-core`. Three backends: ephemeral in-memory (tests, dev),
//! file-per-key JSON envelopes, and SQLite.

pub mod file;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use scuttle_core::error::StoreError;
use scuttle_core::kv::KvStore;
use std::sync::Arc;

/// Build a store backend from its config name.
///
/// `path` is the file backend's directory or the sqlite database file;
/// when absent, each backend picks its default under `~/.scuttle/`.
pub async fn build_from_config(
    backend: &str,
    path: Option<&str>,
) -> Result<Arc<dyn KvStore>, StoreError> {
    match backend {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "file" => {
            let dir = path
                .map(std::path::PathBuf::from)
                .unwrap_or_else(FileStore::default_dir);
            Ok(Arc::new(FileStore::new(dir)?))
        }
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            let db = match path {
                Some(p) => p.to_string(),
                None => SqliteStore::default_path(),
            };
            Ok(Arc::new(SqliteStore::new(&db).await?))
        }
        other => Err(StoreError::Storage(format!(
            "unknown store backend '{other}'"
        ))),
    }
}
