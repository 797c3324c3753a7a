//! Key/value backing store trait.
//!
//! The persistence primitive underneath session state: get/put/delete with
//! per-key expiry plus prefix listing. The working-set cache and the context
//! manager are logical layers on top of this — they snapshot to it and
//! restore from it, so sessions survive process restarts.
//!
//! Implementations (in-memory, file, SQLite) live in `scuttle-store`.

use crate::error::StoreError;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// The backend name (e.g., "memory", "file", "sqlite").
    fn name(&self) -> &str;

    /// Store a value under a key, optionally expiring after `ttl`.
    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> std::result::Result<(), StoreError>;

    /// Fetch a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> std::result::Result<Option<Vec<u8>>, StoreError>;

    /// Delete a key. Returns whether it existed (and was unexpired).
    async fn delete(&self, key: &str) -> std::result::Result<bool, StoreError>;

    /// List all unexpired keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> std::result::Result<Vec<String>, StoreError>;
}
