//! SQLite backend — a single `kv` table with per-key expiry.
//!
//! Uses WAL mode for concurrent readers. Expired rows are purged lazily
//! on write and filtered on read.

use async_trait::async_trait;
use chrono::Utc;
use scuttle_core::error::StoreError;
use scuttle_core::kv::KvStore;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// A SQLite-backed key/value store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from a file path.
    ///
    /// The database and table are created automatically.
    /// Pass `":memory:"` for an in-process ephemeral database (useful for tests).
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// Default path: `~/.scuttle/scuttle.db`
    pub fn default_path() -> String {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        let dir = std::path::PathBuf::from(home).join(".scuttle");
        let _ = std::fs::create_dir_all(&dir);
        dir.join("scuttle.db").to_string_lossy().into_owned()
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                expires_at INTEGER,
                written_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("kv table: {e}")))?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("purge: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.purge_expired().await?;

        let now = Utc::now().timestamp();
        let expires_at = ttl.map(|t| now + t.as_secs() as i64);

        sqlx::query(
            r#"
            INSERT INTO kv (key, value, expires_at, written_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                written_at = excluded.written_at
            "#,
        )
        .bind(key)
        .bind(&value)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("put {key}: {e}")))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query(
            "SELECT value FROM kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("get {key}: {e}")))?;

        Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "DELETE FROM kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("delete {key}: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // LIKE with escaped wildcards in the prefix
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let rows = sqlx::query(
            r#"
            SELECT key FROM kv
            WHERE key LIKE ? ESCAPE '\'
              AND (expires_at IS NULL OR expires_at > ?)
            ORDER BY key
            "#,
        )
        .bind(pattern)
        .bind(Utc::now().timestamp())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("keys: {e}")))?;

        Ok(rows.iter().map(|r| r.get::<String, _>("key")).collect())
    }
}
