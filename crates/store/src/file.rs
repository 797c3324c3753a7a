//! File-based store — one JSON envelope per key.
//!
//! Each key maps to `<dir>/<encoded-key>.json` holding the value (base64)
//! and its optional expiry. Simple, portable, human-inspectable, and
//! requires no external service.
//!
//! Storage location: `~/.scuttle/store/`

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use scuttle_core::error::StoreError;
use scuttle_core::kv::KvStore;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

/// On-disk envelope for one key.
#[derive(Serialize, Deserialize)]
struct Envelope {
    key: String,
    /// Value bytes, base64-encoded
    data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    written_at: DateTime<Utc>,
}

impl Envelope {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A file-backed key/value store.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Storage(format!("Failed to create store directory: {e}")))?;
        debug!(dir = %dir.display(), "File store initialized");
        Ok(Self { dir })
    }

    /// Default directory: `~/.scuttle/store/`
    pub fn default_dir() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".scuttle").join("store")
    }

    /// Keys may contain separators like `:`; encode them into safe filenames.
    fn file_for(&self, key: &str) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(key.as_bytes());
        self.dir.join(format!("{encoded}.json"))
    }

    fn read_envelope(&self, key: &str) -> Result<Option<Envelope>, StoreError> {
        let path = self.file_for(key);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Storage(format!("Failed to read {key}: {e}"))),
        };
        match serde_json::from_str::<Envelope>(&content) {
            Ok(env) => Ok(Some(env)),
            Err(e) => {
                warn!(key, error = %e, "Skipping corrupted store envelope");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl KvStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let envelope = Envelope {
            key: key.to_string(),
            data: STANDARD.encode(&value),
            expires_at: ttl.and_then(|t| {
                chrono::Duration::from_std(t)
                    .ok()
                    .map(|d| Utc::now() + d)
            }),
            written_at: Utc::now(),
        };
        let content = serde_json::to_string_pretty(&envelope)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        std::fs::write(self.file_for(key), content)
            .map_err(|e| StoreError::Storage(format!("Failed to write {key}: {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match self.read_envelope(key)? {
            Some(env) if !env.is_expired(Utc::now()) => {
                let bytes = STANDARD
                    .decode(&env.data)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(bytes))
            }
            Some(_) => {
                // Expired — reclaim the file
                let _ = std::fs::remove_file(self.file_for(key));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let existed = self
            .read_envelope(key)?
            .is_some_and(|env| !env.is_expired(Utc::now()));
        match std::fs::remove_file(self.file_for(key)) {
            Ok(()) => Ok(existed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Storage(format!("Failed to delete {key}: {e}"))),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Utc::now();
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| StoreError::Storage(format!("Failed to list store directory: {e}")))?;

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            let Ok(decoded) = URL_SAFE_NO_PAD.decode(stem) else {
                continue;
            };
            let Ok(key) = String::from_utf8(decoded) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(env) = self.read_envelope(&key)? {
                if !env.is_expired(now) {
                    keys.push(key);
                }
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }
}
