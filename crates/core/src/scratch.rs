//! Scratch store trait — the agent's bounded working memory.
//!
//! The working set is a tagged key/value cache the model can read and write
//! mid-conversation. Entries carry a summary, tags, and recency metadata;
//! the store evicts least-recently-used entries when a configured capacity
//! would be exceeded, skipping entries pinned by the configured keep tag.
//!
//! The concrete implementation lives in `scuttle-session`.

use crate::error::CacheError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single working-set entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Key, unique within the session's working set
    pub key: String,

    /// The stored value (opaque JSON)
    pub value: serde_json::Value,

    /// Tags for categorization and pin control
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Short human/model-readable summary of the value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// SHA-256 hash of the serialized value
    pub content_hash: String,

    /// When this entry was first inserted
    pub created_at: DateTime<Utc>,

    /// When this entry was last read or written
    pub last_accessed: DateTime<Utc>,

    /// How many times this entry has been read
    #[serde(default)]
    pub access_count: u64,

    /// Optional expiry; expired entries are invisible and reclaimed lazily
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Serialized size in bytes, counted against the capacity bound
    pub size: usize,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// A short preview of the value for listings and prompt digests.
    pub fn value_preview(&self, max_chars: usize) -> String {
        let text = match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let flat = text.replace('\n', "\\n");
        if flat.chars().count() > max_chars {
            let truncated: String = flat.chars().take(max_chars).collect();
            format!("{truncated}...")
        } else {
            flat
        }
    }
}

/// Parameters for inserting or updating an entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PutOptions {
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    /// Time-to-live in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

/// A query over the working set: free text, tags, or both.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheQuery {
    /// Free-text query matched against values, summaries, and tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Tag filter
    #[serde(default)]
    pub tags: Vec<String>,

    /// Whether all tags must match (default: any)
    #[serde(default)]
    pub match_all_tags: bool,

    /// Maximum number of results
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

impl Default for CacheQuery {
    fn default() -> Self {
        Self {
            text: None,
            tags: Vec::new(),
            match_all_tags: false,
            limit: default_limit(),
        }
    }
}

/// Aggregate statistics over a session's working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_bytes: usize,
    pub capacity_bytes: usize,
    pub pinned_entries: usize,
    pub total_accesses: u64,
    pub entries_with_summary: usize,
    pub tag_counts: HashMap<String, usize>,
}

/// The working-set cache capability handed to tools and the agent loop.
#[async_trait]
pub trait ScratchStore: Send + Sync {
    /// Insert or update an entry. May evict least-recently-used unpinned
    /// entries to fit; fails with `CapacityExceeded` only when everything
    /// left to evict is pinned.
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        opts: PutOptions,
    ) -> std::result::Result<(), CacheError>;

    /// Fetch a value. Refreshes recency (read-through LRU).
    async fn get(&self, key: &str) -> std::result::Result<serde_json::Value, CacheError>;

    /// Search entries, ranked by relevance, most recent first on ties.
    async fn search(
        &self,
        query: CacheQuery,
    ) -> std::result::Result<Vec<CacheEntry>, CacheError>;

    /// Remove an entry. Returns whether it existed.
    async fn delete(&self, key: &str) -> std::result::Result<bool, CacheError>;

    /// All live entries, most recently used first.
    async fn list(&self) -> std::result::Result<Vec<CacheEntry>, CacheError>;

    async fn stats(&self) -> std::result::Result<CacheStats, CacheError>;

    async fn clear(&self) -> std::result::Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_expiry_check() {
        let now = Utc::now();
        let mut entry = CacheEntry {
            key: "k".into(),
            value: serde_json::json!("v"),
            tags: vec![],
            summary: None,
            content_hash: "h".into(),
            created_at: now,
            last_accessed: now,
            access_count: 0,
            expires_at: None,
            size: 3,
        };
        assert!(!entry.is_expired(now));

        entry.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(entry.is_expired(now));

        entry.expires_at = Some(now + chrono::Duration::seconds(60));
        assert!(!entry.is_expired(now));
    }

    #[test]
    fn value_preview_truncates_and_escapes() {
        let now = Utc::now();
        let entry = CacheEntry {
            key: "k".into(),
            value: serde_json::json!("line one\nline two that goes on and on"),
            tags: vec![],
            summary: None,
            content_hash: "h".into(),
            created_at: now,
            last_accessed: now,
            access_count: 0,
            expires_at: None,
            size: 0,
        };
        let preview = entry.value_preview(12);
        assert!(preview.ends_with("..."));
        assert!(preview.contains("\\n") || preview.len() <= 15);
    }

    #[test]
    fn query_defaults() {
        let q = CacheQuery::default();
        assert_eq!(q.limit, 10);
        assert!(!q.match_all_tags);
        assert!(q.text.is_none());
    }
}
