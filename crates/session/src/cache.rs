//! The working-set cache — bounded, tagged, evictable scratch memory.
//!
//! Implements the `ScratchStore` trait from `scuttle-core`. Entries carry
//! tags, an optional summary, and recency metadata; when an insert would
//! exceed the capacity bound, least-recently-used entries are evicted until
//! it fits, skipping entries that carry the configured pin tag. Recency is
//! the sole eviction criterion, and reads refresh it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scuttle_core::error::CacheError;
use scuttle_core::scratch::{CacheEntry, CacheQuery, CacheStats, PutOptions, ScratchStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tuning for one session's working set.
#[derive(Debug, Clone)]
pub struct WorkingSetConfig {
    /// Capacity in bytes of stored entries (key + value + summary)
    pub capacity_bytes: usize,

    /// Entries carrying this tag are never evicted
    pub pin_tag: String,

    /// TTL applied when a put doesn't set one
    pub default_ttl: Option<Duration>,
}

impl Default for WorkingSetConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: 256 * 1024,
            pin_tag: "keep".into(),
            default_ttl: None,
        }
    }
}

struct Slot {
    entry: CacheEntry,
    /// Monotonic recency tick; higher = more recently used
    touch: u64,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    clock: u64,
    total_bytes: usize,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(slot) = self.slots.remove(&key) {
                self.total_bytes -= slot.entry.size;
            }
        }
    }
}

/// Serializable snapshot of a working set, ordered least-recently-used
/// first so recency survives a restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkingSetSnapshot {
    pub entries: Vec<CacheEntry>,
}

/// A session's scratch memory.
pub struct WorkingSet {
    config: WorkingSetConfig,
    inner: Mutex<Inner>,
}

impl WorkingSet {
    pub fn new(config: WorkingSetConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn is_pinned(&self, entry: &CacheEntry) -> bool {
        entry.tags.iter().any(|t| *t == self.config.pin_tag)
    }

    /// Size charged against capacity: key + serialized value + summary.
    fn entry_size(key: &str, value: &serde_json::Value, summary: Option<&str>) -> usize {
        let value_len = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
        key.len() + value_len + summary.map_or(0, str::len)
    }

    fn content_hash(value: &serde_json::Value) -> String {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        let digest = Sha256::digest(&bytes);
        format!("{digest:x}")
    }

    /// Evict least-recently-used unpinned entries until `incoming` fits.
    ///
    /// `replacing` is the key being updated, whose old size is already
    /// excluded from the running total by the caller.
    fn evict_to_fit(
        &self,
        inner: &mut Inner,
        incoming: usize,
        replacing: &str,
    ) -> Result<(), CacheError> {
        while inner.total_bytes + incoming > self.config.capacity_bytes {
            let victim = inner
                .slots
                .iter()
                .filter(|(key, slot)| *key != replacing && !self.is_pinned(&slot.entry))
                .min_by_key(|(_, slot)| slot.touch)
                .map(|(key, _)| key.clone());

            let Some(key) = victim else {
                return Err(CacheError::CapacityExceeded {
                    needed: inner.total_bytes + incoming,
                    capacity: self.config.capacity_bytes,
                });
            };
            if let Some(slot) = inner.slots.remove(&key) {
                inner.total_bytes -= slot.entry.size;
                debug!(key, size = slot.entry.size, "Evicted working-set entry");
            }
        }
        Ok(())
    }

    /// A bounded textual digest of the pad, injected into the system prompt
    /// so the model knows what its working memory currently holds.
    pub async fn context_summary(&self) -> String {
        let entries = match self.list().await {
            Ok(entries) => entries,
            Err(_) => return "Scratch pad unavailable".into(),
        };
        if entries.is_empty() {
            return "Scratch pad is empty".into();
        }

        let mut lines = vec![format!("Scratch pad ({} entries):", entries.len())];
        for entry in entries.iter().take(20) {
            let tags = if entry.tags.is_empty() {
                "untagged".to_string()
            } else {
                entry.tags.join(", ")
            };
            lines.push(format!(
                "  - {}: {} (tags: {})",
                entry.key,
                entry.value_preview(100),
                tags
            ));
        }
        if entries.len() > 20 {
            lines.push(format!("  ... {} more entries not shown", entries.len() - 20));
        }
        lines.join("\n")
    }

    /// Snapshot for persistence, least-recently-used first.
    pub async fn snapshot(&self) -> WorkingSetSnapshot {
        let inner = self.inner.lock().await;
        let mut slots: Vec<&Slot> = inner.slots.values().collect();
        slots.sort_by_key(|slot| slot.touch);
        WorkingSetSnapshot {
            entries: slots.iter().map(|slot| slot.entry.clone()).collect(),
        }
    }

    /// Replace contents from a snapshot, preserving its recency order.
    pub async fn restore(&self, snapshot: WorkingSetSnapshot) {
        let mut inner = self.inner.lock().await;
        inner.slots.clear();
        inner.total_bytes = 0;
        inner.clock = 0;
        for entry in snapshot.entries {
            let touch = inner.tick();
            inner.total_bytes += entry.size;
            inner.slots.insert(entry.key.clone(), Slot { entry, touch });
        }
    }
}

#[async_trait]
impl ScratchStore for WorkingSet {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        opts: PutOptions,
    ) -> Result<(), CacheError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(now);

        let size = Self::entry_size(key, &value, opts.summary.as_deref());

        // Feasibility check before touching anything: even evicting every
        // unpinned entry must leave room.
        let pinned_bytes: usize = inner
            .slots
            .iter()
            .filter(|(k, slot)| *k != key && self.is_pinned(&slot.entry))
            .map(|(_, slot)| slot.entry.size)
            .sum();
        if pinned_bytes + size > self.config.capacity_bytes {
            warn!(
                key,
                size,
                capacity = self.config.capacity_bytes,
                "Rejecting insert: pinned entries leave no room"
            );
            return Err(CacheError::CapacityExceeded {
                needed: pinned_bytes + size,
                capacity: self.config.capacity_bytes,
            });
        }

        // Updating an existing key: release its old size first.
        let previous = inner.slots.remove(key);
        if let Some(ref slot) = previous {
            inner.total_bytes -= slot.entry.size;
        }

        self.evict_to_fit(&mut inner, size, key)?;

        let ttl = opts
            .ttl_secs
            .map(Duration::from_secs)
            .or(self.config.default_ttl);
        let expires_at =
            ttl.and_then(|t| chrono::Duration::from_std(t).ok().map(|d| now + d));

        let touch = inner.tick();
        let entry = CacheEntry {
            key: key.to_string(),
            content_hash: Self::content_hash(&value),
            value,
            tags: opts.tags,
            summary: opts.summary,
            created_at: previous
                .as_ref()
                .map(|slot| slot.entry.created_at)
                .unwrap_or(now),
            last_accessed: now,
            access_count: previous
                .as_ref()
                .map(|slot| slot.entry.access_count)
                .unwrap_or(0),
            expires_at,
            size,
        };
        inner.total_bytes += size;
        inner.slots.insert(key.to_string(), Slot { entry, touch });
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<serde_json::Value, CacheError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let expired = inner
            .slots
            .get(key)
            .is_some_and(|slot| slot.entry.is_expired(now));
        if expired {
            if let Some(slot) = inner.slots.remove(key) {
                inner.total_bytes -= slot.entry.size;
            }
            return Err(CacheError::NotFound(key.to_string()));
        }

        let touch = inner.tick();
        let slot = inner
            .slots
            .get_mut(key)
            .ok_or_else(|| CacheError::NotFound(key.to_string()))?;
        slot.touch = touch;
        slot.entry.access_count += 1;
        slot.entry.last_accessed = now;
        Ok(slot.entry.value.clone())
    }

    async fn search(&self, query: CacheQuery) -> Result<Vec<CacheEntry>, CacheError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(now);

        let needle = query.text.as_deref().map(str::to_lowercase);

        let mut matches: Vec<(f32, u64, CacheEntry)> = inner
            .slots
            .values()
            .filter(|slot| {
                if query.tags.is_empty() {
                    return true;
                }
                if query.match_all_tags {
                    query.tags.iter().all(|t| slot.entry.tags.contains(t))
                } else {
                    query.tags.iter().any(|t| slot.entry.tags.contains(t))
                }
            })
            .filter_map(|slot| {
                let Some(ref needle) = needle else {
                    return Some((0.0, slot.touch, slot.entry.clone()));
                };
                let haystack = format!(
                    "{} {} {}",
                    match &slot.entry.value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    },
                    slot.entry.summary.as_deref().unwrap_or(""),
                    slot.entry.tags.join(" ")
                )
                .to_lowercase();
                let occurrences = haystack.matches(needle.as_str()).count();
                if occurrences == 0 {
                    return None;
                }
                let score = occurrences as f32 / (haystack.len() as f32 / 100.0).max(1.0);
                Some((score, slot.touch, slot.entry.clone()))
            })
            .collect();

        // Relevance first, most recently used on ties
        matches.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        matches.truncate(query.limit);
        Ok(matches.into_iter().map(|(_, _, entry)| entry).collect())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut inner = self.inner.lock().await;
        match inner.slots.remove(key) {
            Some(slot) => {
                inner.total_bytes -= slot.entry.size;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(now);

        let mut slots: Vec<&Slot> = inner.slots.values().collect();
        slots.sort_by(|a, b| b.touch.cmp(&a.touch));
        Ok(slots.iter().map(|slot| slot.entry.clone()).collect())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        inner.purge_expired(now);

        let mut tag_counts: HashMap<String, usize> = HashMap::new();
        let mut total_accesses = 0;
        let mut pinned = 0;
        let mut with_summary = 0;
        for slot in inner.slots.values() {
            total_accesses += slot.entry.access_count;
            if self.is_pinned(&slot.entry) {
                pinned += 1;
            }
            if slot.entry.summary.is_some() {
                with_summary += 1;
            }
            for tag in &slot.entry.tags {
                *tag_counts.entry(tag.clone()).or_default() += 1;
            }
        }

        Ok(CacheStats {
            total_entries: inner.slots.len(),
            total_bytes: inner.total_bytes,
            capacity_bytes: self.config.capacity_bytes,
            pinned_entries: pinned,
            total_accesses,
            entries_with_summary: with_summary,
            tag_counts,
        })
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock().await;
        inner.slots.clear();
        inner.total_bytes = 0;
        Ok(())
    }
}
