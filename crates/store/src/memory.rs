//! In-memory backend — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use scuttle_core::error::StoreError;
use scuttle_core::kv::KvStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Slot {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// An in-memory store that keeps values in a HashMap.
/// Expired keys are reclaimed lazily on read and on write.
pub struct MemoryStore {
    slots: Arc<RwLock<HashMap<String, Slot>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        slots.retain(|_, slot| !slot.is_expired(now));
        slots.insert(
            key.to_string(),
            Slot {
                value,
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        match slots.get(key) {
            Some(slot) if !slot.is_expired(now) => Ok(Some(slot.value.clone())),
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        match slots.remove(key) {
            Some(slot) => Ok(!slot.is_expired(now)),
            None => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let slots = self.slots.read().await;
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(k, slot)| k.starts_with(prefix) && !slot.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }
}
