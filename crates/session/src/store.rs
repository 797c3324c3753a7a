//! Session lifecycle — explicit session-keyed state, persisted to the
//! backing store.
//!
//! A `Session` owns one transcript and one working set, plus the turn lock
//! that serializes turns: concurrent messages for the same session queue on
//! it in arrival order, while different sessions run fully independently.
//! The `SessionStore` keeps recently active sessions resident and snapshots
//! them to the `KvStore` so they survive process restarts.

use crate::cache::{WorkingSet, WorkingSetConfig, WorkingSetSnapshot};
use crate::history::{Transcript, TranscriptConfig, TranscriptSnapshot};
use chrono::{DateTime, Utc};
use scuttle_core::SessionId;
use scuttle_core::error::{Error, StoreError};
use scuttle_core::kv::KvStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

/// Tuning for sessions and their persistence.
#[derive(Debug, Clone)]
pub struct SessionStoreConfig {
    pub cache: WorkingSetConfig,
    pub transcript: TranscriptConfig,

    /// Backing-store TTL for snapshots (None = never expire)
    pub snapshot_ttl: Option<Duration>,

    /// Sessions held in memory at once; the least recently active is
    /// persisted and dropped when the limit is exceeded
    pub max_resident: usize,
}

impl Default for SessionStoreConfig {
    fn default() -> Self {
        Self {
            cache: WorkingSetConfig::default(),
            transcript: TranscriptConfig::default(),
            snapshot_ttl: Some(Duration::from_secs(7 * 24 * 3600)),
            max_resident: 256,
        }
    }
}

/// One session: transcript + working set + turn serialization.
pub struct Session {
    id: SessionId,
    created_at: DateTime<Utc>,
    turn_lock: Arc<Mutex<()>>,
    pub transcript: Mutex<Transcript>,
    pub scratch: Arc<WorkingSet>,
}

impl Session {
    fn new(id: SessionId, config: &SessionStoreConfig) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            turn_lock: Arc::new(Mutex::new(())),
            transcript: Mutex::new(Transcript::new(config.transcript.clone())),
            scratch: Arc::new(WorkingSet::new(config.cache.clone())),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Acquire the turn lock. Turns for one session run strictly one at a
    /// time; waiters are served in arrival order.
    pub async fn begin_turn(&self) -> MutexGuard<'_, ()> {
        self.turn_lock.lock().await
    }

    /// Owned variant of [`begin_turn`](Self::begin_turn), for callers that
    /// move the guard into a spawned task.
    pub async fn begin_turn_owned(&self) -> tokio::sync::OwnedMutexGuard<()> {
        self.turn_lock.clone().lock_owned().await
    }

    /// Whether a turn is currently running.
    pub fn is_busy(&self) -> bool {
        self.turn_lock.try_lock().is_err()
    }

    pub async fn last_activity(&self) -> DateTime<Utc> {
        self.transcript.lock().await.last_activity()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.to_string(),
            created_at: self.created_at,
            transcript: self.transcript.lock().await.snapshot(),
            scratch: self.scratch.snapshot().await,
        }
    }

    async fn from_snapshot(snapshot: SessionSnapshot, config: &SessionStoreConfig) -> Self {
        let session = Self {
            id: SessionId::from(&snapshot.id),
            created_at: snapshot.created_at,
            turn_lock: Arc::new(Mutex::new(())),
            transcript: Mutex::new(Transcript::new(config.transcript.clone())),
            scratch: Arc::new(WorkingSet::new(config.cache.clone())),
        };
        session.transcript.lock().await.restore(snapshot.transcript);
        session.scratch.restore(snapshot.scratch).await;
        session
    }
}

/// Serialized session state as written to the backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub transcript: TranscriptSnapshot,
    pub scratch: WorkingSetSnapshot,
}

/// Summary row for session listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    pub resident: bool,
}

/// The session-keyed store handed to the orchestration loop and gateway.
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    config: SessionStoreConfig,
    resident: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, config: SessionStoreConfig) -> Self {
        Self {
            kv,
            config,
            resident: RwLock::new(HashMap::new()),
        }
    }

    fn kv_key(id: &str) -> String {
        format!("session:{id}")
    }

    /// Fetch a session, restoring it from the backing store if needed, or
    /// create a fresh one. Returns the session and whether it was created.
    pub async fn get_or_create(&self, id: Option<&str>) -> Result<(Arc<Session>, bool), Error> {
        if let Some(id) = id {
            if let Some(session) = self.get(id).await? {
                return Ok((session, false));
            }
        }

        let session_id = id
            .map(SessionId::from)
            .unwrap_or_default();
        info!(session_id = %session_id, "Creating session");
        let session = Arc::new(Session::new(session_id.clone(), &self.config));
        self.insert_resident(session_id.to_string(), session.clone())
            .await;
        Ok((session, true))
    }

    /// Fetch an existing session, restoring from the backing store on miss.
    pub async fn get(&self, id: &str) -> Result<Option<Arc<Session>>, Error> {
        if let Some(session) = self.resident.read().await.get(id) {
            return Ok(Some(session.clone()));
        }

        let Some(bytes) = self.kv.get(&Self::kv_key(id)).await? else {
            return Ok(None);
        };
        let snapshot: SessionSnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        debug!(session_id = id, "Restored session from backing store");

        let session = Arc::new(Session::from_snapshot(snapshot, &self.config).await);
        self.insert_resident(id.to_string(), session.clone()).await;
        Ok(Some(session))
    }

    async fn insert_resident(&self, id: String, session: Arc<Session>) {
        let mut resident = self.resident.write().await;
        resident.insert(id, session);

        // Over the resident cap: persist and drop the least recently
        // active idle session. Busy sessions are never dropped.
        if resident.len() <= self.config.max_resident {
            return;
        }
        let mut candidates: Vec<(String, Arc<Session>)> = resident
            .iter()
            .filter(|(_, s)| !s.is_busy())
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        drop(resident);

        let mut oldest: Option<(String, Arc<Session>, DateTime<Utc>)> = None;
        for (key, session) in candidates.drain(..) {
            let activity = session.last_activity().await;
            if oldest.as_ref().is_none_or(|(_, _, t)| activity < *t) {
                oldest = Some((key, session, activity));
            }
        }
        if let Some((key, session, _)) = oldest {
            if let Err(e) = self.persist(&session).await {
                warn!(session_id = %key, error = %e, "Failed to persist evicted session");
            }
            self.resident.write().await.remove(&key);
            debug!(session_id = %key, "Dropped idle session from residency");
        }
    }

    /// Snapshot a session into the backing store.
    pub async fn persist(&self, session: &Session) -> Result<(), Error> {
        let snapshot = session.snapshot().await;
        let bytes = serde_json::to_vec(&snapshot)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.kv
            .put(
                &Self::kv_key(&snapshot.id),
                bytes,
                self.config.snapshot_ttl,
            )
            .await?;
        Ok(())
    }

    /// Remove a session from residency and the backing store.
    pub async fn delete(&self, id: &str) -> Result<bool, Error> {
        let was_resident = self.resident.write().await.remove(id).is_some();
        let was_stored = self.kv.delete(&Self::kv_key(id)).await?;
        Ok(was_resident || was_stored)
    }

    /// All known sessions: resident plus persisted.
    pub async fn list(&self) -> Result<Vec<SessionInfo>, Error> {
        let resident = self.resident.read().await;
        let mut infos: HashMap<String, SessionInfo> = resident
            .keys()
            .map(|id| {
                (
                    id.clone(),
                    SessionInfo {
                        id: id.clone(),
                        resident: true,
                    },
                )
            })
            .collect();
        drop(resident);

        for key in self.kv.keys("session:").await? {
            let id = key.trim_start_matches("session:").to_string();
            infos.entry(id.clone()).or_insert(SessionInfo {
                id,
                resident: false,
            });
        }

        let mut list: Vec<SessionInfo> = infos.into_values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scuttle_core::message::Message;
    use scuttle_core::scratch::{PutOptions, ScratchStore};
    use scuttle_store::MemoryStore;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()), SessionStoreConfig::default())
    }

    #[tokio::test]
    async fn create_on_first_message_for_new_id() {
        let store = store();
        let (session, created) = store.get_or_create(Some("abc")).await.unwrap();
        assert!(created);
        assert_eq!(session.id().to_string(), "abc");

        let (_, created_again) = store.get_or_create(Some("abc")).await.unwrap();
        assert!(!created_again);
    }

    #[tokio::test]
    async fn generated_id_when_absent() {
        let store = store();
        let (session, created) = store.get_or_create(None).await.unwrap();
        assert!(created);
        assert!(!session.id().to_string().is_empty());
    }

    #[tokio::test]
    async fn persist_and_restore_roundtrip() {
        let kv = Arc::new(MemoryStore::new());
        let store = SessionStore::new(kv.clone(), SessionStoreConfig::default());

        let (session, _) = store.get_or_create(Some("s1")).await.unwrap();
        session
            .transcript
            .lock()
            .await
            .append(Message::user("remember me"))
            .unwrap();
        session
            .scratch
            .put("note", serde_json::json!("pinned fact"), PutOptions::default())
            .await
            .unwrap();
        store.persist(&session).await.unwrap();

        // A fresh store over the same kv sees the full state.
        let store2 = SessionStore::new(kv, SessionStoreConfig::default());
        let restored = store2.get("s1").await.unwrap().unwrap();
        assert_eq!(restored.transcript.lock().await.message_count(), 1);
        assert_eq!(
            restored.scratch.get("note").await.unwrap(),
            serde_json::json!("pinned fact")
        );
    }

    #[tokio::test]
    async fn delete_removes_everywhere() {
        let store = store();
        let (session, _) = store.get_or_create(Some("gone")).await.unwrap();
        store.persist(&session).await.unwrap();

        assert!(store.delete("gone").await.unwrap());
        assert!(store.get("gone").await.unwrap().is_none());
        assert!(!store.delete("gone").await.unwrap());
    }

    #[tokio::test]
    async fn list_merges_resident_and_persisted() {
        let kv = Arc::new(MemoryStore::new());
        let store = SessionStore::new(kv.clone(), SessionStoreConfig::default());

        let (s1, _) = store.get_or_create(Some("resident")).await.unwrap();
        let _ = s1;
        let (s2, _) = store.get_or_create(Some("stored")).await.unwrap();
        store.persist(&s2).await.unwrap();

        let store2 = SessionStore::new(kv, SessionStoreConfig::default());
        let (_s3, _) = store2.get_or_create(Some("fresh")).await.unwrap();
        let list = store2.list().await.unwrap();
        let ids: Vec<&str> = list.iter().map(|i| i.id.as_str()).collect();
        assert!(ids.contains(&"stored"));
        assert!(ids.contains(&"fresh"));
    }

    #[tokio::test]
    async fn turns_are_serialized_in_arrival_order() {
        let store = store();
        let (session, _) = store.get_or_create(Some("busy")).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = session.begin_turn().await;
        assert!(session.is_busy());

        let s2 = session.clone();
        let o2 = order.clone();
        let waiter = tokio::spawn(async move {
            let _guard = s2.begin_turn().await;
            o2.lock().await.push("second");
        });

        // Give the waiter time to queue, then finish the first turn.
        tokio::time::sleep(Duration::from_millis(20)).await;
        order.lock().await.push("first");
        drop(guard);

        waiter.await.unwrap();
        assert_eq!(*order.lock().await, vec!["first", "second"]);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn resident_cap_evicts_idle_sessions() {
        let kv = Arc::new(MemoryStore::new());
        let store = SessionStore::new(
            kv,
            SessionStoreConfig {
                max_resident: 2,
                ..SessionStoreConfig::default()
            },
        );

        let (a, _) = store.get_or_create(Some("a")).await.unwrap();
        a.transcript
            .lock()
            .await
            .append(Message::user("keep a warm"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (_b, _) = store.get_or_create(Some("b")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let (_c, _) = store.get_or_create(Some("c")).await.unwrap();

        let resident = store.resident.read().await;
        assert_eq!(resident.len(), 2);
        drop(resident);

        // The evicted session was persisted, so it's still reachable.
        assert!(store.get("a").await.unwrap().is_some());
    }
}
