//! Session state for Scuttle.
//!
//! Each session owns an ordered conversation transcript (with budgeted
//! summarization) and a bounded working-set cache, serialized per session
//! by a turn lock and persisted to the backing store as JSON snapshots.

pub mod cache;
pub mod history;
pub mod store;

pub use cache::{WorkingSet, WorkingSetConfig, WorkingSetSnapshot};
pub use history::{Compaction, Transcript, TranscriptConfig, TranscriptSnapshot};
pub use store::{Session, SessionInfo, SessionSnapshot, SessionStore, SessionStoreConfig};
