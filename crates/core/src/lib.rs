//! # Scuttle Core
//!
//! Domain types, traits, and error definitions for the Scuttle agent
//! runtime. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every external capability is a trait here: the model completion service
//! (`Provider`), tool handlers (`Tool`), the scratch memory (`ScratchStore`),
//! and the persistence primitive (`KvStore`). Implementations live in their
//! respective crates, which keeps the dependency graph pointing inward and
//! makes every seam mockable in tests.

pub mod error;
pub mod event;
pub mod kv;
pub mod message;
pub mod provider;
pub mod scratch;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use event::{DomainEvent, EventBus};
pub use kv::KvStore;
pub use message::{ContentPart, Message, MessageContent, MessageToolCall, Role, SessionId};
pub use provider::{
    Completion, CompletionRequest, FinishReason, Provider, StreamChunk, ToolDefinition, Usage,
};
pub use scratch::{CacheEntry, CacheQuery, CacheStats, PutOptions, ScratchStore};
pub use tool::{Tool, ToolCall, ToolContext, ToolRegistry, ToolResult};
