//! Error types for the Scuttle domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Scuttle operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Working-set cache errors ---
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    // --- Conversation context errors ---
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    // --- Backing store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Stream delivery errors ---
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    // --- Malformed client request; no turn is opened ---
    #[error("Validation error: {0}")]
    Validation(String),

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether the orchestration loop should retry this error with backoff.
    ///
    /// Auth and model-id failures are permanent; rate limits, timeouts,
    /// network faults, and 5xx responses are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Network(_) => true,
            Self::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool already registered: {0}")]
    Duplicate(String),

    #[error("Tool arguments rejected by schema: {0}")]
    SchemaViolation(String),

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Cache capacity exceeded: {needed} bytes needed, {capacity} available after evicting all unpinned entries")]
    CapacityExceeded { needed: usize, capacity: usize },

    #[error("Failed to serialize cache value: {0}")]
    Serialization(String),
}

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Summarization failed: {0}")]
    SummarizationFailed(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Failed to encode stored value: {0}")]
    Serialization(String),
}

#[derive(Debug, Error)]
pub enum StreamError {
    /// Emit was called on a handle that already delivered its terminal packet.
    /// This is a programming-contract violation, not a runtime condition.
    #[error("Turn already closed")]
    TurnClosed,

    #[error("Client disconnected")]
    Disconnected,
}
