//! Configuration loading, validation, and management for Scuttle.
//!
//! Loads configuration from `~/.scuttle/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.scuttle/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key for the upstream model provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL of the OpenAI-compatible provider endpoint
    #[serde(default = "default_provider_url")]
    pub provider_url: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Models accepted by the gateway; requests naming anything else are
    /// rejected before a turn is opened. Empty = accept any model id.
    #[serde(default)]
    pub models: Vec<String>,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per completion round
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Orchestration loop settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Working-set cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Conversation context settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Backing store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Gateway settings
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_provider_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("provider_url", &self.provider_url)
            .field("default_model", &self.default_model)
            .field("models", &self.models)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("cache", &self.cache)
            .field("context", &self.context)
            .field("session", &self.session)
            .field("store", &self.store)
            .field("gateway", &self.gateway)
            .finish()
    }
}

/// Orchestration loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum tool-call rounds per turn
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,

    /// Retries for a failed completion request
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential retry backoff, in milliseconds
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Per-tool execution timeout, in seconds
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,

    /// Overall wall-clock cap for a turn, in seconds
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,

    /// System prompt sent at the head of every session
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_tool_rounds() -> u32 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    500
}
fn default_tool_timeout_secs() -> u64 {
    60
}
fn default_turn_timeout_secs() -> u64 {
    600
}
fn default_system_prompt() -> String {
    "You are a helpful assistant. You have a scratch pad for working memory: \
     store intermediate results there and search it before asking the user to repeat themselves."
        .into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            tool_timeout_secs: default_tool_timeout_secs(),
            turn_timeout_secs: default_turn_timeout_secs(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// Working-set cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Capacity per session, in bytes of stored values
    #[serde(default = "default_cache_capacity")]
    pub capacity_bytes: usize,

    /// Entries carrying this tag are never evicted
    #[serde(default = "default_pin_tag")]
    pub pin_tag: String,

    /// Default TTL for entries that don't set one, in seconds (0 = none)
    #[serde(default)]
    pub default_ttl_secs: u64,
}

fn default_cache_capacity() -> usize {
    256 * 1024
}
fn default_pin_tag() -> String {
    "keep".into()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: default_cache_capacity(),
            pin_tag: default_pin_tag(),
            default_ttl_secs: 0,
        }
    }
}

/// Conversation context settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Estimated-token budget before summarization triggers
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Most recent messages always preserved verbatim
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
}

fn default_token_budget() -> usize {
    6000
}
fn default_keep_recent() -> usize {
    4
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            keep_recent: default_keep_recent(),
        }
    }
}

/// Session lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Backing-store TTL for persisted session snapshots, in seconds
    /// (0 = never expire)
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Maximum sessions held in memory at once; the least recently
    /// active is dropped (it stays in the backing store)
    #[serde(default = "default_max_resident")]
    pub max_resident: usize,
}

fn default_session_ttl() -> u64 {
    7 * 24 * 3600
}
fn default_max_resident() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            max_resident: default_max_resident(),
        }
    }
}

/// Backing store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend: "memory", "file", or "sqlite"
    #[serde(default = "default_store_backend")]
    pub backend: String,

    /// Directory (file backend) or database path (sqlite backend);
    /// defaults under `~/.scuttle/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

fn default_store_backend() -> String {
    "sqlite".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

/// Gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    8340
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.scuttle/config.toml).
    ///
    /// Environment overrides:
    /// - `SCUTTLE_API_KEY` (falls back to `OPENAI_API_KEY`)
    /// - `SCUTTLE_MODEL`
    /// - `SCUTTLE_PROVIDER_URL`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("SCUTTLE_API_KEY")
                .ok()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok());
        }
        if let Ok(model) = std::env::var("SCUTTLE_MODEL") {
            config.default_model = model;
        }
        if let Ok(url) = std::env::var("SCUTTLE_PROVIDER_URL") {
            config.provider_url = url;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".scuttle")
    }

    /// Whether a model id is accepted by this deployment.
    pub fn model_allowed(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.default_temperature) {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.cache.capacity_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "cache.capacity_bytes must be greater than 0".into(),
            ));
        }
        if self.context.keep_recent == 0 {
            return Err(ConfigError::ValidationError(
                "context.keep_recent must be at least 1".into(),
            ));
        }
        match self.store.backend.as_str() {
            "memory" | "file" | "sqlite" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "unknown store backend '{other}' (expected memory, file, or sqlite)"
                )));
            }
        }
        Ok(())
    }

    /// Generate a default config TOML string (for the `onboard` command).
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            provider_url: default_provider_url(),
            default_model: default_model(),
            models: vec![],
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            cache: CacheConfig::default(),
            context: ContextConfig::default(),
            session: SessionConfig::default(),
            store: StoreConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
