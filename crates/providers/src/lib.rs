//! Model completion service clients for Scuttle.
//!
//! The `Provider` trait lives in `scuttle-core`; this crate supplies the
//! HTTP-backed implementation used in production.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatProvider;

use scuttle_core::provider::Provider;
use std::sync::Arc;

/// Build the configured provider.
///
/// Endpoints under `localhost:11434` are treated as Ollama (no real key
/// required); everything else gets the configured API key.
pub fn build_from_config(config: &scuttle_config::AppConfig) -> Arc<dyn Provider> {
    if config.provider_url.contains("localhost:11434") {
        return Arc::new(OpenAiCompatProvider::ollama(Some(&config.provider_url)));
    }
    Arc::new(OpenAiCompatProvider::new(
        "openai",
        &config.provider_url,
        config.api_key.clone().unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builds_ollama_for_local_endpoint() {
        let config = scuttle_config::AppConfig {
            provider_url: "http://localhost:11434/v1".into(),
            ..Default::default()
        };
        let provider = build_from_config(&config);
        assert_eq!(provider.name(), "ollama");
    }

    #[test]
    fn config_builds_openai_compat_by_default() {
        let config = scuttle_config::AppConfig::default();
        let provider = build_from_config(&config);
        assert_eq!(provider.name(), "openai");
    }
}
