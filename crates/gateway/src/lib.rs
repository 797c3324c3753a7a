//! HTTP API gateway for Scuttle.
//!
//! Exposes the chat surface (SSE streaming and non-streaming), session
//! management, a WebSocket transport for the same packet protocol, a
//! domain-event log stream, and health checks.
//!
//! Built on Axum for high performance async HTTP.

pub mod api;
pub mod models;
pub mod state;
pub mod ws;

pub use state::{GatewayState, SharedState};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use scuttle_agent::{AgentLoop, AgentLoopConfig};
use scuttle_config::AppConfig;
use scuttle_core::event::EventBus;
use scuttle_session::{
    SessionStore, SessionStoreConfig, TranscriptConfig, WorkingSetConfig,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/models", get(api::list_models))
        .route("/v1/chat/completions", post(api::chat_completions))
        .route("/v1/sessions", get(api::list_sessions))
        .route(
            "/v1/sessions/{id}",
            get(api::get_session).delete(api::delete_session),
        )
        .route("/v1/sessions/{id}/scratch", get(api::get_scratch))
        .route("/v1/ws", get(ws::ws_handler))
        .route("/v1/logs", get(api::log_stream))
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1 MB body limit
        .layer(CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Map the app config onto session-store tuning.
pub fn session_store_config(config: &AppConfig) -> SessionStoreConfig {
    SessionStoreConfig {
        cache: WorkingSetConfig {
            capacity_bytes: config.cache.capacity_bytes,
            pin_tag: config.cache.pin_tag.clone(),
            default_ttl: (config.cache.default_ttl_secs > 0)
                .then(|| Duration::from_secs(config.cache.default_ttl_secs)),
        },
        transcript: TranscriptConfig {
            token_budget: config.context.token_budget,
            keep_recent: config.context.keep_recent,
        },
        snapshot_ttl: (config.session.ttl_secs > 0)
            .then(|| Duration::from_secs(config.session.ttl_secs)),
        max_resident: config.session.max_resident,
    }
}

/// Map the app config onto loop tuning.
pub fn agent_loop_config(config: &AppConfig) -> AgentLoopConfig {
    AgentLoopConfig {
        model: config.default_model.clone(),
        temperature: config.default_temperature,
        max_tokens: Some(config.default_max_tokens),
        max_tool_rounds: config.agent.max_tool_rounds,
        max_retries: config.agent.max_retries,
        retry_base: Duration::from_millis(config.agent.retry_base_ms),
        turn_timeout: Duration::from_secs(config.agent.turn_timeout_secs),
        system_prompt: config.agent.system_prompt.clone(),
    }
}

/// Start the gateway HTTP server.
///
/// Wires the provider, tool registry, backing store, session store, and
/// agent loop once, and shares them across handlers via Arc.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let kv = scuttle_store::build_from_config(
        &config.store.backend,
        config.store.path.as_deref(),
    )
    .await?;
    let provider = scuttle_providers::build_from_config(&config);
    let tools = Arc::new(scuttle_tools::default_registry(Duration::from_secs(
        config.agent.tool_timeout_secs,
    )));
    let sessions = Arc::new(SessionStore::new(kv, session_store_config(&config)));
    let event_bus = Arc::new(EventBus::default());
    let agent = Arc::new(AgentLoop::new(
        provider,
        tools,
        sessions.clone(),
        event_bus.clone(),
        agent_loop_config(&config),
    ));

    let state = Arc::new(GatewayState {
        config,
        agent,
        sessions,
        event_bus,
    });

    let app = build_router(state);
    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use scuttle_core::error::ProviderError;
    use scuttle_core::message::Message;
    use scuttle_core::provider::{
        Completion, CompletionRequest, FinishReason, Provider, StreamChunk, Usage,
    };
    use scuttle_store::MemoryStore;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    /// Streams "Hel" + "lo" then a natural stop.
    struct StubProvider;

    #[async_trait]
    impl Provider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<Completion, ProviderError> {
            Ok(Completion {
                message: Message::assistant("Hello"),
                finish_reason: FinishReason::Stop,
                usage: None,
                model: "stub".into(),
            })
        }

        async fn stream(
            &self,
            _request: CompletionRequest,
        ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                for text in ["Hel", "lo"] {
                    let _ = tx
                        .send(Ok(StreamChunk {
                            content: Some(text.into()),
                            tool_calls: vec![],
                            done: false,
                            finish_reason: None,
                            usage: None,
                        }))
                        .await;
                }
                let _ = tx
                    .send(Ok(StreamChunk {
                        content: None,
                        tool_calls: vec![],
                        done: true,
                        finish_reason: Some(FinishReason::Stop),
                        usage: Some(Usage {
                            prompt_tokens: 4,
                            completion_tokens: 2,
                            total_tokens: 6,
                        }),
                    }))
                    .await;
            });
            Ok(rx)
        }
    }

    fn test_state(config: AppConfig) -> SharedState {
        let kv = Arc::new(MemoryStore::new());
        let tools = Arc::new(scuttle_tools::default_registry(Duration::from_secs(5)));
        let sessions = Arc::new(SessionStore::new(kv, session_store_config(&config)));
        let event_bus = Arc::new(EventBus::default());
        let agent = Arc::new(AgentLoop::new(
            Arc::new(StubProvider),
            tools,
            sessions.clone(),
            event_bus.clone(),
            agent_loop_config(&config),
        ));
        Arc::new(GatewayState {
            config,
            agent,
            sessions,
            event_bus,
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn chat_request(body: &serde_json::Value, session: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json");
        if let Some(id) = session {
            builder = builder.header("x-session-id", id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let app = build_router(test_state(AppConfig::default()));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn models_endpoint_lists_default() {
        let app = build_router(test_state(AppConfig::default()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "gpt-4o");
    }

    #[tokio::test]
    async fn empty_messages_is_rejected_without_a_session() {
        let state = test_state(AppConfig::default());
        let app = build_router(state.clone());

        let response = app
            .oneshot(chat_request(
                &serde_json::json!({"model": "gpt-4o", "messages": []}),
                Some("never-created"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert!(body["error"]["param"].is_null());

        // No turn was opened, no session created.
        assert!(state.sessions.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_model_is_rejected() {
        let config = AppConfig {
            models: vec!["gpt-4o".into()],
            ..AppConfig::default()
        };
        let app = build_router(test_state(config));

        let response = app
            .oneshot(chat_request(
                &serde_json::json!({
                    "model": "made-up-model",
                    "messages": [{"role": "user", "content": "hi"}]
                }),
                None,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("made-up-model")
        );
    }

    #[tokio::test]
    async fn non_streaming_chat_returns_completion() {
        let app = build_router(test_state(AppConfig::default()));

        let response = app
            .oneshot(chat_request(
                &serde_json::json!({
                    "model": "gpt-4o",
                    "messages": [{"role": "user", "content": "hi"}]
                }),
                None,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-session-id"));
        let body = body_json(response).await;
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn streaming_chat_emits_sequenced_packets_and_done() {
        let app = build_router(test_state(AppConfig::default()));

        let response = app
            .oneshot(chat_request(
                &serde_json::json!({
                    "model": "gpt-4o",
                    "messages": [{"role": "user", "content": "hi"}],
                    "stream": true
                }),
                Some("stream-test"),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-session-id").unwrap(),
            "stream-test"
        );

        let body = body_text(response).await;
        let payloads: Vec<&str> = body
            .lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .collect();
        assert_eq!(payloads.last(), Some(&"[DONE]"));

        let packets: Vec<serde_json::Value> = payloads[..payloads.len() - 1]
            .iter()
            .map(|p| serde_json::from_str(p).unwrap())
            .collect();
        // Gapless sequence, deltas then terminal.
        assert_eq!(packets.len(), 3);
        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet["sequence"], i as u64);
        }
        assert_eq!(packets[0]["payload"]["delta"]["content"], "Hel");
        assert_eq!(packets[1]["payload"]["delta"]["content"], "lo");
        assert_eq!(packets[2]["payload"]["finish_reason"], "stop");
    }

    #[tokio::test]
    async fn session_endpoints_roundtrip() {
        let state = test_state(AppConfig::default());
        let app = build_router(state.clone());

        // Run a turn under a known session id.
        let response = app
            .clone()
            .oneshot(chat_request(
                &serde_json::json!({
                    "model": "gpt-4o",
                    "messages": [{"role": "user", "content": "hi"}]
                }),
                Some("s1"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // History is visible: system + user + assistant.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/sessions/s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);

        // Scratch inspection answers even when empty.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/sessions/s1/scratch")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Delete, then 404.
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/sessions/s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/sessions/s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
