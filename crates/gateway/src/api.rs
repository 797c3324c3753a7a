//! The /v1 API surface: chat completions, session management, model
//! listing, and the domain-event log stream.
//!
//! Streaming chat responses carry the packet protocol from
//! `scuttle-stream`: each SSE `data:` line is one wire packet, the stream
//! ends with `data: [DONE]`. Validation failures are answered with the
//! unwrapped error object before any turn is opened.

use crate::models::{
    ApiUsage, ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ModelInfo,
    ModelListResponse, ResponseMessage,
};
use crate::state::SharedState;
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::response::{IntoResponse, Response};
use scuttle_agent::cancel_pair;
use scuttle_core::message::Message;
use scuttle_session::Session;
use scuttle_stream::packet::PacketBody;
use scuttle_stream::turn::TurnHandle;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

const SESSION_HEADER: &str = "x-session-id";

/// Build the unwrapped error object the protocol mandates.
pub(crate) fn error_response(
    status: StatusCode,
    error_type: &str,
    message: impl Into<String>,
) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "message": message.into(),
                "type": error_type,
                "param": null,
                "code": null,
            }
        })),
    )
        .into_response()
}

fn with_session_header(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// `POST /v1/chat/completions` — OpenAI-shaped chat endpoint.
///
/// The session is selected by the `X-Session-Id` header (created when
/// absent) and echoed back on every response.
pub async fn chat_completions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<ChatCompletionRequest>,
) -> Response {
    // ValidationError: reject before any turn is opened.
    if payload.messages.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "messages must not be empty",
        );
    }
    if !state.config.model_allowed(&payload.model) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            format!("unknown model id: {}", payload.model),
        );
    }
    let Some(last_user) = payload.messages.iter().rev().find(|m| m.role == "user") else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "at least one user message is required",
        );
    };
    let content = match last_user.to_content() {
        Ok(content) if !content.is_empty() => content,
        Ok(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "user message must not be empty",
            );
        }
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request_error", e);
        }
    };

    let header_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty());
    let (session, created) = match state.sessions.get_or_create(header_id).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(error = %e, "Session lookup failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "session store unavailable",
            );
        }
    };
    let session_id = session.id().to_string();
    info!(session_id = %session_id, created, stream = payload.stream, "Chat request");
    let user_message = Message::user(content);

    if payload.stream {
        stream_turn(state, session, session_id, user_message).await
    } else {
        collected_turn(state, session, session_id, user_message).await
    }
}

/// Streaming path: packets flow out as SSE `data:` lines as the loop
/// produces them; a dropped response body cancels the turn.
async fn stream_turn(
    state: SharedState,
    session: Arc<Session>,
    session_id: String,
    user_message: Message,
) -> Response {
    // Queue behind any in-flight turn; arrival order is the lock order.
    let guard = session.begin_turn_owned().await;
    let (turn, rx) = TurnHandle::open(session.id().clone());
    // Client disconnect surfaces as a dropped receiver; the token is the
    // explicit-cancel path and stays unfired here.
    let (_canceller, token) = cancel_pair();

    let agent = state.agent.clone();
    let task_session = session.clone();
    tokio::spawn(async move {
        let _guard = guard;
        let mut turn = turn;
        let _ = agent
            .run_turn(&task_session, user_message, &mut turn, token)
            .await;
    });

    let stream = ReceiverStream::new(rx)
        .map(|packet| {
            Ok::<_, Infallible>(SseEvent::default().data(packet.to_wire().to_string()))
        })
        .chain(tokio_stream::once(Ok(SseEvent::default().data("[DONE]"))));

    with_session_header(Sse::new(stream).into_response(), &session_id)
}

/// Non-streaming path: run the turn to completion and shape the collected
/// packets into a `chat.completion` body.
async fn collected_turn(
    state: SharedState,
    session: Arc<Session>,
    session_id: String,
    user_message: Message,
) -> Response {
    let (outcome, packets) = state.agent.run_collected(&session, user_message).await;

    if let Some(PacketBody::Error { error }) = packets.last().map(|p| &p.body) {
        let response = (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": error })),
        )
            .into_response();
        return with_session_header(response, &session_id);
    }

    let completion_tokens = (outcome.text.len() / 4) as u32;
    let total_tokens = if outcome.total_tokens > 0 {
        outcome.total_tokens
    } else {
        completion_tokens
    };
    let finish_reason = match outcome.finish {
        scuttle_agent::TurnFinish::Truncated => "length",
        _ => "stop",
    };

    let body = ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        object: "chat.completion",
        created: chrono::Utc::now().timestamp(),
        model: state.config.default_model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ResponseMessage {
                role: "assistant",
                content: outcome.text,
            },
            finish_reason: finish_reason.into(),
        }],
        usage: ApiUsage {
            prompt_tokens: total_tokens.saturating_sub(completion_tokens),
            completion_tokens,
            total_tokens,
        },
    };
    with_session_header(Json(body).into_response(), &session_id)
}

/// `GET /v1/models` — the configured model list.
pub async fn list_models(State(state): State<SharedState>) -> Json<ModelListResponse> {
    let created = chrono::Utc::now().timestamp();
    let mut ids = state.config.models.clone();
    if ids.is_empty() {
        ids.push(state.config.default_model.clone());
    }
    Json(ModelListResponse {
        object: "list",
        data: ids
            .into_iter()
            .map(|id| ModelInfo {
                id,
                object: "model",
                created,
                owned_by: "scuttle",
            })
            .collect(),
    })
}

/// `GET /v1/sessions` — all known sessions.
pub async fn list_sessions(State(state): State<SharedState>) -> Response {
    match state.sessions.list().await {
        Ok(sessions) => Json(json!({ "sessions": sessions })).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            e.to_string(),
        ),
    }
}

/// `GET /v1/sessions/{id}` — history and summary for one session.
pub async fn get_session(
    State(state): State<SharedState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Response {
    match state.sessions.get(&id).await {
        Ok(Some(session)) => {
            let transcript = session.transcript.lock().await;
            Json(json!({
                "id": id,
                "created_at": session.created_at(),
                "summary": transcript.summary(),
                "messages": transcript.messages(),
            }))
            .into_response()
        }
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            format!("no session '{id}'"),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            e.to_string(),
        ),
    }
}

/// `DELETE /v1/sessions/{id}` — drop a session everywhere.
pub async fn delete_session(
    State(state): State<SharedState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Response {
    match state.sessions.delete(&id).await {
        Ok(true) => Json(json!({ "deleted": true })).into_response(),
        Ok(false) => error_response(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            format!("no session '{id}'"),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            e.to_string(),
        ),
    }
}

/// `GET /v1/sessions/{id}/scratch` — working-set contents and statistics.
pub async fn get_scratch(
    State(state): State<SharedState>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Response {
    use scuttle_core::scratch::ScratchStore;

    match state.sessions.get(&id).await {
        Ok(Some(session)) => {
            let entries = session.scratch.list().await.unwrap_or_default();
            let stats = session.scratch.stats().await.ok();
            Json(json!({ "entries": entries, "stats": stats })).into_response()
        }
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "invalid_request_error",
            format!("no session '{id}'"),
        ),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_error",
            e.to_string(),
        ),
    }
}

/// `GET /v1/logs` — SSE stream of domain events (turn activity, tool
/// dispatches, compactions).
pub async fn log_stream(
    State(state): State<SharedState>,
) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.event_bus.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|event| {
        let event = event.ok()?;
        let data = serde_json::to_string(event.as_ref()).ok()?;
        Some(Ok(SseEvent::default().data(data)))
    });
    Sse::new(stream)
}
