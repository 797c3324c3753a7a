//! WebSocket delivery — the bidirectional transport for the packet
//! protocol.
//!
//! Client → server frames: `{"type": "message", "content": "...",
//! "session_id": "..."}` (session generated when omitted and echoed in a
//! `{"type":"session"}` frame). Server → client frames are the same wire
//! packets the SSE transport emits, in the same order. Closing the socket
//! mid-turn cancels the turn promptly; messages arriving during a turn are
//! queued and processed in arrival order.

use crate::state::SharedState;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use scuttle_agent::cancel_pair;
use scuttle_core::message::Message;
use scuttle_stream::packet::ErrorDetail;
use scuttle_stream::turn::TurnHandle;
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::{debug, info};

/// `GET /v1/ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

#[derive(Deserialize)]
struct WsClientMessage {
    #[serde(rename = "type")]
    msg_type: String,
    content: String,
    #[serde(default)]
    session_id: Option<String>,
}

async fn handle_connection(socket: WebSocket, state: SharedState) {
    info!("WebSocket connection established");
    let (mut sender, mut receiver) = socket.split();
    let mut pending: VecDeque<String> = VecDeque::new();

    'connection: loop {
        // Next client message: queued first, then the socket.
        let text = match pending.pop_front() {
            Some(text) => text,
            None => match receiver.next().await {
                Some(Ok(WsMessage::Text(text))) => text.to_string(),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => continue, // ignore binary, ping, pong
                Some(Err(_)) => break,
            },
        };

        let client_msg: WsClientMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(e) => {
                let err = ErrorDetail::new("invalid_request_error", format!("invalid frame: {e}"));
                if send_json(&mut sender, &serde_json::json!({ "error": err }))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };
        if client_msg.msg_type != "message" {
            let err = ErrorDetail::new(
                "invalid_request_error",
                format!("unknown frame type '{}'", client_msg.msg_type),
            );
            if send_json(&mut sender, &serde_json::json!({ "error": err }))
                .await
                .is_err()
            {
                break;
            }
            continue;
        }
        if client_msg.content.is_empty() {
            let err = ErrorDetail::new("invalid_request_error", "content must not be empty");
            if send_json(&mut sender, &serde_json::json!({ "error": err }))
                .await
                .is_err()
            {
                break;
            }
            continue;
        }

        let (session, created) = match state
            .sessions
            .get_or_create(client_msg.session_id.as_deref())
            .await
        {
            Ok(pair) => pair,
            Err(e) => {
                let err = ErrorDetail::new("server_error", e.to_string());
                let _ = send_json(&mut sender, &serde_json::json!({ "error": err })).await;
                continue;
            }
        };
        if created
            && send_json(
                &mut sender,
                &serde_json::json!({ "type": "session", "session_id": session.id().to_string() }),
            )
            .await
            .is_err()
        {
            break;
        }

        // Run the turn, forwarding packets while watching the socket for
        // close (→ cancel) and queuing any messages that arrive early.
        let guard = session.begin_turn_owned().await;
        let (turn, mut rx) = TurnHandle::open(session.id().clone());
        let (canceller, token) = cancel_pair();

        let agent = state.agent.clone();
        let task_session = session.clone();
        let user_message = Message::user(client_msg.content);
        let run = tokio::spawn(async move {
            let _guard = guard;
            let mut turn = turn;
            agent
                .run_turn(&task_session, user_message, &mut turn, token)
                .await
        });

        loop {
            tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => {
                        if send_json(&mut sender, &packet.to_wire()).await.is_err() {
                            canceller.cancel();
                            let _ = run.await;
                            break 'connection;
                        }
                    }
                    None => break, // turn finished
                },
                incoming = receiver.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        debug!("Queueing message received mid-turn");
                        pending.push_back(text.to_string());
                    }
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => {
                        canceller.cancel();
                        let _ = run.await;
                        break 'connection;
                    }
                    Some(Ok(_)) => {}
                },
            }
        }
        let _ = run.await;
    }

    info!("WebSocket connection closed");
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, WsMessage>,
    value: &serde_json::Value,
) -> Result<(), axum::Error> {
    sender.send(WsMessage::Text(value.to_string().into())).await
}
