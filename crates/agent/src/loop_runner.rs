//! The orchestration loop.
//!
//! Drives one turn through its states:
//! Idle → AwaitingModel → StreamingText → ExecutingTools → AwaitingModel
//! (resume) → Terminal. Content deltas are forwarded to the turn handle as
//! they arrive; tool calls are appended to history, announced, dispatched
//! through the registry, and their results fed back before the next
//! completion request. Provider failures retry with bounded backoff; the
//! tool-round cap ends the turn gracefully; cancellation is honored at
//! every suspension point and never leaves a dangling tool call in history.

use crate::cancel::CancelToken;
use chrono::Utc;
use scuttle_core::error::ProviderError;
use scuttle_core::event::{DomainEvent, EventBus};
use scuttle_core::message::Message;
use scuttle_core::provider::{CompletionRequest, FinishReason, Provider, StreamChunk};
use scuttle_core::tool::{ToolCall, ToolContext, ToolRegistry};
use scuttle_session::history::Compaction;
use scuttle_session::store::{Session, SessionStore};
use scuttle_stream::packet::{AnnouncedToolCall, ErrorDetail, StreamPacket};
use scuttle_stream::turn::TurnHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Tuning for the loop.
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,

    /// Maximum tool-call rounds per turn
    pub max_tool_rounds: u32,

    /// Retries for a failed completion request
    pub max_retries: u32,

    /// Base delay for exponential retry backoff
    pub retry_base: Duration,

    /// Overall wall-clock cap for a turn
    pub turn_timeout: Duration,

    /// Base system prompt; the scratch-pad digest is appended each turn
    pub system_prompt: String,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".into(),
            temperature: 0.7,
            max_tokens: None,
            max_tool_rounds: 10,
            max_retries: 3,
            retry_base: Duration::from_millis(500),
            turn_timeout: Duration::from_secs(600),
            system_prompt: "You are a helpful assistant.".into(),
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnFinish {
    /// Natural stop
    Stop,
    /// Tool-round cap reached; truncated but not an error
    Truncated,
    /// Client cancelled or disconnected
    Cancelled,
    /// Unrecoverable failure; the turn closed with an error marker
    Error(String),
}

/// What a completed turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub finish: TurnFinish,

    /// Concatenated assistant text across all rounds
    pub text: String,

    /// Tool rounds actually dispatched
    pub tool_rounds: u32,

    /// Total tokens reported by the provider
    pub total_tokens: u32,

    /// Packets emitted, terminal included
    pub packets: u64,
}

/// The agent loop: one instance serves every session, state is per-session.
pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    event_bus: Arc<EventBus>,
    config: AgentLoopConfig,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        sessions: Arc<SessionStore>,
        event_bus: Arc<EventBus>,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            sessions,
            event_bus,
            config,
        }
    }

    pub fn config(&self) -> &AgentLoopConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Run one turn. The caller must hold the session's turn lock and drain
    /// the receiver paired with `turn`.
    ///
    /// Always closes the turn exactly once (terminal or error marker) and
    /// persists session state before returning.
    pub async fn run_turn(
        &self,
        session: &Session,
        user_message: Message,
        turn: &mut TurnHandle,
        cancel: CancelToken,
    ) -> TurnOutcome {
        let session_id = session.id().to_string();
        info!(session_id = %session_id, "Turn opened");
        self.event_bus.publish(DomainEvent::TurnOpened {
            session_id: session_id.clone(),
            timestamp: Utc::now(),
        });

        // Idle → AwaitingModel: history is appended first.
        {
            let digest = session.scratch.context_summary().await;
            let mut transcript = session.transcript.lock().await;
            transcript
                .set_system_prompt(format!("{}\n\n{digest}", self.config.system_prompt));
            if let Err(e) = transcript.append(user_message) {
                drop(transcript);
                let _ = turn
                    .fail(ErrorDetail::new("invalid_request_error", e.to_string()))
                    .await;
                return self.finish(session, turn, TurnFinish::Error(e.to_string()), String::new(), 0, 0);
            }
        }

        // Bind before matching so the timed-out future (and its borrow of
        // `turn`) is dropped before the error arm reuses the handle.
        let drove =
            tokio::time::timeout(self.config.turn_timeout, self.drive(session, turn, &cancel))
                .await;
        let outcome = match drove {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(session_id = %session_id, "Turn exceeded wall-clock limit");
                self.repair_dangling_tool_calls(session, "Tool execution abandoned: turn timed out")
                    .await;
                let _ = turn
                    .fail(ErrorDetail::new(
                        "timeout",
                        format!(
                            "turn exceeded the {}s wall-clock limit",
                            self.config.turn_timeout.as_secs()
                        ),
                    ))
                    .await;
                TurnOutcome {
                    finish: TurnFinish::Error("turn timeout".into()),
                    text: String::new(),
                    tool_rounds: 0,
                    total_tokens: 0,
                    packets: turn.emitted(),
                }
            }
        };

        if let Err(e) = self.sessions.persist(session).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist session after turn");
        }
        self.event_bus.publish(DomainEvent::TurnClosed {
            session_id,
            reason: match &outcome.finish {
                TurnFinish::Stop => "stop".into(),
                TurnFinish::Truncated => "truncated".into(),
                TurnFinish::Cancelled => "cancelled".into(),
                TurnFinish::Error(e) => format!("error: {e}"),
            },
            packets: outcome.packets,
            timestamp: Utc::now(),
        });
        outcome
    }

    /// Convenience wrapper for non-streaming callers: acquires the turn
    /// lock, runs the turn, and collects the full packet sequence.
    pub async fn run_collected(
        &self,
        session: &Session,
        user_message: Message,
    ) -> (TurnOutcome, Vec<StreamPacket>) {
        let _guard = session.begin_turn().await;
        let (mut turn, mut rx) = TurnHandle::open(session.id().clone());
        let (_canceller, token) = crate::cancel::cancel_pair();

        let collector = tokio::spawn(async move {
            let mut packets = Vec::new();
            while let Some(packet) = rx.recv().await {
                packets.push(packet);
            }
            packets
        });

        let outcome = self.run_turn(session, user_message, &mut turn, token).await;
        drop(turn);
        let packets = collector.await.unwrap_or_default();
        (outcome, packets)
    }

    /// The round loop: request a completion, forward its stream, dispatch
    /// any tool calls, repeat.
    async fn drive(
        &self,
        session: &Session,
        turn: &mut TurnHandle,
        cancel: &CancelToken,
    ) -> TurnOutcome {
        let definitions = self.tools.definitions();
        let ctx = ToolContext::new(session.id().clone(), session.scratch.clone());
        let mut rounds_used: u32 = 0;
        let mut total_tokens: u32 = 0;
        let mut final_text = String::new();

        loop {
            // Summarize-if-needed runs synchronously before each completion
            // request, never mid-stream.
            {
                let mut transcript = session.transcript.lock().await;
                match transcript
                    .compact_if_needed(self.provider.as_ref(), &self.config.model)
                    .await
                {
                    Compaction::NotNeeded => {}
                    Compaction::Summarized { before, after } => {
                        self.event_bus.publish(DomainEvent::ContextCompacted {
                            session_id: session.id().to_string(),
                            messages_before: before,
                            messages_after: after,
                            summarized: true,
                            timestamp: Utc::now(),
                        });
                    }
                    Compaction::Truncated { before, after } => {
                        self.event_bus.publish(DomainEvent::ContextCompacted {
                            session_id: session.id().to_string(),
                            messages_before: before,
                            messages_after: after,
                            summarized: false,
                            timestamp: Utc::now(),
                        });
                    }
                }
            }

            let request = {
                let transcript = session.transcript.lock().await;
                CompletionRequest {
                    model: self.config.model.clone(),
                    messages: transcript.messages().to_vec(),
                    temperature: self.config.temperature,
                    max_tokens: self.config.max_tokens,
                    tools: definitions.clone(),
                    stream: true,
                }
            };

            // AwaitingModel, with bounded retries.
            let mut rx = match self.open_stream(request, cancel).await {
                Ok(rx) => rx,
                Err(e) => {
                    if cancel.is_cancelled() {
                        return self
                            .close_cancelled(session, turn, String::new(), rounds_used, total_tokens)
                            .await;
                    }
                    error!(error = %e, "Completion request failed after retries");
                    self.event_bus.publish(DomainEvent::ErrorOccurred {
                        context: "model_service".into(),
                        error_message: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    let _ = turn
                        .fail(ErrorDetail::new(
                            "server_error",
                            format!("model service unavailable: {e}"),
                        ))
                        .await;
                    return TurnOutcome {
                        finish: TurnFinish::Error(e.to_string()),
                        text: final_text,
                        tool_rounds: rounds_used,
                        total_tokens,
                        packets: turn.emitted(),
                    };
                }
            };

            // StreamingText: forward deltas as they arrive.
            let mut buffer = String::new();
            let mut terminal: Option<StreamChunk> = None;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return self
                            .close_cancelled(session, turn, buffer, rounds_used, total_tokens)
                            .await;
                    }
                    next = rx.recv() => next,
                };
                match next {
                    None => break,
                    Some(Err(e)) => {
                        // Deltas already left for the client; this round
                        // cannot be replayed. Close with the error marker.
                        warn!(error = %e, "Model stream interrupted mid-round");
                        self.append_assistant_text(session, &buffer).await;
                        final_text.push_str(&buffer);
                        let _ = turn
                            .fail(ErrorDetail::new(
                                "server_error",
                                format!("model stream interrupted: {e}"),
                            ))
                            .await;
                        return TurnOutcome {
                            finish: TurnFinish::Error(e.to_string()),
                            text: final_text,
                            tool_rounds: rounds_used,
                            total_tokens,
                            packets: turn.emitted(),
                        };
                    }
                    Some(Ok(chunk)) => {
                        if let Some(text) = chunk.content.as_deref().filter(|t| !t.is_empty()) {
                            buffer.push_str(text);
                            if turn.emit_delta(text).await.is_err() {
                                // Receiver gone: the client hung up.
                                return self
                                    .close_cancelled(
                                        session,
                                        turn,
                                        buffer,
                                        rounds_used,
                                        total_tokens,
                                    )
                                    .await;
                            }
                        }
                        if chunk.done {
                            terminal = Some(chunk);
                            break;
                        }
                    }
                }
            }

            let Some(done) = terminal else {
                warn!("Model stream ended without a terminal event");
                self.append_assistant_text(session, &buffer).await;
                final_text.push_str(&buffer);
                let _ = turn
                    .fail(ErrorDetail::new(
                        "server_error",
                        "model stream ended unexpectedly",
                    ))
                    .await;
                return TurnOutcome {
                    finish: TurnFinish::Error("stream ended unexpectedly".into()),
                    text: final_text,
                    tool_rounds: rounds_used,
                    total_tokens,
                    packets: turn.emitted(),
                };
            };

            if let Some(usage) = &done.usage {
                total_tokens += usage.total_tokens;
            }
            self.event_bus.publish(DomainEvent::ResponseGenerated {
                session_id: session.id().to_string(),
                model: self.config.model.clone(),
                tokens_used: done.usage.as_ref().map_or(0, |u| u.total_tokens),
                timestamp: Utc::now(),
            });

            if done.tool_calls.is_empty() {
                // Natural stop.
                self.append_assistant_text(session, &buffer).await;
                final_text.push_str(&buffer);
                let reason = match done.finish_reason {
                    Some(FinishReason::Length) => FinishReason::Length,
                    _ => FinishReason::Stop,
                };
                let _ = turn.close(reason).await;
                return self.finish(
                    session,
                    turn,
                    TurnFinish::Stop,
                    final_text,
                    rounds_used,
                    total_tokens,
                );
            }

            // The model wants tools.
            if rounds_used >= self.config.max_tool_rounds {
                // Iteration cap: not an error — end normally, dispatch
                // nothing further, note the truncation.
                info!(
                    rounds = rounds_used,
                    "Tool-round cap reached, truncating turn"
                );
                let note = if buffer.is_empty() {
                    "[Tool-call limit reached; response truncated.]".to_string()
                } else {
                    format!("{buffer}\n[Tool-call limit reached; response truncated.]")
                };
                self.append_assistant_text(session, &note).await;
                final_text.push_str(&note);
                let _ = turn
                    .emit_delta("\n[Tool-call limit reached; response truncated.]")
                    .await;
                let _ = turn.close(FinishReason::Length).await;
                return self.finish(
                    session,
                    turn,
                    TurnFinish::Truncated,
                    final_text,
                    rounds_used,
                    total_tokens,
                );
            }
            rounds_used += 1;

            // StreamingText → ExecutingTools: record the call intent, then
            // announce it to the client.
            let calls: Vec<ToolCall> = done
                .tool_calls
                .iter()
                .map(|tc| ToolCall {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    arguments: serde_json::from_str(&tc.arguments)
                        .unwrap_or_else(|_| serde_json::json!({})),
                })
                .collect();
            {
                let mut transcript = session.transcript.lock().await;
                let _ = transcript.append(Message::assistant_tool_calls(
                    buffer.clone(),
                    done.tool_calls.clone(),
                ));
            }
            final_text.push_str(&buffer);

            let announced: Vec<AnnouncedToolCall> = calls
                .iter()
                .map(|c| AnnouncedToolCall {
                    id: c.id.clone(),
                    name: c.name.clone(),
                    arguments: c.arguments.clone(),
                })
                .collect();
            if turn.emit_tool_calls(announced).await.is_err() {
                return self
                    .close_cancelled(session, turn, String::new(), rounds_used, total_tokens)
                    .await;
            }

            // Dispatch sequentially; a failure becomes a tool message the
            // model can recover from, never a crash of the loop.
            for call in &calls {
                debug!(tool = %call.name, call_id = %call.id, "Dispatching tool call");
                let started = std::time::Instant::now();
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // Best-effort abandon: the handler keeps running in
                        // its own right, but the turn moves to Terminal now.
                        return self
                            .close_cancelled(session, turn, String::new(), rounds_used, total_tokens)
                            .await;
                    }
                    result = self.tools.dispatch(call, &ctx) => result,
                };
                self.event_bus.publish(DomainEvent::ToolExecuted {
                    tool_name: call.name.clone(),
                    success: result.success,
                    duration_ms: started.elapsed().as_millis() as u64,
                    timestamp: Utc::now(),
                });

                let content = if result.success {
                    result.output
                } else {
                    format!("Error: {}", result.output)
                };
                let mut transcript = session.transcript.lock().await;
                let _ = transcript.append(Message::tool_result(&call.id, content));
            }
            // ExecutingTools → AwaitingModel: loop resumes with the full
            // updated history.
        }
    }

    /// Open a completion stream, retrying transient failures with
    /// exponential backoff.
    async fn open_stream(
        &self,
        request: CompletionRequest,
        cancel: &CancelToken,
    ) -> Result<mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            match self.provider.stream(request.clone()).await {
                Ok(rx) => return Ok(rx),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.retry_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        attempt,
                        max = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Completion request failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn append_assistant_text(&self, session: &Session, text: &str) {
        if text.is_empty() {
            return;
        }
        let mut transcript = session.transcript.lock().await;
        let _ = transcript.append(Message::assistant(text));
    }

    /// Append cancellation markers for any tool calls that never got a
    /// result, so subsequent turns see consistent history.
    async fn repair_dangling_tool_calls(&self, session: &Session, note: &str) {
        let mut transcript = session.transcript.lock().await;
        let messages = transcript.messages();

        let Some(call_index) = messages
            .iter()
            .rposition(|m| !m.tool_calls.is_empty())
        else {
            return;
        };
        let missing: Vec<String> = messages[call_index]
            .tool_calls
            .iter()
            .map(|tc| tc.id.clone())
            .filter(|id| {
                !messages[call_index + 1..]
                    .iter()
                    .any(|m| m.tool_call_id.as_deref() == Some(id))
            })
            .collect();

        for id in missing {
            debug!(call_id = %id, "Repairing dangling tool call");
            let _ = transcript.append(Message::tool_result(&id, note));
        }
    }

    /// Cancellation exit: flush partial text, repair history, close the
    /// turn as a normal stop (the client asked for it).
    async fn close_cancelled(
        &self,
        session: &Session,
        turn: &mut TurnHandle,
        partial: String,
        rounds_used: u32,
        total_tokens: u32,
    ) -> TurnOutcome {
        info!(session_id = %session.id(), "Turn cancelled");
        self.append_assistant_text(session, &partial).await;
        self.repair_dangling_tool_calls(session, "Tool execution abandoned: turn cancelled")
            .await;
        let _ = turn.close(FinishReason::Stop).await;
        TurnOutcome {
            finish: TurnFinish::Cancelled,
            text: partial,
            tool_rounds: rounds_used,
            total_tokens,
            packets: turn.emitted(),
        }
    }

    fn finish(
        &self,
        _session: &Session,
        turn: &TurnHandle,
        finish: TurnFinish,
        text: String,
        tool_rounds: u32,
        total_tokens: u32,
    ) -> TurnOutcome {
        TurnOutcome {
            finish,
            text,
            tool_rounds,
            total_tokens,
            packets: turn.emitted(),
        }
    }
}
