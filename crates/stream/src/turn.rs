//! Turn handles — sequencing and delivery for one response turn.
//!
//! A `TurnHandle` assigns gapless sequence numbers starting at 0 and pushes
//! packets into a bounded channel the transport drains. Closing the handle
//! emits the terminal (or error) packet and invalidates it: any further
//! emit fails with `TurnClosed`. The handle is transport-agnostic — the
//! gateway drains the receiver into an SSE body or WebSocket frames.

use crate::packet::{ErrorDetail, PacketBody, StreamPacket};
use scuttle_core::SessionId;
use scuttle_core::error::StreamError;
use scuttle_core::provider::FinishReason;
use tokio::sync::mpsc;
use tracing::debug;

/// Default packet buffer between the loop and the transport.
const DEFAULT_BUFFER: usize = 64;

/// The producer side of one turn's packet stream.
pub struct TurnHandle {
    session_id: SessionId,
    next_sequence: u64,
    closed: bool,
    tx: mpsc::Sender<StreamPacket>,
}

impl TurnHandle {
    /// Open a turn for a session. Returns the handle and the receiver the
    /// transport should drain.
    pub fn open(session_id: SessionId) -> (Self, mpsc::Receiver<StreamPacket>) {
        Self::open_with_buffer(session_id, DEFAULT_BUFFER)
    }

    pub fn open_with_buffer(
        session_id: SessionId,
        buffer: usize,
    ) -> (Self, mpsc::Receiver<StreamPacket>) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            Self {
                session_id,
                next_sequence: 0,
                closed: false,
                tx,
            },
            rx,
        )
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Packets emitted so far (equals the next sequence number).
    pub fn emitted(&self) -> u64 {
        self.next_sequence
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn send(&mut self, body: PacketBody) -> Result<u64, StreamError> {
        if self.closed {
            return Err(StreamError::TurnClosed);
        }
        let sequence = self.next_sequence;
        let packet = StreamPacket { sequence, body };
        if packet.body.is_closing() {
            self.closed = true;
        }
        self.tx
            .send(packet)
            .await
            .map_err(|_| StreamError::Disconnected)?;
        self.next_sequence = sequence + 1;
        Ok(sequence)
    }

    /// Emit a content delta. Fails with `TurnClosed` after `close`/`fail`.
    pub async fn emit_delta(&mut self, content: impl Into<String>) -> Result<u64, StreamError> {
        self.send(PacketBody::ContentDelta {
            content: content.into(),
        })
        .await
    }

    /// Announce tool calls the model requested.
    pub async fn emit_tool_calls(
        &mut self,
        calls: Vec<crate::packet::AnnouncedToolCall>,
    ) -> Result<u64, StreamError> {
        self.send(PacketBody::ToolCalls { calls }).await
    }

    /// Emit the terminal packet and invalidate the handle.
    pub async fn close(&mut self, finish_reason: FinishReason) -> Result<u64, StreamError> {
        debug!(session_id = %self.session_id, %finish_reason, packets = self.next_sequence + 1, "Closing turn");
        self.send(PacketBody::Terminal { finish_reason }).await
    }

    /// Emit the error marker and invalidate the handle.
    pub async fn fail(&mut self, error: ErrorDetail) -> Result<u64, StreamError> {
        debug!(session_id = %self.session_id, error = %error.message, "Failing turn");
        self.send(PacketBody::Error { error }).await
    }
}
