//! The stream packet wire protocol.
//!
//! Every turn is delivered as a gapless, 0-based sequence of packets.
//! On the wire a packet is `{"sequence": n, "payload": ...}` with payload
//! variants:
//!
//! - content delta: `{"delta":{"content":"..."},"finish_reason":null}`
//! - tool-call announcement: `{"delta":{"tool_calls":[...]},"finish_reason":null}`
//! - terminal: `{"finish_reason":"stop"|"length"|"tool_calls"}`
//!
//! The error marker is the exception: it is emitted as the unwrapped object
//! `{"error":{"message","type","param","code"}}` with no sequence field,
//! signaling a transport-level failure distinct from a normal conclusion.
//! Clients must treat any terminal or error frame as turn-closing.

use scuttle_core::provider::FinishReason;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// A tool call surfaced to the client when the model requests execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncedToolCall {
    pub id: String,
    pub name: String,
    /// Structured argument payload (already parsed from the model's JSON)
    pub arguments: serde_json::Value,
}

/// The error body of an error marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub param: Option<String>,
    pub code: Option<String>,
}

impl ErrorDetail {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            param: None,
            code: None,
        }
    }
}

/// What a packet carries.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    /// A fragment of model-generated text
    ContentDelta { content: String },

    /// The model requested tool execution
    ToolCalls { calls: Vec<AnnouncedToolCall> },

    /// Normal end of the turn
    Terminal { finish_reason: FinishReason },

    /// The turn failed; no further packets follow
    Error { error: ErrorDetail },
}

impl PacketBody {
    /// Terminal and error bodies close the turn.
    pub fn is_closing(&self) -> bool {
        matches!(self, Self::Terminal { .. } | Self::Error { .. })
    }
}

/// One sequenced frame of a turn.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPacket {
    /// 0-based, gapless, strictly increasing within a turn
    pub sequence: u64,
    pub body: PacketBody,
}

impl StreamPacket {
    /// Encode for the transport.
    ///
    /// Error markers deliberately lose their sequence wrapper here — the
    /// internal sequence still counts them so the gapless invariant holds
    /// for everything a client is asked to reorder.
    pub fn to_wire(&self) -> serde_json::Value {
        match &self.body {
            PacketBody::ContentDelta { content } => json!({
                "sequence": self.sequence,
                "payload": { "delta": { "content": content }, "finish_reason": null },
            }),
            PacketBody::ToolCalls { calls } => json!({
                "sequence": self.sequence,
                "payload": { "delta": { "tool_calls": calls }, "finish_reason": null },
            }),
            PacketBody::Terminal { finish_reason } => json!({
                "sequence": self.sequence,
                "payload": { "finish_reason": finish_reason },
            }),
            PacketBody::Error { error } => json!({ "error": error }),
        }
    }

    /// One SSE frame (`data: {...}\n\n`).
    pub fn sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_wire())
    }
}

/// The SSE end-of-stream sentinel, sent after the closing packet.
pub const SSE_DONE_FRAME: &str = "data: [DONE]\n\n";

/// A decoded incoming frame — either a sequenced packet or the unwrapped
/// error object.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Packet(StreamPacket),
    Error(ErrorDetail),
}

impl WireFrame {
    /// Decode a wire JSON object back into a frame. Returns `None` for
    /// frames that don't match the protocol.
    pub fn from_wire(value: &serde_json::Value) -> Option<Self> {
        if let Some(error) = value.get("error") {
            let detail: ErrorDetail = serde_json::from_value(error.clone()).ok()?;
            return Some(Self::Error(detail));
        }

        let sequence = value.get("sequence")?.as_u64()?;
        let payload = value.get("payload")?;

        if let Some(delta) = payload.get("delta") {
            if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                return Some(Self::Packet(StreamPacket {
                    sequence,
                    body: PacketBody::ContentDelta {
                        content: content.to_string(),
                    },
                }));
            }
            if let Some(calls) = delta.get("tool_calls") {
                let calls: Vec<AnnouncedToolCall> =
                    serde_json::from_value(calls.clone()).ok()?;
                return Some(Self::Packet(StreamPacket {
                    sequence,
                    body: PacketBody::ToolCalls { calls },
                }));
            }
            return None;
        }

        let finish_reason: FinishReason =
            serde_json::from_value(payload.get("finish_reason")?.clone()).ok()?;
        Some(Self::Packet(StreamPacket {
            sequence,
            body: PacketBody::Terminal { finish_reason },
        }))
    }
}
