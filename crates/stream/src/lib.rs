//! Stream delivery layer for Scuttle.
//!
//! Wraps orchestration output into ordered, sequence-numbered packets for
//! transport-agnostic delivery. The same packet sequence is producible over
//! an SSE chunked response or a bidirectional WebSocket; sequence numbers
//! let a client behind an unordered relay reorder.

pub mod packet;
pub mod reorder;
pub mod turn;

pub use packet::{
    AnnouncedToolCall, ErrorDetail, PacketBody, SSE_DONE_FRAME, StreamPacket, WireFrame,
};
pub use reorder::PacketReorderer;
pub use turn::TurnHandle;
