//! The Scuttle orchestration loop.
//!
//! One turn runs:
//!
//! 1. **Append** the user message to the session's transcript
//! 2. **Compact** history if the token budget is exceeded
//! 3. **Request** a streaming completion (history + scratch digest + tool schemas)
//! 4. **Forward** content deltas to the stream delivery layer as they arrive
//! 5. **If tool calls**: record the intent, announce it, dispatch through the
//!    registry, append results, loop back to step 2
//! 6. **Terminate** on natural stop, the tool-round cap, or an unrecoverable
//!    error — always with exactly one closing packet

pub mod cancel;
pub mod loop_runner;

pub use cancel::{CancelToken, Canceller, cancel_pair};
pub use loop_runner::{AgentLoop, AgentLoopConfig, TurnFinish, TurnOutcome};
