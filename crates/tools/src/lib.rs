//! Built-in tool implementations for Scuttle.
//!
//! The standard set gives the agent its working memory: store, fetch, and
//! search over the session scratch pad, plus a clock. Domain tools (CAD
//! generation, file access, and the like) are external capabilities
//! registered by the embedding application.

pub mod clock;
pub mod scratch;

pub use clock::CurrentTimeTool;
pub use scratch::{ScratchGetTool, ScratchSearchTool, ScratchStoreTool};

use scuttle_core::tool::ToolRegistry;
use std::time::Duration;

/// Create the default tool registry with all built-in tools.
pub fn default_registry(execution_timeout: Duration) -> ToolRegistry {
    let mut registry = ToolRegistry::new().with_execution_timeout(execution_timeout);
    // Built-in names are distinct; a collision here is a programming error.
    registry
        .register(Box::new(ScratchStoreTool))
        .expect("register scratch_store");
    registry
        .register(Box::new(ScratchGetTool))
        .expect("register scratch_get");
    registry
        .register(Box::new(ScratchSearchTool))
        .expect("register scratch_search");
    registry
        .register(Box::new(CurrentTimeTool))
        .expect("register current_time");
    registry
}
