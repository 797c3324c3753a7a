//! Shared application state for the gateway.

use scuttle_agent::AgentLoop;
use scuttle_config::AppConfig;
use scuttle_core::event::EventBus;
use scuttle_session::SessionStore;
use std::sync::Arc;

pub struct GatewayState {
    pub config: AppConfig,
    pub agent: Arc<AgentLoop>,
    pub sessions: Arc<SessionStore>,
    pub event_bus: Arc<EventBus>,
}

pub type SharedState = Arc<GatewayState>;
