//! Tunnel agent
//!
//! Dials the control endpoint, authenticates, negotiates the session key and then
//! forwards every channel the server opens to a local service.

pub mod agent;
pub mod config;

pub use agent::{AgentError, ConnectedAgent, TunnelAgent};
pub use config::AgentConfig;
