//! Device-side network measurement agent.
//!
//! Keeps UDP/TCP probe channels to a measurement server, reports telemetry frames over a
//! second TCP connection and aggregates host events between reporting cycles.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod platform;
pub mod stats;
pub mod wire;

pub use api::agent_api::{init_tracing, Agent};
pub use config::AgentConfig;
pub use engine::{DeviceContext, SessionController, SessionPhase};
pub use error::{AgentError, Result};
pub use platform::Platform;
