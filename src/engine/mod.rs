// Engine orchestration: session lifecycle, probe and report channels.

pub mod identity;
pub mod location;
pub mod net;
pub mod probe;
pub mod report;
pub mod session;
pub mod tasks;

pub use session::{DeviceContext, SessionController, SessionPhase};
