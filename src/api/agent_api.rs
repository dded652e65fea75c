// Host-facing surface: synchronous calls backed by an owned tokio runtime.

use std::sync::{Arc, Once};
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::AgentConfig;
use crate::engine::{DeviceContext, SessionController, SessionPhase};
use crate::error::Result;
use crate::platform::Platform;
use crate::wire::payload::BatteryStatus;

static INIT_TRACING: Once = Once::new();

/// Install the global tracing subscriber once. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,netpulse_engine=info"));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();

        info!("netpulse tracing initialized");
    });
}

/// The measurement agent as seen by the host application.
///
/// Every call returns normally; failures only reduce what gets reported.
/// Must not be called from inside another tokio runtime.
pub struct Agent {
    runtime: Runtime,
    controller: Arc<SessionController>,
}

impl Agent {
    pub fn new(config: AgentConfig, platform: Platform) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("netpulse")
            .enable_all()
            .build()?;
        info!("agent created server={}", config.server_host);
        Ok(Self {
            runtime,
            controller: SessionController::new(config, platform),
        })
    }

    /// Build from a JSON configuration document.
    pub fn from_json(json: &str, platform: Platform) -> Result<Self> {
        Self::new(AgentConfig::from_json(json)?, platform)
    }

    pub fn start_session(&self, ctx: DeviceContext) {
        let _guard = self.runtime.enter();
        self.controller.start_session(&ctx);
    }

    pub fn end_session(&self) {
        let _guard = self.runtime.enter();
        self.controller.end_session();
    }

    /// Blocks until the end-of-session frame is written and the channels are closed.
    pub fn finish(&self) {
        self.runtime.block_on(self.controller.finish());
    }

    pub fn capture_event(&self, id: i32) {
        self.controller.capture_event(id);
    }

    pub fn capture_event_value(&self, id: i32, value: f64) {
        self.controller.capture_event_value(id, value);
    }

    pub fn capture_event_string(&self, id: i32, value: &str) {
        self.controller.capture_event_string(id, value);
    }

    pub fn download_started(&self) -> Option<u64> {
        self.controller.download_started()
    }

    pub fn download_ended(&self, token: u64) {
        self.controller.download_ended(token);
    }

    pub fn battery_changed(&self, status: BatteryStatus) {
        let _guard = self.runtime.enter();
        self.controller.battery_changed(status);
    }

    pub fn set_server_hostname(&self, host: &str) {
        self.controller.set_server_hostname(host);
    }

    pub fn set_application_char_id(&self, id: &str) {
        self.controller.set_application_char_id(id);
    }

    pub fn set_device_id(&self, id: &str) {
        self.controller.set_device_id(id);
    }

    pub fn phase(&self) -> SessionPhase {
        self.controller.phase()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.controller.session_id()
    }

    pub fn controller(&self) -> Arc<SessionController> {
        self.controller.clone()
    }

    /// Finish any session and stop the runtime.
    pub fn shutdown(self) {
        self.finish();
        self.runtime.shutdown_timeout(Duration::from_secs(1));
        info!("agent shut down");
    }
}
