use std::time::Duration;

use serde::Deserialize;

use crate::error::{AgentError, Result};

/// Measurement server port for the UDP/TCP probe channel.
pub const PROBE_PORT: u16 = 11200;

/// Measurement server port for the framed report channel.
pub const REPORT_PORT: u16 = 11210;

/// Fixed size of every probe packet buffer.
pub const PACKET_SIZE: usize = 512;

/// Size of the buffer used to read the server configuration frame.
pub const CONFIG_READ_BUFFER: usize = 100;

/// Sentinel opening every report frame.
pub const FRAME_PREAMBLE: &str = "re08h4089y";

/// Sentinel closing every report frame.
pub const FRAME_POSTAMBLE: &str = "dsf9u0932j";

/// Field separator inside a report frame.
pub const FRAME_DELIM: char = '\n';

/// Separator between fields of one aggregated tuple.
pub const FIELD_DELIM: char = '#';

/// Separator between aggregated tuples.
pub const TUPLE_DELIM: char = '@';

/// Separator between the sections of a stats payload.
pub const SECTION_DELIM: char = '$';

/// Download tokens are drawn from `0..DOWNLOAD_TOKEN_RANGE`.
pub const DOWNLOAD_TOKEN_RANGE: u64 = 10_000;

/// Value events logged when a session's byte counters are allocated.
pub mod local_events {
    pub const START_TX_TOTAL_BYTES: i32 = 9901;
    pub const START_TX_APP_BYTES: i32 = 9902;
    pub const START_TX_MOBILE_BYTES: i32 = 9903;
    pub const START_RX_TOTAL_BYTES: i32 = 9904;
    pub const START_RX_APP_BYTES: i32 = 9905;
    pub const START_RX_MOBILE_BYTES: i32 = 9906;
    pub const UPTIME: i32 = 9907;
    pub const ELAPSED_REALTIME: i32 = 9908;
}

/// Runtime configuration for the measurement agent.
///
/// Every duration is expressed in milliseconds so the struct can be fed straight
/// from a JSON document; missing keys keep their defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hostname or address of the measurement server.
    pub server_host: String,
    pub probe_port: u16,
    pub report_port: u16,
    /// Bound on TCP connection establishment.
    pub connect_timeout_ms: u64,
    /// Delay before the first tick of the ping timer.
    pub ping_start_delay_ms: u64,
    /// Ping interval used until the server renegotiates it. 0 disables the timer.
    pub default_ping_interval_ms: u64,
    pub packet_size: usize,
    /// Resource sampling interval used when the server config frame is unusable.
    pub resource_interval_ms: u64,
    /// Settle delay used around the report channel handshake and sampler start.
    pub init_delay_ms: u64,
    pub location_initial_delay_ms: u64,
    pub location_interval_ms: u64,
    /// Interval of the periodic (type 12) stats frame.
    pub stats_interval_ms: u64,
    /// Hysteresis window between the last `end_session` and `finish`.
    pub session_end_wait_ms: u64,
    /// Round reported coordinates to one decimal place.
    pub hide_precise_location: bool,
    pub application_id: i32,
    pub platform_tag: u8,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            probe_port: PROBE_PORT,
            report_port: REPORT_PORT,
            connect_timeout_ms: 15_000,
            ping_start_delay_ms: 1_000,
            default_ping_interval_ms: 0,
            packet_size: PACKET_SIZE,
            resource_interval_ms: 40_000,
            init_delay_ms: 5_000,
            location_initial_delay_ms: 30_000,
            location_interval_ms: 360_000,
            stats_interval_ms: 300_000,
            session_end_wait_ms: 10_000,
            hide_precise_location: true,
            application_id: 0,
            platform_tag: 1,
        }
    }
}

impl AgentConfig {
    /// Parse a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| AgentError::ConfigParse(e.to_string()))?;
        if config.packet_size < 2 {
            return Err(AgentError::ConfigParse(format!(
                "packet_size {} leaves no room for the interval field",
                config.packet_size
            )));
        }
        Ok(config)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_start_delay(&self) -> Duration {
        Duration::from_millis(self.ping_start_delay_ms)
    }

    pub fn default_ping_interval(&self) -> Duration {
        Duration::from_millis(self.default_ping_interval_ms)
    }

    pub fn resource_interval(&self) -> Duration {
        Duration::from_millis(self.resource_interval_ms)
    }

    pub fn init_delay(&self) -> Duration {
        Duration::from_millis(self.init_delay_ms)
    }

    pub fn location_initial_delay(&self) -> Duration {
        Duration::from_millis(self.location_initial_delay_ms)
    }

    pub fn location_interval(&self) -> Duration {
        Duration::from_millis(self.location_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn session_end_wait(&self) -> Duration {
        Duration::from_millis(self.session_end_wait_ms)
    }
}
