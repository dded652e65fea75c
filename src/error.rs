// Error kinds surfaced at the engine's own boundaries.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("cannot resolve host {host}")]
    Resolve { host: String },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream (zero-length read).
    #[error("channel closed by peer")]
    ChannelClosed,

    /// A report frame could not be written within the bound; the channel is stopped.
    #[error("report send timed out after {0:?}")]
    SendTimeout(std::time::Duration),

    /// The report channel already failed once and rejects further sends.
    #[error("report channel is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    ConfigParse(String),

    #[error("malformed frame: {0}")]
    FrameDecode(String),

    #[error("client state needs {needed} bytes, packet holds {capacity}")]
    PacketOverflow { needed: usize, capacity: usize },

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl AgentError {
    /// Socket-level faults: the channel is marked dead and the next session start recovers.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Resolve { .. }
                | AgentError::Connect { .. }
                | AgentError::ConnectTimeout { .. }
                | AgentError::Io(_)
                | AgentError::ChannelClosed
                | AgentError::SendTimeout(_)
        )
    }
}
