// Wire formats: report frames, probe packets and the payload records they carry.

pub mod frame;
pub mod packet;
pub mod payload;

/// Identifiers stamped on every frame and probe packet of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIds {
    pub device_id: String,
    pub session_id: u64,
    pub app_id: i32,
    pub platform: u8,
}
