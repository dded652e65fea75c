// Probe packet layout: interval prefix plus the client-state record.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::SessionIds;
use crate::error::{AgentError, Result};
use crate::platform::traits::{InterfaceKind, InterfaceStatus, RadioState};

/// Offset of the client-state record in the first packet of a session and in pings.
pub const HANDSHAKE_OFFSET: usize = 1;

/// Offset of the client-state record in echoed packets.
pub const ECHO_OFFSET: usize = 2;

/// Tri-state interface availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Inactive = 0,
    Unavailable = 1,
    Available = 2,
}

impl Availability {
    fn of(status: Option<&InterfaceStatus>) -> Self {
        match status {
            None => Availability::Inactive,
            Some(s) if s.available => Availability::Available,
            Some(_) => Availability::Unavailable,
        }
    }
}

/// Snapshot of identifiers and radio state embedded in every probe packet.
///
/// Field order is part of the server contract; the `active*` status fields were added
/// last so existing positions stay where the server expects them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientState {
    #[serde(rename = "appID")]
    pub app_id: i32,
    #[serde(rename = "deviceID")]
    pub device_id: String,
    #[serde(rename = "sessionID")]
    pub session_id: u64,
    #[serde(rename = "cellSignal")]
    pub cell_signal: i32,
    #[serde(rename = "wifiRssi")]
    pub wifi_rssi: i32,
    #[serde(rename = "wifiSpeed")]
    pub wifi_speed: i32,
    pub platform: u8,
    #[serde(rename = "wifiAvail")]
    pub wifi_avail: u8,
    #[serde(rename = "wifiCon")]
    pub wifi_connected: u8,
    #[serde(rename = "wifiFO")]
    pub wifi_failover: u8,
    #[serde(rename = "wifiState")]
    pub wifi_state: i32,
    #[serde(rename = "wifiSubtype")]
    pub wifi_subtype: i32,
    #[serde(rename = "cellAvail")]
    pub cell_avail: u8,
    #[serde(rename = "cellConn")]
    pub cell_connected: u8,
    #[serde(rename = "cellFO")]
    pub cell_failover: u8,
    #[serde(rename = "cellState")]
    pub cell_state: i32,
    #[serde(rename = "cellSubtype")]
    pub cell_subtype: i32,
    #[serde(rename = "activeType")]
    pub active_type: i32,
    #[serde(rename = "activeSub")]
    pub active_subtype: i32,
    #[serde(rename = "activeAvail")]
    pub active_avail: u8,
    #[serde(rename = "activeCon")]
    pub active_connected: u8,
    #[serde(rename = "activeFO")]
    pub active_failover: u8,
    #[serde(rename = "activeState")]
    pub active_state: i32,
}

/// `(avail, connected, failover, state, subtype)` as the server encodes them.
fn interface_fields(status: Option<&InterfaceStatus>) -> (u8, u8, u8, i32, i32) {
    let avail = Availability::of(status) as u8;
    match status {
        Some(s) => (
            avail,
            s.connected as u8,
            s.failover as u8,
            s.state,
            s.subtype,
        ),
        None => (avail, 0, 0, 0, 0),
    }
}

impl ClientState {
    /// Sample the radio state now.
    pub fn capture(ids: &SessionIds, radio: &dyn RadioState) -> Self {
        let link = radio.wifi_link();
        let (wifi_rssi, wifi_speed) = if link.enabled {
            (link.rssi, link.link_speed)
        } else {
            (0, 0)
        };

        let wifi = radio.interface(InterfaceKind::Wifi);
        let cell = radio.interface(InterfaceKind::Cellular);
        let active = radio.active_interface();

        let (wifi_avail, wifi_connected, wifi_failover, wifi_state, wifi_subtype) =
            interface_fields(wifi.as_ref());
        let (cell_avail, cell_connected, cell_failover, cell_state, cell_subtype) =
            interface_fields(cell.as_ref());
        let (active_avail, active_connected, active_failover, active_state, active_subtype) =
            interface_fields(active.as_ref().map(|(_, s)| s));
        let active_type = active.map(|(kind, _)| kind.active_type_code()).unwrap_or(0);

        Self {
            app_id: ids.app_id,
            device_id: ids.device_id.clone(),
            session_id: ids.session_id,
            cell_signal: radio.cell_signal(),
            wifi_rssi,
            wifi_speed,
            platform: ids.platform,
            wifi_avail,
            wifi_connected,
            wifi_failover,
            wifi_state,
            wifi_subtype,
            cell_avail,
            cell_connected,
            cell_failover,
            cell_state,
            cell_subtype,
            active_type,
            active_subtype,
            active_avail,
            active_connected,
            active_failover,
            active_state,
        }
    }

    /// Serialize into `buf` starting at `offset` and zero the rest. Returns the end index.
    pub fn write_into(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let encoded = serde_json::to_vec(self)?;
        let end = offset + encoded.len();
        if end > buf.len() {
            return Err(AgentError::PacketOverflow {
                needed: end,
                capacity: buf.len(),
            });
        }
        buf[offset..end].copy_from_slice(&encoded);
        buf[end..].fill(0);
        Ok(end)
    }

    /// Parse the record written at `offset`, stopping at the first zero byte.
    pub fn read_from(buf: &[u8], offset: usize) -> Result<Self> {
        let tail = buf.get(offset..).unwrap_or_default();
        let len = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        Ok(serde_json::from_slice(&tail[..len])?)
    }
}

/// A fresh probe buffer with the client-state record at `offset`.
pub fn build_packet(state: &ClientState, size: usize, offset: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    state.write_into(&mut buf, offset)?;
    Ok(buf)
}

/// An echo of `received`: its two leading bytes followed by the record at [`ECHO_OFFSET`].
pub fn build_echo(state: &ClientState, received: &[u8], size: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    for (dst, src) in buf.iter_mut().zip(received.iter()).take(ECHO_OFFSET) {
        *dst = *src;
    }
    state.write_into(&mut buf, ECHO_OFFSET)?;
    Ok(buf)
}

/// The ping interval announced in the first TCP response: big-endian seconds in bytes 0..2.
pub fn interval_from_response(buf: &[u8]) -> Option<Duration> {
    let secs = u16::from_be_bytes([*buf.first()?, *buf.get(1)?]);
    Some(Duration::from_millis(u64::from(secs) * 1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::traits::WifiLink;

    struct Radio;

    impl RadioState for Radio {
        fn cell_signal(&self) -> i32 {
            -87
        }

        fn wifi_link(&self) -> WifiLink {
            WifiLink {
                enabled: true,
                rssi: -55,
                link_speed: 54,
            }
        }

        fn interface(&self, kind: InterfaceKind) -> Option<InterfaceStatus> {
            match kind {
                InterfaceKind::Wifi => Some(InterfaceStatus {
                    available: true,
                    connected: true,
                    failover: false,
                    state: 1,
                    subtype: 0,
                }),
                InterfaceKind::Cellular => Some(InterfaceStatus {
                    available: false,
                    ..InterfaceStatus::default()
                }),
                InterfaceKind::Other => None,
            }
        }

        fn active_interface(&self) -> Option<(InterfaceKind, InterfaceStatus)> {
            self.interface(InterfaceKind::Wifi)
                .map(|s| (InterfaceKind::Wifi, s))
        }
    }

    fn ids() -> SessionIds {
        SessionIds {
            device_id: "d".into(),
            session_id: 42,
            app_id: 0,
            platform: 1,
        }
    }

    #[test]
    fn test_capture_encodes_interfaces() {
        let state = ClientState::capture(&ids(), &Radio);
        assert_eq!(state.wifi_avail, Availability::Available as u8);
        assert_eq!(state.cell_avail, Availability::Unavailable as u8);
        assert_eq!(state.active_type, 2);
        assert_eq!(state.wifi_rssi, -55);
        assert_eq!(state.cell_signal, -87);
    }

    #[test]
    fn test_field_order() {
        let state = ClientState::capture(&ids(), &Radio);
        let json = String::from_utf8(serde_json::to_vec(&state).unwrap()).unwrap();
        assert!(json.starts_with(r#"{"appID":0,"deviceID":"d","sessionID":42,"cellSignal":-87,"#));
        let active_type = json.find("activeType").unwrap();
        let active_avail = json.find("activeAvail").unwrap();
        assert!(json.find("cellSubtype").unwrap() < active_type);
        assert!(active_type < active_avail);
    }

    #[test]
    fn test_packet_offsets() {
        let state = ClientState::capture(&ids(), &Radio);
        let first = build_packet(&state, 512, HANDSHAKE_OFFSET).unwrap();
        assert_eq!(first.len(), 512);
        assert_eq!(first[0], 0);
        assert_eq!(first[1], b'{');
        assert_eq!(*first.last().unwrap(), 0);
        assert_eq!(ClientState::read_from(&first, HANDSHAKE_OFFSET).unwrap(), state);

        let echo = build_echo(&state, &[7, 9, 1, 1, 1], 512).unwrap();
        assert_eq!(&echo[..3], &[7, 9, b'{']);
        assert_eq!(ClientState::read_from(&echo, ECHO_OFFSET).unwrap(), state);
    }

    #[test]
    fn test_overflow_is_reported() {
        let state = ClientState::capture(&ids(), &Radio);
        match build_packet(&state, 16, HANDSHAKE_OFFSET) {
            Err(AgentError::PacketOverflow { capacity, .. }) => assert_eq!(capacity, 16),
            other => panic!("expected overflow, got {:?}", other),
        }
    }

    #[test]
    fn test_interval_from_response() {
        assert_eq!(interval_from_response(&[0, 2, 9]), Some(Duration::from_secs(2)));
        assert_eq!(interval_from_response(&[1, 0]), Some(Duration::from_secs(256)));
        assert_eq!(interval_from_response(&[5]), None);
    }
}
