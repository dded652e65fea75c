// Report channel framing.
//
// PREAMBLE \n type \n deviceID \n appID \n sessionID [\n seq] \n payload \n POSTAMBLE
//
// The payload may itself contain newlines; the field count before it is fixed per type.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::SessionIds;
use crate::config::{FRAME_DELIM, FRAME_POSTAMBLE, FRAME_PREAMBLE};
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Battery,
    Resource,
    SystemInfo,
    SessionOpen,
    SessionClose,
    Location,
    AppUid,
    PeriodicStats,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::Battery => 0,
            MessageType::Resource => 1,
            MessageType::SystemInfo => 2,
            MessageType::SessionOpen => 3,
            MessageType::SessionClose => 4,
            MessageType::Location => 8,
            MessageType::AppUid => 11,
            MessageType::PeriodicStats => 12,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => MessageType::Battery,
            1 => MessageType::Resource,
            2 => MessageType::SystemInfo,
            3 => MessageType::SessionOpen,
            4 => MessageType::SessionClose,
            8 => MessageType::Location,
            11 => MessageType::AppUid,
            12 => MessageType::PeriodicStats,
            _ => return None,
        })
    }

    /// Sequenced types carry a sequence number field before the payload.
    pub fn is_sequenced(self) -> bool {
        matches!(self, MessageType::Battery | MessageType::Resource)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_type: MessageType,
    pub device_id: String,
    pub app_id: i32,
    pub session_id: u64,
    pub sequence: Option<u32>,
    pub payload: String,
}

impl Frame {
    pub fn new(message_type: MessageType, ids: &SessionIds, payload: impl Into<String>) -> Self {
        Self {
            message_type,
            device_id: ids.device_id.clone(),
            app_id: ids.app_id,
            session_id: ids.session_id,
            sequence: None,
            payload: payload.into(),
        }
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut fields: Vec<String> = vec![
            FRAME_PREAMBLE.to_string(),
            self.message_type.code().to_string(),
            self.device_id.clone(),
            self.app_id.to_string(),
            self.session_id.to_string(),
        ];
        if self.message_type.is_sequenced() {
            fields.push(self.sequence.unwrap_or(0).to_string());
        }
        fields.push(self.payload.clone());
        fields.push(FRAME_POSTAMBLE.to_string());

        let text = fields.join(&FRAME_DELIM.to_string());
        let mut buf = BytesMut::with_capacity(text.len());
        buf.put_slice(text.as_bytes());
        buf.freeze()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| AgentError::FrameDecode(format!("not utf-8: {}", e)))?;
        let head = format!("{}{}", FRAME_PREAMBLE, FRAME_DELIM);
        let tail = format!("{}{}", FRAME_DELIM, FRAME_POSTAMBLE);
        let body = text
            .strip_prefix(head.as_str())
            .ok_or_else(|| AgentError::FrameDecode("missing preamble".into()))?
            .strip_suffix(tail.as_str())
            .ok_or_else(|| AgentError::FrameDecode("missing postamble".into()))?;

        let (type_field, rest) = body
            .split_once(FRAME_DELIM)
            .ok_or_else(|| AgentError::FrameDecode("truncated header".into()))?;
        let code: u8 = type_field
            .parse()
            .map_err(|_| AgentError::FrameDecode(format!("bad message type {:?}", type_field)))?;
        let message_type = MessageType::from_code(code)
            .ok_or_else(|| AgentError::FrameDecode(format!("unknown message type {}", code)))?;

        // deviceID, appID, sessionID, [seq], payload
        let header_fields = if message_type.is_sequenced() { 4 } else { 3 };
        let parts: Vec<&str> = rest.splitn(header_fields + 1, FRAME_DELIM).collect();
        if parts.len() != header_fields + 1 {
            return Err(AgentError::FrameDecode(format!(
                "expected {} header fields, got {}",
                header_fields,
                parts.len().saturating_sub(1)
            )));
        }

        let number = |name: &str, field: &str| -> Result<u64> {
            field
                .parse()
                .map_err(|_| AgentError::FrameDecode(format!("bad {} {:?}", name, field)))
        };
        let app_id: i32 = parts[1]
            .parse()
            .map_err(|_| AgentError::FrameDecode(format!("bad appID {:?}", parts[1])))?;
        let session_id = number("sessionID", parts[2])?;
        let sequence = if message_type.is_sequenced() {
            let seq: u32 = parts[3]
                .parse()
                .map_err(|_| AgentError::FrameDecode(format!("bad sequence {:?}", parts[3])))?;
            Some(seq)
        } else {
            None
        };

        Ok(Self {
            message_type,
            device_id: parts[0].to_string(),
            app_id,
            session_id,
            sequence,
            payload: parts[header_fields].to_string(),
        })
    }
}

/// Accumulates bytes read off a stream and yields complete frames.
#[derive(Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, if the postamble has arrived.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        let marker = FRAME_POSTAMBLE.as_bytes();
        let end = self
            .buf
            .windows(marker.len())
            .position(|w| w == marker)?
            + marker.len();
        let raw = self.buf.split_to(end);
        Some(Frame::decode(&raw))
    }

    pub fn pending(&self) -> usize {
        self.buf.remaining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> SessionIds {
        SessionIds {
            device_id: "abc123".into(),
            session_id: 1_700_000_000_123,
            app_id: 0,
            platform: 1,
        }
    }

    #[test]
    fn test_unsequenced_layout() {
        let frame = Frame::new(MessageType::SessionOpen, &ids(), "1");
        let encoded = frame.encode();
        assert_eq!(
            &encoded[..],
            b"re08h4089y\n3\nabc123\n0\n1700000000123\n1\ndsf9u0932j"
        );
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn test_sequenced_payload_with_newlines() {
        let frame = Frame::new(MessageType::Resource, &ids(), "1\n2\n3").with_sequence(7);
        let encoded = frame.encode();
        assert!(std::str::from_utf8(&encoded)
            .unwrap()
            .contains("\n1700000000123\n7\n1\n2\n3\n"));
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(decoded.sequence, Some(7));
        assert_eq!(decoded.payload, "1\n2\n3");
    }

    #[test]
    fn test_empty_payload() {
        let frame = Frame::new(MessageType::PeriodicStats, &ids(), "$$");
        assert_eq!(Frame::decode(&frame.encode()).unwrap().payload, "$$");
        let frame = Frame::new(MessageType::AppUid, &ids(), "");
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Frame::decode(b"hello").is_err());
        assert!(Frame::decode(b"re08h4089y\n99\na\n0\n1\nx\ndsf9u0932j").is_err());
        assert!(Frame::decode(b"re08h4089y\n1\na\n0\n1\ndsf9u0932j").is_err());
    }

    #[test]
    fn test_decode_rejects_out_of_range_sequence() {
        let raw = b"re08h4089y\n1\nabc123\n0\n1\n4294967296\npayload\ndsf9u0932j";
        match Frame::decode(raw) {
            Err(AgentError::FrameDecode(msg)) => assert!(msg.contains("sequence")),
            other => panic!("expected a sequence decode error, got {:?}", other),
        }

        let raw = b"re08h4089y\n1\nabc123\n0\n1\n4294967295\npayload\ndsf9u0932j";
        assert_eq!(Frame::decode(raw).unwrap().sequence, Some(u32::MAX));
    }

    #[test]
    fn test_frame_buffer_splits_stream() {
        let a = Frame::new(MessageType::SessionOpen, &ids(), "1");
        let b = Frame::new(MessageType::Battery, &ids(), "50\n100").with_sequence(1);
        let mut stream = a.encode().to_vec();
        stream.extend_from_slice(&b.encode());

        let mut buffer = FrameBuffer::new();
        buffer.extend(&stream[..10]);
        assert!(buffer.next_frame().is_none());
        buffer.extend(&stream[10..]);
        assert_eq!(buffer.next_frame().unwrap().unwrap(), a);
        assert_eq!(buffer.next_frame().unwrap().unwrap(), b);
        assert!(buffer.next_frame().is_none());
        assert_eq!(buffer.pending(), 0);
    }
}
