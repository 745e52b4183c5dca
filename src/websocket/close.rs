//! Close status codes and Close frame payloads

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::error::{WebSocketError, WebSocketResult};

/// Longest close reason that fits a control frame next to the status code.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// A WebSocket close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CloseStatus(pub u16);

impl CloseStatus {
    pub const NORMAL_CLOSURE: Self = Self(1000);
    pub const ENDPOINT_UNAVAILABLE: Self = Self(1001);
    pub const PROTOCOL_ERROR: Self = Self(1002);
    pub const INVALID_MESSAGE_TYPE: Self = Self(1003);
    /// No status was present in the Close frame. Never sent on the wire.
    pub const EMPTY: Self = Self(1005);
    pub const INVALID_PAYLOAD_DATA: Self = Self(1007);
    pub const POLICY_VIOLATION: Self = Self(1008);
    pub const MESSAGE_TOO_BIG: Self = Self(1009);
    pub const MANDATORY_EXTENSION: Self = Self(1010);
    pub const INTERNAL_SERVER_ERROR: Self = Self(1011);

    pub fn code(self) -> u16 {
        self.0
    }

    /// Whether the code may appear in a Close frame.
    pub fn is_valid_on_wire(self) -> bool {
        matches!(self.0, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            1000 => "normal closure",
            1001 => "endpoint unavailable",
            1002 => "protocol error",
            1003 => "invalid message type",
            1005 => "empty",
            1007 => "invalid payload data",
            1008 => "policy violation",
            1009 => "message too big",
            1010 => "mandatory extension",
            1011 => "internal server error",
            _ => return None,
        })
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} {}", self.0, name),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<u16> for CloseStatus {
    fn from(code: u16) -> Self {
        Self(code)
    }
}

/// Builds a Close frame payload, rejecting codes and reasons the peer
/// would have to treat as a protocol error.
pub fn encode_close_payload(status: CloseStatus, reason: &str) -> WebSocketResult<Bytes> {
    if !status.is_valid_on_wire() {
        return Err(WebSocketError::InvalidOperation(format!(
            "close status {} cannot be sent",
            status.0
        )));
    }
    if reason.len() > MAX_CLOSE_REASON_BYTES {
        return Err(WebSocketError::InvalidOperation(format!(
            "close reason is {} bytes, at most {} allowed",
            reason.len(),
            MAX_CLOSE_REASON_BYTES
        )));
    }
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(status.0);
    payload.put_slice(reason.as_bytes());
    Ok(payload.freeze())
}

/// Parses a received Close frame payload.
pub fn parse_close_payload(payload: &[u8]) -> WebSocketResult<(CloseStatus, String)> {
    match payload.len() {
        0 => Ok((CloseStatus::EMPTY, String::new())),
        1 => Err(WebSocketError::protocol(
            CloseStatus::PROTOCOL_ERROR,
            "close frame payload of one byte",
        )),
        _ => {
            let status = CloseStatus(u16::from_be_bytes([payload[0], payload[1]]));
            if !status.is_valid_on_wire() {
                return Err(WebSocketError::protocol(
                    CloseStatus::PROTOCOL_ERROR,
                    format!("invalid close status {}", status.0),
                ));
            }
            let reason = std::str::from_utf8(&payload[2..]).map_err(|_| {
                WebSocketError::protocol(CloseStatus::INVALID_PAYLOAD_DATA, "close reason is not valid UTF-8")
            })?;
            Ok((status, reason.to_string()))
        }
    }
}
