//! Frame header encoding and decoding
//!
//! Wire layout: FIN and three reserved bits, 4-bit opcode, mask bit, 7-bit
//! length with 16- or 64-bit extensions, then an optional 4-byte mask key.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{WebSocketError, WebSocketResult};

use super::close::CloseStatus;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: u64 = 125;

/// Longest possible frame header.
pub const MAX_HEADER_LEN: usize = 14;

const FIN: u8 = 0x80;
const RSV1: u8 = 0x40;
const RSV2: u8 = 0x20;
const RSV3: u8 = 0x10;
const MASKED: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xa => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        (self as u8) & 0x8 != 0
    }
}

/// A frame header exactly as it appeared on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub opcode: u8,
    pub mask: Option<[u8; 4]>,
    pub payload_length: u64,
}

/// Number of header bytes implied by the first two bytes of a frame.
pub fn header_len(first_two: [u8; 2]) -> usize {
    let extended = match first_two[1] & 0x7f {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask = if first_two[1] & MASKED != 0 { 4 } else { 0 };
    2 + extended + mask
}

impl FrameHeader {
    /// Decodes a header from the front of `buf`. Returns `None` while more
    /// bytes are needed, otherwise the header and the bytes it occupied.
    pub fn decode(buf: &[u8]) -> WebSocketResult<Option<(Self, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let len = header_len([buf[0], buf[1]]);
        if buf.len() < len {
            return Ok(None);
        }

        let mut cursor = &buf[..len];
        let first = cursor.get_u8();
        let second = cursor.get_u8();
        let payload_length = match second & 0x7f {
            126 => cursor.get_u16() as u64,
            127 => cursor.get_u64(),
            short => short as u64,
        };
        if payload_length > i64::MAX as u64 {
            return Err(WebSocketError::protocol(
                CloseStatus::PROTOCOL_ERROR,
                "payload length has the most significant bit set",
            ));
        }
        let mask = if second & MASKED != 0 {
            let mut key = [0u8; 4];
            cursor.copy_to_slice(&mut key);
            Some(key)
        } else {
            None
        };

        Ok(Some((
            Self {
                fin: first & FIN != 0,
                rsv1: first & RSV1 != 0,
                rsv2: first & RSV2 != 0,
                rsv3: first & RSV3 != 0,
                opcode: first & 0x0f,
                mask,
                payload_length,
            },
            len,
        )))
    }
}

/// Writes a frame header using the shortest length encoding.
pub fn encode(dst: &mut BytesMut, opcode: Opcode, fin: bool, compressed: bool, payload_len: usize, mask: Option<[u8; 4]>) {
    let mut first = opcode as u8;
    if fin {
        first |= FIN;
    }
    if compressed {
        first |= RSV1;
    }
    dst.put_u8(first);

    let mask_bit = if mask.is_some() { MASKED } else { 0 };
    if payload_len < 126 {
        dst.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= u16::MAX as usize {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(payload_len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(payload_len as u64);
    }

    if let Some(key) = mask {
        dst.put_slice(&key);
    }
}

/// A validated header for the frame currently being received.
///
/// Continuation frames carry the opcode and compression flag of the
/// message they continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub opcode: Opcode,
    pub fin: bool,
    /// Payload bytes still unread on the wire.
    pub payload_length: u64,
    pub compressed: bool,
    pub mask: Option<[u8; 4]>,
    /// Set once a compressed payload has been fully handed to the inflater.
    pub processed: bool,
}

/// Opcode and compression of a data message spanning several frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageInProgress {
    pub opcode: Opcode,
    pub compressed: bool,
}

impl MessageHeader {
    /// Applies the framing rules a receiver enforces.
    ///
    /// `expect_masked` is true on the server side. `in_progress` is the data
    /// message a preceding non-final frame started, if any.
    pub fn validate(
        frame: FrameHeader,
        expect_masked: bool,
        deflate_negotiated: bool,
        in_progress: Option<MessageInProgress>,
    ) -> WebSocketResult<Self> {
        let protocol = |message: &str| Err(WebSocketError::protocol(CloseStatus::PROTOCOL_ERROR, message));

        if frame.rsv2 || frame.rsv3 {
            return protocol("reserved bits set");
        }
        let Some(opcode) = Opcode::from_u8(frame.opcode) else {
            return protocol("unknown opcode");
        };
        if frame.mask.is_some() != expect_masked {
            return protocol(if expect_masked {
                "client frame is not masked"
            } else {
                "server frame is masked"
            });
        }

        if opcode.is_control() {
            if !frame.fin {
                return protocol("fragmented control frame");
            }
            if frame.payload_length > MAX_CONTROL_PAYLOAD {
                return protocol("control frame payload too long");
            }
            if frame.rsv1 {
                return protocol("compressed control frame");
            }
            return Ok(Self {
                opcode,
                fin: true,
                payload_length: frame.payload_length,
                compressed: false,
                mask: frame.mask,
                processed: false,
            });
        }

        let (opcode, compressed) = match (opcode, in_progress) {
            (Opcode::Continuation, None) => return protocol("continuation frame without a message"),
            (Opcode::Continuation, Some(message)) => {
                if frame.rsv1 {
                    return protocol("compression flag on a continuation frame");
                }
                (message.opcode, message.compressed)
            }
            (_, Some(_)) => return protocol("new message before the previous one finished"),
            (opcode, None) => {
                if frame.rsv1 && !deflate_negotiated {
                    return protocol("compression flag without negotiated deflate");
                }
                (opcode, frame.rsv1)
            }
        };

        Ok(Self {
            opcode,
            fin: frame.fin,
            payload_length: frame.payload_length,
            compressed,
            mask: frame.mask,
            processed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_encodings() {
        for (len, header_bytes) in [(0usize, 2usize), (125, 2), (126, 4), (65535, 4), (65536, 10)] {
            let mut buf = BytesMut::new();
            encode(&mut buf, Opcode::Binary, true, false, len, None);
            assert_eq!(buf.len(), header_bytes, "len {}", len);

            let (frame, consumed) = FrameHeader::decode(&buf).unwrap().unwrap();
            assert_eq!(consumed, header_bytes);
            assert_eq!(frame.payload_length, len as u64);
            assert!(frame.fin);
            assert_eq!(frame.opcode, Opcode::Binary as u8);
        }
    }

    #[test]
    fn test_partial_header_needs_more() {
        let mut buf = BytesMut::new();
        encode(&mut buf, Opcode::Text, true, false, 300, Some([1, 2, 3, 4]));
        assert_eq!(buf.len(), 8);
        for cut in 0..buf.len() {
            assert!(FrameHeader::decode(&buf[..cut]).unwrap().is_none(), "cut {}", cut);
        }
        let (frame, _) = FrameHeader::decode(&buf).unwrap().unwrap();
        assert_eq!(frame.mask, Some([1, 2, 3, 4]));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let buf = [0x82, 127, 0x80, 0, 0, 0, 0, 0, 0, 1];
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(WebSocketError::Protocol { .. })
        ));
    }

    fn frame(opcode: Opcode, fin: bool) -> FrameHeader {
        FrameHeader {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: opcode as u8,
            mask: None,
            payload_length: 0,
        }
    }

    #[test]
    fn test_fragmentation_rules() {
        let text = MessageInProgress {
            opcode: Opcode::Text,
            compressed: true,
        };
        let continued = MessageHeader::validate(frame(Opcode::Continuation, true), false, true, Some(text)).unwrap();
        assert_eq!(continued.opcode, Opcode::Text);
        assert!(continued.compressed);

        assert!(MessageHeader::validate(frame(Opcode::Continuation, true), false, false, None).is_err());
        assert!(MessageHeader::validate(frame(Opcode::Binary, true), false, false, Some(text)).is_err());
        // Control frames may interleave.
        assert!(MessageHeader::validate(frame(Opcode::Ping, true), false, false, Some(text)).is_ok());
        assert!(MessageHeader::validate(frame(Opcode::Ping, false), false, false, None).is_err());
    }

    #[test]
    fn test_reserved_bits_and_masking() {
        let mut rsv = frame(Opcode::Text, true);
        rsv.rsv2 = true;
        assert!(MessageHeader::validate(rsv, false, true, None).is_err());

        let mut compressed = frame(Opcode::Text, true);
        compressed.rsv1 = true;
        assert!(MessageHeader::validate(compressed, false, false, None).is_err());
        assert!(MessageHeader::validate(compressed, false, true, None).unwrap().compressed);

        assert!(MessageHeader::validate(frame(Opcode::Text, true), true, false, None).is_err());
        let mut masked = frame(Opcode::Text, true);
        masked.mask = Some([0; 4]);
        assert!(MessageHeader::validate(masked, false, false, None).is_err());
        assert!(MessageHeader::validate(masked, true, false, None).is_ok());

        let mut unknown = frame(Opcode::Text, true);
        unknown.opcode = 0x3;
        assert!(MessageHeader::validate(unknown, false, false, None).is_err());
    }
}
