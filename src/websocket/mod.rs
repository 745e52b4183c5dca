//! WebSocket frame engine
//!
//! Runs the RFC 6455 framing layer, with optional permessage-deflate, over
//! any already upgraded `AsyncRead + AsyncWrite` stream.

pub mod close;
pub mod deflate;
pub mod header;
pub mod mask;
pub mod socket;
pub mod utf8;

pub use close::{CloseStatus, MAX_CLOSE_REASON_BYTES};
pub use deflate::DeflateOptions;
pub use header::{FrameHeader, MessageHeader, Opcode};
pub use mask::apply_mask;
pub use socket::{
    MessageType, ReceiveResult, Role, SendFlags, WebSocket, WebSocketOptions, WebSocketState, DEFAULT_CLOSE_TIMEOUT,
};
pub use utf8::Utf8Validator;
