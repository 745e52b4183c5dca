// Boundary to the native QUIC engine, plus a recording engine for tests
pub mod native;

// Connection, stream and listener lifecycle over the native engine
pub mod quic;

// WebSocket frame engine
pub mod websocket;

// Configuration and logging
pub mod config;
pub mod error;
pub mod telemetry;

pub use error::{QuicError, Result, WebSocketError, WebSocketResult};
pub use quic::{Connection, Listener, Stream};
pub use websocket::WebSocket;

pub mod prelude {
    pub use crate::config::GsockConfig;
    pub use crate::error::{QuicError, WebSocketError};
    pub use crate::native::{QuicApi, RecordingEngine, Registration, Status};
    pub use crate::quic::{
        ClientConnectionOptions, Connection, ConnectionPhase, Listener, ListenerOptions, RemoteEndpoint,
        ServerConnectionOptions, ServerOptionsSource, Stream, StreamDirection, StreamKind,
    };
    pub use crate::websocket::{
        CloseStatus, DeflateOptions, MessageType, ReceiveResult, Role, SendFlags, WebSocket, WebSocketOptions,
        WebSocketState,
    };
    pub use tokio_util::sync::CancellationToken;
}
