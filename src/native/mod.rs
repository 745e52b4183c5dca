//! Boundary to the native QUIC engine
//!
//! The engine is an opaque, handle-based library: objects are opened and
//! closed through [`QuicApi`], and asynchronous progress is reported through
//! per-object callbacks carrying a [`Context`] token.

pub mod api;
pub mod event;
pub mod handle;
pub mod recording;
pub mod status;

pub use api::{
    ConnectionShutdownFlags, CredentialConfig, NativeSettings, Param, ParamValue, QuicApi, SendFlags,
    StreamOpenFlags, StreamShutdownFlags, StreamStartFlags,
};
pub use event::{
    Certificate, ConnectionCallback, ConnectionEvent, Context, ListenerCallback, ListenerEvent,
    NewConnectionInfo, RawHandle, StreamCallback, StreamEvent,
};
pub use handle::{HandleKind, NativeHandle, Registration};
pub use recording::RecordingEngine;
pub use status::Status;
