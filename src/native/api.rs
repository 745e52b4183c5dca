//! Call surface of the native QUIC engine
//!
//! Every call mirrors one engine entry point: handles go in, a [`Status`]
//! comes out. The engine may invoke registered callbacks synchronously from
//! inside any of these calls, so callers must never hold a state lock while
//! calling in.

use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;

use super::event::{Certificate, ConnectionCallback, Context, ListenerCallback, RawHandle, StreamCallback};
use super::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionShutdownFlags {
    /// Tear down without notifying the peer.
    pub silent: bool,
}

impl ConnectionShutdownFlags {
    pub const NONE: Self = Self { silent: false };
    pub const SILENT: Self = Self { silent: true };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamOpenFlags {
    pub unidirectional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStartFlags {
    /// Report START_COMPLETE immediately instead of waiting for peer credit.
    pub immediate: bool,
    /// Fail instead of queueing when no stream credit is available.
    pub fail_blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamShutdownFlags {
    pub graceful: bool,
    pub abort_send: bool,
    pub abort_receive: bool,
    pub immediate: bool,
}

impl StreamShutdownFlags {
    pub const GRACEFUL: Self = Self {
        graceful: true,
        abort_send: false,
        abort_receive: false,
        immediate: false,
    };
    pub const ABORT_SEND: Self = Self {
        graceful: false,
        abort_send: true,
        abort_receive: false,
        immediate: false,
    };
    pub const ABORT_RECEIVE: Self = Self {
        graceful: false,
        abort_send: false,
        abort_receive: true,
        immediate: false,
    };
    pub const ABORT: Self = Self {
        graceful: false,
        abort_send: true,
        abort_receive: true,
        immediate: true,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendFlags {
    /// Set FIN on the last frame of this send.
    pub fin: bool,
}

/// Parameters readable through [`QuicApi::get_param`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    LocalAddress,
    RemoteAddress,
    StreamId,
    LocalBidirectionalStreamCount,
    LocalUnidirectionalStreamCount,
    NegotiatedAlpn,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Address(SocketAddr),
    U64(u64),
    U16(u16),
    Bytes(Vec<u8>),
}

impl ParamValue {
    pub fn as_address(&self) -> Option<SocketAddr> {
        match self {
            ParamValue::Address(address) => Some(*address),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            ParamValue::U64(value) => Some(*value),
            ParamValue::U16(value) => Some(u64::from(*value)),
            _ => None,
        }
    }
}

/// Transport settings applied to a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NativeSettings {
    pub idle_timeout: Option<Duration>,
    pub handshake_idle_timeout: Option<Duration>,
    pub keep_alive_interval: Option<Duration>,
    pub peer_bidirectional_stream_count: u16,
    pub peer_unidirectional_stream_count: u16,
}

/// Credentials handed to the engine for a configuration.
#[derive(Debug, Clone, Default)]
pub struct CredentialConfig {
    pub client: bool,
    pub certificate_chain: Vec<Certificate>,
    pub private_key: Option<Bytes>,
    pub require_client_certificate: bool,
    /// Deliver PEER_CERTIFICATE_RECEIVED and let the application decide.
    pub indicate_certificate_received: bool,
    pub defer_certificate_validation: bool,
}

/// The native engine. Implementations must be callable from any thread.
pub trait QuicApi: Send + Sync + 'static {
    fn registration_open(&self, app_name: &str) -> Result<RawHandle, Status>;
    fn registration_close(&self, registration: RawHandle);

    fn configuration_open(
        &self,
        registration: RawHandle,
        alpn: &[Vec<u8>],
        settings: &NativeSettings,
        credentials: &CredentialConfig,
    ) -> Result<RawHandle, Status>;
    fn configuration_close(&self, configuration: RawHandle);

    fn listener_open(
        &self,
        registration: RawHandle,
        callback: ListenerCallback,
        context: Context,
    ) -> Result<RawHandle, Status>;
    fn listener_start(&self, listener: RawHandle, alpn: &[Vec<u8>], address: SocketAddr) -> Status;
    fn listener_stop(&self, listener: RawHandle);
    fn listener_close(&self, listener: RawHandle);

    fn connection_open(
        &self,
        registration: RawHandle,
        callback: ConnectionCallback,
        context: Context,
    ) -> Result<RawHandle, Status>;
    /// Takes over an engine-created (inbound) connection.
    fn set_connection_callback(&self, connection: RawHandle, callback: ConnectionCallback, context: Context);
    fn connection_set_configuration(&self, connection: RawHandle, configuration: RawHandle) -> Status;
    fn connection_start(
        &self,
        connection: RawHandle,
        configuration: RawHandle,
        server_name: &str,
        port: u16,
    ) -> Status;
    fn connection_shutdown(&self, connection: RawHandle, flags: ConnectionShutdownFlags, error_code: u64);
    fn connection_close(&self, connection: RawHandle);

    fn stream_open(
        &self,
        connection: RawHandle,
        flags: StreamOpenFlags,
        callback: StreamCallback,
        context: Context,
    ) -> Result<RawHandle, Status>;
    /// Takes over an engine-created (peer-initiated) stream.
    fn set_stream_callback(&self, stream: RawHandle, callback: StreamCallback, context: Context);
    fn stream_start(&self, stream: RawHandle, flags: StreamStartFlags) -> Status;
    fn stream_send(&self, stream: RawHandle, buffers: &[Bytes], flags: SendFlags) -> Status;
    fn stream_receive_complete(&self, stream: RawHandle, length: u64);
    fn stream_receive_set_enabled(&self, stream: RawHandle, enabled: bool) -> Status;
    fn stream_shutdown(&self, stream: RawHandle, flags: StreamShutdownFlags, error_code: u64) -> Status;
    fn stream_close(&self, stream: RawHandle);

    fn get_param(&self, handle: RawHandle, param: Param) -> Result<ParamValue, Status>;
}
