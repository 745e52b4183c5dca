//! Event records raised by the native engine
//!
//! Events are delivered through the callback registered with each object and
//! are passed by mutable reference: a few carry out-parameters the handler
//! fills in (bytes consumed by a receive, for instance).

use bytes::Bytes;
use std::net::SocketAddr;

use super::Status;

/// Raw engine handle value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl std::fmt::Display for RawHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Opaque token handed to the engine with each callback registration and
/// given back verbatim on every event.
pub type Context = u64;

/// DER-encoded X.509 certificate as delivered by the engine.
#[derive(Clone, PartialEq, Eq)]
pub struct Certificate(pub Bytes);

impl Certificate {
    pub fn der(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = &self.0[..self.0.len().min(8)];
        write!(f, "Certificate({} bytes, {}..)", self.0.len(), hex::encode(prefix))
    }
}

#[derive(Debug)]
pub enum ConnectionEvent {
    Connected {
        session_resumed: bool,
        negotiated_alpn: Vec<u8>,
    },
    ShutdownInitiatedByTransport {
        status: Status,
        error_code: u64,
    },
    ShutdownInitiatedByPeer {
        error_code: u64,
    },
    ShutdownComplete {
        handshake_completed: bool,
        peer_acknowledged_shutdown: bool,
        app_close_in_progress: bool,
    },
    LocalAddressChanged {
        address: SocketAddr,
    },
    PeerAddressChanged {
        address: SocketAddr,
    },
    PeerStreamStarted {
        stream: RawHandle,
        unidirectional: bool,
    },
    StreamsAvailable {
        bidirectional_count: u16,
        unidirectional_count: u16,
    },
    PeerNeedsStreams {
        bidirectional: bool,
    },
    IdealProcessorChanged {
        processor: u16,
    },
    DatagramStateChanged {
        send_enabled: bool,
        max_send_length: u16,
    },
    ResumptionTicketReceived {
        ticket: Bytes,
    },
    PeerCertificateReceived {
        certificate: Option<Certificate>,
        chain: Vec<Certificate>,
        /// Validation errors the engine already found, when it was asked to
        /// defer them to the application.
        deferred_status: Status,
    },
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected { .. } => "CONNECTED",
            ConnectionEvent::ShutdownInitiatedByTransport { .. } => "SHUTDOWN_INITIATED_BY_TRANSPORT",
            ConnectionEvent::ShutdownInitiatedByPeer { .. } => "SHUTDOWN_INITIATED_BY_PEER",
            ConnectionEvent::ShutdownComplete { .. } => "SHUTDOWN_COMPLETE",
            ConnectionEvent::LocalAddressChanged { .. } => "LOCAL_ADDRESS_CHANGED",
            ConnectionEvent::PeerAddressChanged { .. } => "PEER_ADDRESS_CHANGED",
            ConnectionEvent::PeerStreamStarted { .. } => "PEER_STREAM_STARTED",
            ConnectionEvent::StreamsAvailable { .. } => "STREAMS_AVAILABLE",
            ConnectionEvent::PeerNeedsStreams { .. } => "PEER_NEEDS_STREAMS",
            ConnectionEvent::IdealProcessorChanged { .. } => "IDEAL_PROCESSOR_CHANGED",
            ConnectionEvent::DatagramStateChanged { .. } => "DATAGRAM_STATE_CHANGED",
            ConnectionEvent::ResumptionTicketReceived { .. } => "RESUMPTION_TICKET_RECEIVED",
            ConnectionEvent::PeerCertificateReceived { .. } => "PEER_CERTIFICATE_RECEIVED",
        }
    }
}

#[derive(Debug)]
pub enum StreamEvent {
    StartComplete {
        status: Status,
        id: u64,
        peer_accepted: bool,
    },
    /// Data is available. Buffers stay owned by the engine until the
    /// handler reports them consumed (`consumed`) or, after returning
    /// [`Status::Pending`], until `stream_receive_complete` is called.
    Receive {
        absolute_offset: u64,
        buffers: Vec<Bytes>,
        fin: bool,
        consumed: u64,
    },
    SendComplete {
        canceled: bool,
    },
    PeerSendShutdown,
    PeerSendAborted {
        error_code: u64,
    },
    PeerReceiveAborted {
        error_code: u64,
    },
    SendShutdownComplete {
        graceful: bool,
    },
    ShutdownComplete {
        connection_shutdown: bool,
        app_close_in_progress: bool,
    },
    IdealSendBufferSize {
        byte_count: u64,
    },
    PeerAccepted,
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::StartComplete { .. } => "START_COMPLETE",
            StreamEvent::Receive { .. } => "RECEIVE",
            StreamEvent::SendComplete { .. } => "SEND_COMPLETE",
            StreamEvent::PeerSendShutdown => "PEER_SEND_SHUTDOWN",
            StreamEvent::PeerSendAborted { .. } => "PEER_SEND_ABORTED",
            StreamEvent::PeerReceiveAborted { .. } => "PEER_RECEIVE_ABORTED",
            StreamEvent::SendShutdownComplete { .. } => "SEND_SHUTDOWN_COMPLETE",
            StreamEvent::ShutdownComplete { .. } => "SHUTDOWN_COMPLETE",
            StreamEvent::IdealSendBufferSize { .. } => "IDEAL_SEND_BUFFER_SIZE",
            StreamEvent::PeerAccepted => "PEER_ACCEPTED",
        }
    }
}

/// Handshake information the engine collected from the client hello.
#[derive(Debug, Clone)]
pub struct NewConnectionInfo {
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    /// SNI, empty when the client sent none.
    pub server_name: String,
    pub client_alpn_list: Vec<Vec<u8>>,
}

#[derive(Debug)]
pub enum ListenerEvent {
    NewConnection {
        info: NewConnectionInfo,
        connection: RawHandle,
    },
    StopComplete {
        app_close_in_progress: bool,
    },
}

impl ListenerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ListenerEvent::NewConnection { .. } => "NEW_CONNECTION",
            ListenerEvent::StopComplete { .. } => "STOP_COMPLETE",
        }
    }
}

pub type ConnectionCallback = fn(RawHandle, Context, &mut ConnectionEvent) -> Status;
pub type StreamCallback = fn(RawHandle, Context, &mut StreamEvent) -> Status;
pub type ListenerCallback = fn(RawHandle, Context, &mut ListenerEvent) -> Status;
