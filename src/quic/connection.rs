//! QUIC connection lifecycle
//!
//! A [`Connection`] is the application's handle; [`ConnectionState`] is the
//! record shared with the engine callbacks through the registry. The native
//! connection handle is owned by the state and released exactly once: at
//! dispose when no stream is alive, otherwise by the last stream's cleanup.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{QuicError, Result};
use crate::native::{
    Certificate, ConnectionEvent, ConnectionShutdownFlags, Context, HandleKind, NativeHandle, NewConnectionInfo,
    Param, QuicApi, RawHandle, Registration, Status,
};

use super::certificate::{self, CertificateContext, CertificateValidation};
use super::completion::{complete, completion, receive, with_cancellation, Completer, OnceSignal};
use super::dispatch::connection_callback;
use super::options::{ClientConnectionOptions, ConnectionDefaults, ServerConnectionOptions};
use super::registry::CONNECTIONS;
use super::stream::{Stream, StreamDirection, StreamKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionPhase {
    Idle,
    Connecting,
    Connected,
    ShutdownInitiated,
    ShutdownComplete,
}

/// Runs once when the handshake resolves. Inbound connections use it to
/// reach their listener without the listener being kept alive by the
/// callback side.
pub(crate) type HandshakeHook = Box<dyn FnOnce(Result<()>) + Send>;

struct ConnectionInner {
    phase: ConnectionPhase,
    connected: Option<Completer<()>>,
    handshake_hook: Option<HandshakeHook>,
    accept_tx: Option<mpsc::UnboundedSender<Stream>>,
    stream_count: usize,
    closing: bool,
    peer_error_code: Option<u64>,
    transport_error: Option<QuicError>,
    local_endpoint: Option<SocketAddr>,
    remote_endpoint: Option<SocketAddr>,
    target_host: Option<String>,
    negotiated_alpn: Option<Vec<u8>>,
    remote_certificate: Option<Certificate>,
    validation: CertificateValidation,
    certificate_required: bool,
    validation_result: Option<bool>,
    defaults: ConnectionDefaults,
    configuration: Option<Arc<NativeHandle>>,
    bidirectional_waiters: Vec<Completer<()>>,
    unidirectional_waiters: Vec<Completer<()>>,
}

pub(crate) struct ConnectionState {
    handle: NativeHandle,
    context: Context,
    trace_id: String,
    is_server: bool,
    inner: Mutex<ConnectionInner>,
    shutdown: OnceSignal<()>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
    // Keeps the registration open for as long as the connection handle is.
    registration: Registration,
}

struct StateInit {
    raw: RawHandle,
    context: Context,
    is_server: bool,
    target_host: Option<String>,
    local_endpoint: Option<SocketAddr>,
    remote_endpoint: Option<SocketAddr>,
    validation: CertificateValidation,
    certificate_required: bool,
    defaults: ConnectionDefaults,
}

impl ConnectionState {
    fn new(registration: &Registration, init: StateInit) -> Arc<Self> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            handle: NativeHandle::new(registration.api().clone(), init.raw, HandleKind::Connection),
            context: init.context,
            trace_id: format!("[conn][{}]", init.raw),
            is_server: init.is_server,
            inner: Mutex::new(ConnectionInner {
                phase: ConnectionPhase::Idle,
                connected: None,
                handshake_hook: None,
                accept_tx: Some(accept_tx),
                stream_count: 0,
                closing: false,
                peer_error_code: None,
                transport_error: None,
                local_endpoint: init.local_endpoint,
                remote_endpoint: init.remote_endpoint,
                target_host: init.target_host,
                negotiated_alpn: None,
                remote_certificate: None,
                validation: init.validation,
                certificate_required: init.certificate_required,
                validation_result: None,
                defaults: init.defaults,
                configuration: None,
                bidirectional_waiters: Vec::new(),
                unidirectional_waiters: Vec::new(),
            }),
            shutdown: OnceSignal::new(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            registration: registration.clone(),
        })
    }

    pub(crate) fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub(crate) fn raw(&self) -> RawHandle {
        self.handle.raw()
    }

    pub(crate) fn api(&self) -> &Arc<dyn QuicApi> {
        self.handle.api()
    }

    pub(crate) fn default_stream_error_code(&self) -> u64 {
        self.inner.lock().defaults.default_stream_error_code
    }

    pub(crate) fn default_close_error_code(&self) -> u64 {
        self.inner.lock().defaults.default_close_error_code
    }

    /// The error surfaced to callers once the connection went away.
    pub(crate) fn abort_error(&self) -> QuicError {
        Self::abort_error_locked(&self.inner.lock())
    }

    fn abort_error_locked(inner: &ConnectionInner) -> QuicError {
        match (inner.peer_error_code, &inner.transport_error) {
            (None, Some(err)) => err.clone(),
            (code, _) => QuicError::connection_aborted(code),
        }
    }

    /// Registers a new child stream. Fails once the connection is closing.
    pub(crate) fn try_add_stream(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closing {
            return Err(QuicError::invalid_operation("connection is closing"));
        }
        inner.stream_count += 1;
        Ok(())
    }

    /// Called from a stream's one-time cleanup.
    pub(crate) fn release_stream(&self) {
        let release = {
            let mut inner = self.inner.lock();
            inner.stream_count = inner.stream_count.saturating_sub(1);
            inner.closing && inner.stream_count == 0
        };
        if release {
            debug!("{} last stream released, closing handle", self.trace_id);
            self.release_handle();
        }
    }

    fn release_handle(&self) {
        if self.handle.release() {
            CONNECTIONS.remove(self.context);
        }
    }

    pub(crate) fn set_handshake_hook(&self, hook: HandshakeHook) {
        self.inner.lock().handshake_hook = Some(hook);
    }

    /// Binds server options chosen by the listener to this connection.
    pub(crate) fn apply_server_options(
        &self,
        options: &ServerConnectionOptions,
        configuration: Arc<NativeHandle>,
    ) -> Result<()> {
        let raw_configuration = configuration.raw();
        {
            let mut inner = self.inner.lock();
            inner.validation = options.validation.clone();
            inner.certificate_required = options.client_certificate_required;
            inner.defaults = options.defaults.clone();
            inner.configuration = Some(configuration);
        }
        self.api()
            .connection_set_configuration(self.raw(), raw_configuration)
            .ok()
            .map_err(QuicError::from)
    }

    /// Fails a pending connect, used when a handler could not process an
    /// establishment event.
    pub(crate) fn fail_connect(&self, err: QuicError) {
        let (connected, hook) = {
            let mut inner = self.inner.lock();
            (inner.connected.take(), inner.handshake_hook.take())
        };
        complete(connected, Err(err.clone()));
        if let Some(hook) = hook {
            hook(Err(err));
        }
    }

    pub(crate) fn handle_event(self: &Arc<Self>, event: &mut ConnectionEvent) -> Result<Status> {
        match event {
            ConnectionEvent::Connected { negotiated_alpn, .. } => self.on_connected(negotiated_alpn),
            ConnectionEvent::ShutdownInitiatedByTransport { status, error_code } => {
                self.on_shutdown_initiated_by_transport(*status, *error_code)
            }
            ConnectionEvent::ShutdownInitiatedByPeer { error_code } => self.on_shutdown_initiated_by_peer(*error_code),
            ConnectionEvent::ShutdownComplete { .. } => self.on_shutdown_complete(),
            ConnectionEvent::LocalAddressChanged { address } => {
                self.inner.lock().local_endpoint = Some(*address);
                Ok(Status::Success)
            }
            ConnectionEvent::PeerAddressChanged { address } => {
                self.inner.lock().remote_endpoint = Some(*address);
                Ok(Status::Success)
            }
            ConnectionEvent::PeerStreamStarted { stream, unidirectional } => {
                self.on_peer_stream_started(*stream, *unidirectional)
            }
            ConnectionEvent::StreamsAvailable {
                bidirectional_count,
                unidirectional_count,
            } => self.on_streams_available(*bidirectional_count, *unidirectional_count),
            ConnectionEvent::PeerCertificateReceived {
                certificate,
                chain,
                deferred_status,
            } => self.on_peer_certificate_received(certificate.take(), chain, *deferred_status),
            _ => Ok(Status::Success),
        }
    }

    fn on_connected(&self, negotiated_alpn: &[u8]) -> Result<Status> {
        let local = self.api().get_param(self.raw(), Param::LocalAddress).ok();
        let remote = self.api().get_param(self.raw(), Param::RemoteAddress).ok();
        let (connected, hook) = {
            let mut inner = self.inner.lock();
            if inner.phase < ConnectionPhase::Connected {
                inner.phase = ConnectionPhase::Connected;
            }
            inner.negotiated_alpn = Some(negotiated_alpn.to_vec());
            if let Some(address) = local.as_ref().and_then(|value| value.as_address()) {
                inner.local_endpoint = Some(address);
            }
            if let Some(address) = remote.as_ref().and_then(|value| value.as_address()) {
                inner.remote_endpoint = Some(address);
            }
            (inner.connected.take(), inner.handshake_hook.take())
        };
        info!(
            "{} connection established, alpn {}",
            self.trace_id,
            String::from_utf8_lossy(negotiated_alpn)
        );
        complete(connected, Ok(()));
        if let Some(hook) = hook {
            hook(Ok(()));
        }
        Ok(Status::Success)
    }

    fn on_shutdown_initiated_by_transport(&self, status: Status, error_code: u64) -> Result<Status> {
        let err = QuicError::from_connect_status(status);
        debug!(
            "{} shutdown initiated by transport: {} (error code {})",
            self.trace_id, status, error_code
        );
        let (connected, hook) = {
            let mut inner = self.inner.lock();
            if inner.phase < ConnectionPhase::ShutdownInitiated {
                inner.phase = ConnectionPhase::ShutdownInitiated;
            }
            inner.transport_error.get_or_insert(err.clone());
            (inner.connected.take(), inner.handshake_hook.take())
        };
        complete(connected, Err(err.clone()));
        if let Some(hook) = hook {
            hook(Err(err));
        }
        Ok(Status::Success)
    }

    fn on_shutdown_initiated_by_peer(&self, error_code: u64) -> Result<Status> {
        debug!("{} shutdown initiated by peer with code {}", self.trace_id, error_code);
        let accept_tx = {
            let mut inner = self.inner.lock();
            inner.peer_error_code = Some(error_code);
            if inner.phase < ConnectionPhase::ShutdownInitiated {
                inner.phase = ConnectionPhase::ShutdownInitiated;
            }
            inner.accept_tx.take()
        };
        // Closing the queue fails pending and future accepts.
        drop(accept_tx);
        Ok(Status::Success)
    }

    fn on_shutdown_complete(&self) -> Result<Status> {
        let (err, connected, hook, accept_tx, waiters) = {
            let mut inner = self.inner.lock();
            inner.phase = ConnectionPhase::ShutdownComplete;
            let mut waiters = std::mem::take(&mut inner.bidirectional_waiters);
            waiters.append(&mut inner.unidirectional_waiters);
            (
                Self::abort_error_locked(&inner),
                inner.connected.take(),
                inner.handshake_hook.take(),
                inner.accept_tx.take(),
                waiters,
            )
        };
        debug!("{} shutdown complete", self.trace_id);
        drop(accept_tx);
        complete(connected, Err(err.clone()));
        if let Some(hook) = hook {
            hook(Err(err.clone()));
        }
        for waiter in waiters {
            complete(Some(waiter), Err(err.clone()));
        }
        self.shutdown.complete(Ok(()));
        Ok(Status::Success)
    }

    fn on_peer_stream_started(self: &Arc<Self>, raw: RawHandle, unidirectional: bool) -> Result<Status> {
        let stream = match Stream::inbound(self, raw, unidirectional) {
            Ok(stream) => stream,
            Err(err) => {
                debug!("{} refusing peer stream {}: {}", self.trace_id, raw, err);
                return Ok(Status::InvalidState);
            }
        };
        let accept_tx = self.inner.lock().accept_tx.clone();
        match accept_tx {
            Some(tx) => {
                if let Err(rejected) = tx.send(stream) {
                    // Dropping the stream aborts and disposes it.
                    drop(rejected.0);
                }
            }
            None => drop(stream),
        }
        Ok(Status::Success)
    }

    fn on_streams_available(&self, bidirectional: u16, unidirectional: u16) -> Result<Status> {
        let waiters = {
            let mut inner = self.inner.lock();
            let mut waiters = Vec::new();
            if bidirectional > 0 {
                waiters.append(&mut inner.bidirectional_waiters);
            }
            if unidirectional > 0 {
                waiters.append(&mut inner.unidirectional_waiters);
            }
            waiters
        };
        for waiter in waiters {
            complete(Some(waiter), Ok(()));
        }
        Ok(Status::Success)
    }

    fn on_peer_certificate_received(
        &self,
        certificate: Option<Certificate>,
        chain: &[Certificate],
        deferred_status: Status,
    ) -> Result<Status> {
        let (validation, required, mut cached, context) = {
            let inner = self.inner.lock();
            (
                inner.validation.clone(),
                inner.certificate_required,
                inner.validation_result,
                CertificateContext {
                    target_host: inner.target_host.clone(),
                    remote_address: inner.remote_endpoint,
                    is_server: self.is_server,
                },
            )
        };

        // The user callback runs outside the lock.
        let status = certificate::evaluate(
            &validation,
            &context,
            certificate.as_ref(),
            chain,
            deferred_status,
            required,
            &mut cached,
        );
        if status.is_failure() {
            warn!("{} peer certificate rejected: {}", self.trace_id, status);
        } else {
            debug!("{} peer certificate accepted: {:?}", self.trace_id, certificate);
        }

        let mut inner = self.inner.lock();
        inner.remote_certificate = certificate;
        inner.validation_result = cached;
        Ok(status)
    }
}

/// A QUIC connection.
///
/// Dropping the connection disposes it: the native connection is shut down
/// silently if it is still up, streams still waiting in the accept queue are
/// aborted, and the handle is released once no stream refers to it.
pub struct Connection {
    state: Arc<ConnectionState>,
    options: Option<ClientConnectionOptions>,
    close_requested: AtomicBool,
    disposed: AtomicBool,
}

impl Connection {
    /// Opens an outbound connection. Nothing is sent until [`connect`].
    ///
    /// [`connect`]: Connection::connect
    pub fn new_outbound(registration: &Registration, options: ClientConnectionOptions) -> Result<Self> {
        options.validate()?;
        let api = registration.api();
        let context = CONNECTIONS.allocate();
        let raw = api
            .connection_open(registration.raw(), connection_callback, context)
            .map_err(QuicError::from)?;
        let (server_name, _) = options.server_name();
        let state = ConnectionState::new(
            registration,
            StateInit {
                raw,
                context,
                is_server: false,
                target_host: Some(server_name),
                local_endpoint: None,
                remote_endpoint: None,
                validation: options.validation.clone(),
                certificate_required: true,
                defaults: options.defaults.clone(),
            },
        );
        CONNECTIONS.insert(context, state.clone());
        debug!("{} opened outbound connection to {}", state.trace_id, options.remote_endpoint);
        Ok(Self {
            state,
            options: Some(options),
            close_requested: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    /// Opens and connects in one step.
    pub async fn connect_with(
        registration: &Registration,
        options: ClientConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let connection = Self::new_outbound(registration, options)?;
        connection.connect(None, cancel).await?;
        Ok(connection)
    }

    /// Takes over a connection the engine created for an incoming client.
    pub(crate) fn inbound(registration: &Registration, raw: RawHandle, info: &NewConnectionInfo) -> Self {
        let context = CONNECTIONS.allocate();
        let state = ConnectionState::new(
            registration,
            StateInit {
                raw,
                context,
                is_server: true,
                target_host: Some(info.server_name.clone()).filter(|name| !name.is_empty()),
                local_endpoint: Some(info.local_address),
                remote_endpoint: Some(info.remote_address),
                validation: CertificateValidation::default(),
                certificate_required: false,
                defaults: ConnectionDefaults::default(),
            },
        );
        CONNECTIONS.insert(context, state.clone());
        registration.api().set_connection_callback(raw, connection_callback, context);
        debug!("{} accepted inbound connection from {}", state.trace_id, info.remote_address);
        Self {
            state,
            options: None,
            close_requested: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> &Arc<ConnectionState> {
        &self.state
    }

    /// Starts the handshake and waits for it to finish.
    ///
    /// A failing engine start call fails right away. When `deadline` expires
    /// the connection is aborted and [`QuicError::ConnectionTimeout`]
    /// returned; cancellation aborts it the same way.
    pub async fn connect(&self, deadline: Option<Duration>, cancel: &CancellationToken) -> Result<()> {
        let options = self
            .options
            .as_ref()
            .ok_or_else(|| QuicError::invalid_operation("inbound connections are already connected"))?;

        let receiver = {
            let mut inner = self.state.inner.lock();
            if inner.phase != ConnectionPhase::Idle {
                return Err(QuicError::invalid_operation("connect may only be called once"));
            }
            inner.phase = ConnectionPhase::Connecting;
            let (completer, receiver) = completion();
            inner.connected = Some(completer);
            receiver
        };

        let api = self.state.api();
        let configuration = match api.configuration_open(
            self.state.registration.raw(),
            &options.application_protocols,
            &options.defaults.native_settings(),
            &options.credentials(),
        ) {
            Ok(raw) => Arc::new(NativeHandle::new(api.clone(), raw, HandleKind::Configuration)),
            Err(status) => {
                self.state.inner.lock().connected.take();
                return Err(QuicError::from(status));
            }
        };
        let raw_configuration = configuration.raw();
        self.state.inner.lock().configuration = Some(configuration);

        let (server_name, port) = options.server_name();
        info!("{} connecting to {} ({}:{})", self.state.trace_id, options.remote_endpoint, server_name, port);
        let status = api.connection_start(self.state.raw(), raw_configuration, &server_name, port);
        if status.is_failure() {
            self.state.inner.lock().connected.take();
            warn!("{} connection start failed: {}", self.state.trace_id, status);
            return Err(QuicError::from_connect_status(status));
        }

        let wait = with_cancellation(receive(receiver), cancel, || QuicError::Canceled);
        let result = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, wait)
                .await
                .unwrap_or(Err(QuicError::ConnectionTimeout)),
            None => wait.await,
        };

        if let Err(err) = &result {
            if matches!(err, QuicError::Canceled | QuicError::ConnectionTimeout) {
                debug!("{} connect abandoned: {}", self.state.trace_id, err);
                self.abort(options.defaults.default_close_error_code);
            }
        }
        result
    }

    /// Waits for the next stream the peer opened.
    pub async fn accept_inbound_stream(&self, cancel: &CancellationToken) -> Result<Stream> {
        let mut accept_rx = self.state.accept_rx.lock().await;
        let next = with_cancellation(async { Ok(accept_rx.recv().await) }, cancel, || QuicError::Canceled).await?;
        next.ok_or_else(|| self.state.abort_error())
    }

    /// Opens a stream that sends and receives. Only valid while connected.
    pub fn open_bidirectional_stream(&self) -> Result<Stream> {
        self.open_stream(StreamKind::Bidirectional)
    }

    /// Opens a send-only stream. Only valid while connected.
    pub fn open_unidirectional_stream(&self) -> Result<Stream> {
        self.open_stream(StreamKind::Unidirectional)
    }

    fn open_stream(&self, kind: StreamKind) -> Result<Stream> {
        if self.state.inner.lock().phase != ConnectionPhase::Connected {
            return Err(QuicError::invalid_operation("connection is not connected"));
        }
        Stream::outbound(&self.state, kind)
    }

    /// Returns once the peer allows at least one more stream of `kind`.
    pub async fn wait_for_available_streams(&self, kind: StreamKind, cancel: &CancellationToken) -> Result<()> {
        let param = match kind {
            StreamKind::Bidirectional => Param::LocalBidirectionalStreamCount,
            StreamKind::Unidirectional => Param::LocalUnidirectionalStreamCount,
        };
        if self.available_streams(param) > 0 {
            return Ok(());
        }

        let receiver = {
            let mut inner = self.state.inner.lock();
            if inner.phase == ConnectionPhase::ShutdownComplete {
                return Err(ConnectionState::abort_error_locked(&inner));
            }
            let (completer, receiver) = completion();
            match kind {
                StreamKind::Bidirectional => inner.bidirectional_waiters.push(completer),
                StreamKind::Unidirectional => inner.unidirectional_waiters.push(completer),
            }
            receiver
        };
        // Credit may have arrived between the first check and registering.
        if self.available_streams(param) > 0 {
            return Ok(());
        }
        with_cancellation(receive(receiver), cancel, || QuicError::Canceled).await
    }

    fn available_streams(&self, param: Param) -> u64 {
        self.state
            .api()
            .get_param(self.state.raw(), param)
            .ok()
            .and_then(|value| value.as_u64())
            .unwrap_or(0)
    }

    /// Shuts the connection down and waits for the engine to finish.
    ///
    /// Only the first call issues the shutdown; a disposed connection
    /// returns immediately.
    pub async fn close(&self, error_code: u64, cancel: &CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            info!("{} closing with code {}", self.state.trace_id, error_code);
            self.state
                .api()
                .connection_shutdown(self.state.raw(), ConnectionShutdownFlags::NONE, error_code);
        }
        with_cancellation(self.state.shutdown.wait(), cancel, || QuicError::Canceled).await
    }

    /// Abortive shutdown followed by dispose.
    pub(crate) fn abort(&self, error_code: u64) {
        if !self.close_requested.swap(true, Ordering::AcqRel) {
            self.state
                .api()
                .connection_shutdown(self.state.raw(), ConnectionShutdownFlags::NONE, error_code);
        }
        self.dispose();
    }

    /// Releases the connection. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = &self.state;
        if !state.shutdown.is_completed() {
            let code = state.default_close_error_code();
            state
                .api()
                .connection_shutdown(state.raw(), ConnectionShutdownFlags::SILENT, code);
        }

        let (accept_tx, code) = {
            let mut inner = state.inner.lock();
            inner.closing = true;
            (inner.accept_tx.take(), inner.defaults.default_stream_error_code)
        };
        drop(accept_tx);

        // An accept in progress holds the receiver; with the sender gone it
        // wakes up on its own and nothing is left to drain.
        if let Ok(mut accept_rx) = state.accept_rx.try_lock() {
            accept_rx.close();
            while let Ok(stream) = accept_rx.try_recv() {
                stream.abort(StreamDirection::Both, code);
            }
        }

        let release = state.inner.lock().stream_count == 0;
        if release {
            state.release_handle();
        } else {
            debug!("{} handle release deferred to last stream", state.trace_id);
        }
    }

    /// Log prefix, `[conn][<handle>]`
    pub fn trace_id(&self) -> &str {
        &self.state.trace_id
    }

    /// Check if connection is established
    pub fn is_connected(&self) -> bool {
        self.state.inner.lock().phase == ConnectionPhase::Connected
    }

    /// Get the current lifecycle phase
    pub fn phase(&self) -> ConnectionPhase {
        self.state.inner.lock().phase
    }

    /// Get the local address
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.state.inner.lock().local_endpoint
    }

    /// Get the peer address
    pub fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.state.inner.lock().remote_endpoint
    }

    /// ALPN agreed during the handshake
    pub fn negotiated_application_protocol(&self) -> Option<Vec<u8>> {
        self.state.inner.lock().negotiated_alpn.clone()
    }

    /// Certificate the peer presented, if any
    pub fn remote_certificate(&self) -> Option<Certificate> {
        self.state.inner.lock().remote_certificate.clone()
    }

    /// Server name used for SNI; for inbound connections, the name the client asked for
    pub fn target_host_name(&self) -> Option<String> {
        self.state.inner.lock().target_host.clone()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("trace_id", &self.state.trace_id)
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::recording::{Call, RecordingEngine};
    use crate::quic::certificate::{PolicyErrors, ValidationCallback};
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::{assert_pending, assert_ready};

    fn options() -> ClientConnectionOptions {
        ClientConnectionOptions::new(SocketAddr::from(([127, 0, 0, 1], 4433)), vec![b"h3".to_vec()])
    }

    #[tokio::test]
    async fn test_connect_captures_alpn_and_endpoint() {
        let engine = RecordingEngine::new();
        let registration = Registration::open(engine.clone(), "test").unwrap();
        let cancel = CancellationToken::new();

        let connection = Connection::connect_with(&registration, options(), &cancel).await.unwrap();
        assert!(connection.is_connected());
        assert_eq!(connection.negotiated_application_protocol(), Some(b"h3".to_vec()));
        assert_eq!(connection.local_endpoint(), Some(SocketAddr::from(([127, 0, 0, 1], 50000))));
        assert_eq!(connection.target_host_name().as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid() {
        let engine = RecordingEngine::new();
        let registration = Registration::open(engine.clone(), "test").unwrap();
        let cancel = CancellationToken::new();

        let connection = Connection::connect_with(&registration, options(), &cancel).await.unwrap();
        let err = connection.connect(None, &cancel).await.unwrap_err();
        assert!(matches!(err, QuicError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_deadline_aborts_connection() {
        let engine = RecordingEngine::new();
        engine.script(|script| script.complete_connects = false);
        let registration = Registration::open(engine.clone(), "test").unwrap();
        let connection = Connection::new_outbound(&registration, options()).unwrap();

        let err = connection
            .connect(Some(Duration::from_millis(10)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, QuicError::ConnectionTimeout);
        assert_eq!(
            engine.count(|call| matches!(call, Call::ConnectionShutdown { silent: false, .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_dispose_without_streams_releases_handle() {
        let engine = RecordingEngine::new();
        let registration = Registration::open(engine.clone(), "test").unwrap();
        let connection = Connection::connect_with(&registration, options(), &CancellationToken::new())
            .await
            .unwrap();
        let raw = connection.state().raw();

        drop(connection);
        assert_eq!(engine.count(|call| *call == Call::ConnectionClose(raw)), 1);
        assert_eq!(
            engine.count(|call| matches!(call, Call::ConnectionShutdown { silent: true, .. })),
            1
        );
    }

    fn certificate_event(certificate: Option<Certificate>) -> ConnectionEvent {
        ConnectionEvent::PeerCertificateReceived {
            certificate,
            chain: Vec::new(),
            deferred_status: Status::Success,
        }
    }

    #[tokio::test]
    async fn test_missing_server_certificate_is_refused() {
        let engine = RecordingEngine::new();
        let registration = Registration::open(engine.clone(), "test").unwrap();
        let connection = Connection::connect_with(&registration, options(), &CancellationToken::new())
            .await
            .unwrap();

        let status = engine.fire_connection(connection.state().raw(), certificate_event(None));
        assert_eq!(status, Status::CertNoCert);
        assert!(connection.remote_certificate().is_none());
    }

    #[tokio::test]
    async fn test_rejected_certificate_runs_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let callback: ValidationCallback = Arc::new(
            move |_: &CertificateContext, _: Option<&Certificate>, _: &[Certificate], _: PolicyErrors| {
                counted.fetch_add(1, Ordering::SeqCst);
                false
            },
        );
        let validation = CertificateValidation {
            callback: Some(callback),
            ..CertificateValidation::default()
        };
        let engine = RecordingEngine::new();
        let registration = Registration::open(engine.clone(), "test").unwrap();
        let connection =
            Connection::connect_with(&registration, options().with_validation(validation), &CancellationToken::new())
                .await
                .unwrap();
        let raw = connection.state().raw();
        let certificate = Certificate(Bytes::from_static(b"peer-der"));

        for _ in 0..2 {
            let status = engine.fire_connection(raw, certificate_event(Some(certificate.clone())));
            assert_eq!(status, Status::BadCertificate);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(connection.remote_certificate(), Some(certificate));
    }

    #[tokio::test]
    async fn test_panicking_handler_fails_pending_connect() {
        let callback: ValidationCallback = Arc::new(
            |_: &CertificateContext, _: Option<&Certificate>, _: &[Certificate], _: PolicyErrors| -> bool {
                panic!("validation callback exploded")
            },
        );
        let validation = CertificateValidation {
            callback: Some(callback),
            ..CertificateValidation::default()
        };
        let engine = RecordingEngine::new();
        engine.script(|script| script.complete_connects = false);
        let registration = Registration::open(engine.clone(), "test").unwrap();
        let connection = Connection::new_outbound(&registration, options().with_validation(validation)).unwrap();
        let cancel = CancellationToken::new();

        let mut connect = tokio_test::task::spawn(connection.connect(None, &cancel));
        assert_pending!(connect.poll());

        let certificate = Certificate(Bytes::from_static(b"peer-der"));
        let status = engine.fire_connection(connection.state().raw(), certificate_event(Some(certificate)));
        assert_eq!(status, Status::InternalError);
        assert_eq!(
            assert_ready!(connect.poll()),
            Err(QuicError::Native {
                status: Status::InternalError
            })
        );
    }
}
