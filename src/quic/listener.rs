//! Inbound connection listener
//!
//! New connections sit in a pending map, keyed by native handle, until
//! their handshake resolves. Successful ones move to a bounded accept queue;
//! failed ones, and ones that find the queue full or closed, are disposed.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{QuicError, Result};
use crate::native::{
    Context, HandleKind, ListenerEvent, NativeHandle, NewConnectionInfo, Param, RawHandle, Registration, Status,
};

use super::completion::{with_cancellation, OnceSignal};
use super::connection::{Connection, ConnectionState};
use super::dispatch::listener_callback;
use super::options::{ListenerOptions, ServerConnectionOptions, ServerOptionsSource};
use super::registry::LISTENERS;

pub(crate) struct ListenerState {
    handle: NativeHandle,
    context: Context,
    trace_id: String,
    registration: Registration,
    options: ListenerOptions,
    runtime: tokio::runtime::Handle,
    pending: DashMap<RawHandle, Connection>,
    accept_tx: Mutex<Option<mpsc::Sender<Connection>>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Connection>>,
    configurations: DashMap<String, Arc<NativeHandle>>,
    stopped: OnceSignal<()>,
}

impl ListenerState {
    pub(crate) fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub(crate) fn handle_event(self: &Arc<Self>, event: &mut ListenerEvent) -> Result<Status> {
        match event {
            ListenerEvent::NewConnection { info, connection } => self.on_new_connection(info, *connection),
            ListenerEvent::StopComplete { .. } => {
                debug!("{} stop complete", self.trace_id);
                self.stopped.complete(Ok(()));
                Ok(Status::Success)
            }
        }
    }

    fn on_new_connection(self: &Arc<Self>, info: &NewConnectionInfo, raw: RawHandle) -> Result<Status> {
        if self.stopped.is_completed() || self.accept_tx.lock().is_none() {
            debug!("{} refusing connection {} after stop", self.trace_id, raw);
            return Ok(Status::InvalidState);
        }

        let connection = Connection::inbound(&self.registration, raw, info);
        let connection_state = connection.state().clone();

        let listener = Arc::downgrade(self);
        connection_state.set_handshake_hook(Box::new(move |result| {
            if let Some(listener) = listener.upgrade() {
                listener.on_handshake_finished(raw, result);
            }
        }));
        self.pending.insert(raw, connection);

        match &self.options.server_options {
            ServerOptionsSource::Fixed(options) => {
                if let Err(err) = self.bind(&connection_state, "", options) {
                    warn!("{} failed to configure {}: {}", self.trace_id, connection_state.trace_id(), err);
                    self.pending.remove(&raw);
                    return Ok(err.status());
                }
            }
            ServerOptionsSource::Provider(provider) => {
                let provider = provider.clone();
                let listener = Arc::downgrade(self);
                let info = info.clone();
                self.runtime.spawn(async move {
                    let options = provider.options_for(&info).await;
                    let Some(listener) = listener.upgrade() else {
                        return;
                    };
                    let bound = options.and_then(|options| listener.bind(&connection_state, &info.server_name, &options));
                    if let Err(err) = bound {
                        warn!(
                            "{} failed to configure {} for '{}': {}",
                            listener.trace_id,
                            connection_state.trace_id(),
                            info.server_name,
                            err
                        );
                        listener.pending.remove(&raw);
                    }
                });
            }
        }
        Ok(Status::Success)
    }

    /// Binds a configuration to a pending connection, building one per
    /// server name on first use.
    fn bind(&self, connection: &ConnectionState, server_name: &str, options: &ServerConnectionOptions) -> Result<()> {
        let cached = self.configurations.get(server_name).map(|entry| entry.value().clone());
        let configuration = match cached {
            Some(configuration) => configuration,
            None => {
                options.validate()?;
                let api = self.registration.api();
                let raw = api
                    .configuration_open(
                        self.registration.raw(),
                        &options.application_protocols,
                        &options.defaults.native_settings(),
                        &options.credentials(),
                    )
                    .map_err(QuicError::from)?;
                let configuration = Arc::new(NativeHandle::new(api.clone(), raw, HandleKind::Configuration));
                debug!("{} built configuration for '{}'", self.trace_id, server_name);
                self.configurations
                    .entry(server_name.to_string())
                    .or_insert(configuration)
                    .value()
                    .clone()
            }
        };
        connection.apply_server_options(options, configuration)
    }

    fn on_handshake_finished(&self, raw: RawHandle, result: Result<()>) {
        let Some((_, connection)) = self.pending.remove(&raw) else {
            return;
        };
        if let Err(err) = result {
            if err.is_abort() {
                debug!("{} handshake aborted for {}: {}", self.trace_id, connection.trace_id(), err);
            } else {
                warn!("{} handshake failed for {}: {}", self.trace_id, connection.trace_id(), err);
            }
            return;
        }

        let accept_tx = self.accept_tx.lock().clone();
        let Some(accept_tx) = accept_tx else {
            connection.abort(connection.state().default_close_error_code());
            return;
        };
        match accept_tx.try_send(connection) {
            Ok(()) => {}
            Err(TrySendError::Full(connection)) | Err(TrySendError::Closed(connection)) => {
                warn!("{} accept queue unavailable, rejecting {}", self.trace_id, connection.trace_id());
                connection.abort(connection.state().default_close_error_code());
            }
        }
    }
}

/// Accepts QUIC connections on a local endpoint.
pub struct Listener {
    state: Arc<ListenerState>,
    disposed: AtomicBool,
}

impl Listener {
    /// Starts listening. Must be called from within a Tokio runtime; server
    /// options providers run on it.
    pub async fn listen(registration: &Registration, options: ListenerOptions) -> Result<Self> {
        options.validate()?;
        let runtime = tokio::runtime::Handle::current();
        let api = registration.api();
        let context = LISTENERS.allocate();
        let raw = api
            .listener_open(registration.raw(), listener_callback, context)
            .map_err(QuicError::from)?;

        let (accept_tx, accept_rx) = mpsc::channel(options.listen_backlog);
        let endpoint = options.listen_endpoint;
        let state = Arc::new(ListenerState {
            handle: NativeHandle::new(api.clone(), raw, HandleKind::Listener),
            context,
            trace_id: format!("[list][{}]", raw),
            registration: registration.clone(),
            options,
            runtime,
            pending: DashMap::new(),
            accept_tx: Mutex::new(Some(accept_tx)),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            configurations: DashMap::new(),
            stopped: OnceSignal::new(),
        });
        LISTENERS.insert(context, state.clone());

        let status = api.listener_start(raw, &state.options.application_protocols, endpoint);
        if status.is_failure() {
            warn!("{} failed to start on {}: {}", state.trace_id, endpoint, status);
            LISTENERS.remove(context);
            state.handle.release();
            return Err(QuicError::from_connect_status(status));
        }
        info!("{} listening on {}", state.trace_id, endpoint);
        Ok(Self {
            state,
            disposed: AtomicBool::new(false),
        })
    }

    /// Waits for the next connection that completed its handshake.
    pub async fn accept_connection(&self, cancel: &CancellationToken) -> Result<Connection> {
        let mut accept_rx = self.state.accept_rx.lock().await;
        let next = with_cancellation(async { Ok(accept_rx.recv().await) }, cancel, || QuicError::Canceled).await?;
        next.ok_or(QuicError::OperationAborted)
    }

    /// Address the engine reports the listener bound to
    pub fn local_endpoint(&self) -> Result<SocketAddr> {
        self.state
            .registration
            .api()
            .get_param(self.state.handle.raw(), Param::LocalAddress)
            .map_err(QuicError::from)?
            .as_address()
            .ok_or_else(|| QuicError::invalid_operation("listener has no local address"))
    }

    /// Log prefix, `[list][<handle>]`
    pub fn trace_id(&self) -> &str {
        &self.state.trace_id
    }

    /// Stops the listener and disposes every connection it still holds.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = &self.state;
        state.registration.api().listener_stop(state.handle.raw());
        drop(state.accept_tx.lock().take());

        if let Ok(mut accept_rx) = state.accept_rx.try_lock() {
            accept_rx.close();
            while let Ok(connection) = accept_rx.try_recv() {
                drop(connection);
            }
        }

        let pending: Vec<RawHandle> = state.pending.iter().map(|entry| *entry.key()).collect();
        for raw in pending {
            drop(state.pending.remove(&raw));
        }
        state.configurations.clear();

        if state.handle.release() {
            LISTENERS.remove(state.context);
        }
        info!("{} stopped", state.trace_id);
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("trace_id", &self.state.trace_id)
            .field("endpoint", &self.state.options.listen_endpoint)
            .finish()
    }
}
