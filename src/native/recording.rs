//! In-process engine that records calls and lets the caller raise events
//!
//! `RecordingEngine` implements [`QuicApi`] without any networking. Every call
//! is appended to a log, handles are allocated from a counter, and the
//! callbacks registered for each handle can be invoked with `fire_*`. A small
//! [`Script`] controls scripted failures and which completions the engine
//! raises on its own (send-complete, shutdown-complete, start-complete).
//!
//! Callbacks are never invoked while the engine's own locks are held, so
//! handlers may call back into the engine.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::api::{
    ConnectionShutdownFlags, CredentialConfig, NativeSettings, Param, ParamValue, QuicApi, SendFlags,
    StreamOpenFlags, StreamShutdownFlags, StreamStartFlags,
};
use super::event::{
    ConnectionCallback, ConnectionEvent, Context, ListenerCallback, ListenerEvent, RawHandle, StreamCallback,
    StreamEvent,
};
use super::Status;

/// One recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    RegistrationOpen(String),
    RegistrationClose(RawHandle),
    ConfigurationOpen {
        configuration: RawHandle,
        alpn: Vec<Vec<u8>>,
        client: bool,
    },
    ConfigurationClose(RawHandle),
    ListenerOpen(RawHandle),
    ListenerStart {
        listener: RawHandle,
        address: SocketAddr,
    },
    ListenerStop(RawHandle),
    ListenerClose(RawHandle),
    ConnectionOpen(RawHandle),
    SetConnectionCallback(RawHandle),
    ConnectionSetConfiguration {
        connection: RawHandle,
        configuration: RawHandle,
    },
    ConnectionStart {
        connection: RawHandle,
        server_name: String,
        port: u16,
    },
    ConnectionShutdown {
        connection: RawHandle,
        silent: bool,
        error_code: u64,
    },
    ConnectionClose(RawHandle),
    StreamOpen {
        connection: RawHandle,
        stream: RawHandle,
        unidirectional: bool,
    },
    SetStreamCallback(RawHandle),
    StreamStart(RawHandle),
    StreamSend {
        stream: RawHandle,
        data: Vec<u8>,
        fin: bool,
    },
    StreamReceiveComplete {
        stream: RawHandle,
        length: u64,
    },
    StreamReceiveSetEnabled {
        stream: RawHandle,
        enabled: bool,
    },
    StreamShutdown {
        stream: RawHandle,
        flags: StreamShutdownFlags,
        error_code: u64,
    },
    StreamClose(RawHandle),
}

/// Scripted engine behaviour.
#[derive(Debug, Clone)]
pub struct Script {
    pub registration_status: Status,
    pub connection_open_status: Status,
    pub connection_start_status: Status,
    pub stream_start_status: Status,
    pub stream_send_status: Status,
    pub listener_start_status: Status,
    pub set_configuration_status: Status,
    /// Raise CONNECTED from inside `connection_start`, negotiating the
    /// first ALPN of the configuration.
    pub complete_connects: bool,
    /// Raise SEND_COMPLETE from inside `stream_send`.
    pub complete_sends: bool,
    /// Raise START_COMPLETE from inside `stream_start`.
    pub complete_starts: bool,
    /// Raise the shutdown events from inside the shutdown calls.
    pub complete_shutdowns: bool,
    pub bidirectional_credit: u16,
    pub unidirectional_credit: u16,
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            registration_status: Status::Success,
            connection_open_status: Status::Success,
            connection_start_status: Status::Success,
            stream_start_status: Status::Success,
            stream_send_status: Status::Success,
            listener_start_status: Status::Success,
            set_configuration_status: Status::Success,
            complete_connects: true,
            complete_sends: true,
            complete_starts: true,
            complete_shutdowns: true,
            bidirectional_credit: 100,
            unidirectional_credit: 100,
            local_address: SocketAddr::from(([127, 0, 0, 1], 50000)),
            remote_address: SocketAddr::from(([127, 0, 0, 1], 4433)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Registered {
    Connection {
        callback: ConnectionCallback,
        context: Context,
    },
    Stream {
        callback: StreamCallback,
        context: Context,
    },
    Listener {
        callback: ListenerCallback,
        context: Context,
    },
}

#[derive(Debug, Default)]
struct StreamRecord {
    connection: RawHandle,
    id: Option<u64>,
    unidirectional: bool,
    send_closed: bool,
    receive_closed: bool,
    shutdown_fired: bool,
}

#[derive(Debug, Default)]
struct ConnectionRecord {
    next_local_bidirectional: u64,
    next_local_unidirectional: u64,
    next_peer_bidirectional: u64,
    next_peer_unidirectional: u64,
    shutdown_fired: bool,
    negotiated_alpn: Vec<u8>,
}

impl ConnectionRecord {
    fn new(server: bool) -> Self {
        let initiator = u64::from(server);
        Self {
            next_local_bidirectional: initiator,
            next_local_unidirectional: 2 | initiator,
            next_peer_bidirectional: initiator ^ 1,
            next_peer_unidirectional: 2 | (initiator ^ 1),
            ..Self::default()
        }
    }

    fn next_id(&mut self, local: bool, unidirectional: bool) -> u64 {
        let next = match (local, unidirectional) {
            (true, false) => &mut self.next_local_bidirectional,
            (true, true) => &mut self.next_local_unidirectional,
            (false, false) => &mut self.next_peer_bidirectional,
            (false, true) => &mut self.next_peer_unidirectional,
        };
        let id = *next;
        *next += 4;
        id
    }
}

#[derive(Debug, Default)]
struct Objects {
    callbacks: HashMap<RawHandle, Registered>,
    connections: HashMap<RawHandle, ConnectionRecord>,
    configurations: HashMap<RawHandle, Vec<Vec<u8>>>,
    streams: HashMap<RawHandle, StreamRecord>,
}

enum Pending {
    Connection(RawHandle, ConnectionEvent),
    Stream(RawHandle, StreamEvent),
}

pub struct RecordingEngine {
    next_handle: AtomicU64,
    calls: Mutex<Vec<Call>>,
    objects: Mutex<Objects>,
    script: Mutex<Script>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Self::with_script(Script::default())
    }

    pub fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            next_handle: AtomicU64::new(0x1000),
            calls: Mutex::new(Vec::new()),
            objects: Mutex::new(Objects::default()),
            script: Mutex::new(script),
        })
    }

    /// Adjusts the script for subsequent calls.
    pub fn script(&self, update: impl FnOnce(&mut Script)) {
        update(&mut self.script.lock());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Concatenated payload of every send on `stream`.
    pub fn sent_data(&self, stream: RawHandle) -> Vec<u8> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::StreamSend { stream: s, data, .. } if *s == stream => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Handles of every stream opened locally on `connection`, oldest first.
    pub fn opened_streams(&self, connection: RawHandle) -> Vec<RawHandle> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                Call::StreamOpen { connection: c, stream, .. } if *c == connection => Some(*stream),
                _ => None,
            })
            .collect()
    }

    /// The most recently opened connection handle.
    pub fn last_connection(&self) -> Option<RawHandle> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            Call::ConnectionOpen(handle) => Some(*handle),
            _ => None,
        })
    }

    pub fn last_listener(&self) -> Option<RawHandle> {
        self.calls.lock().iter().rev().find_map(|call| match call {
            Call::ListenerOpen(handle) => Some(*handle),
            _ => None,
        })
    }

    /// Allocates an engine-owned connection, as if a client hello arrived.
    pub fn new_inbound_connection(&self) -> RawHandle {
        let handle = self.allocate();
        self.objects
            .lock()
            .connections
            .insert(handle, ConnectionRecord::new(true));
        handle
    }

    /// Allocates an engine-owned stream on `connection`, as if the peer
    /// opened one. Deliver it with `PEER_STREAM_STARTED`.
    pub fn new_peer_stream(&self, connection: RawHandle, unidirectional: bool) -> RawHandle {
        let handle = self.allocate();
        let mut objects = self.objects.lock();
        let id = objects
            .connections
            .get_mut(&connection)
            .map(|record| record.next_id(false, unidirectional));
        objects.streams.insert(
            handle,
            StreamRecord {
                connection,
                id,
                unidirectional,
                // Nothing is ever sent on a peer's unidirectional stream.
                send_closed: unidirectional,
                ..StreamRecord::default()
            },
        );
        handle
    }

    pub fn set_negotiated_alpn(&self, connection: RawHandle, alpn: &[u8]) {
        if let Some(record) = self.objects.lock().connections.get_mut(&connection) {
            record.negotiated_alpn = alpn.to_vec();
        }
    }

    pub fn fire_connection(&self, connection: RawHandle, mut event: ConnectionEvent) -> Status {
        self.deliver_connection(connection, &mut event)
    }

    pub fn fire_stream(&self, stream: RawHandle, mut event: StreamEvent) -> Status {
        self.deliver_stream(stream, &mut event)
    }

    /// Raises a RECEIVE event and returns the status together with the
    /// byte count the handler reported consumed.
    pub fn fire_receive(&self, stream: RawHandle, data: &[u8], fin: bool) -> (Status, u64) {
        let mut event = StreamEvent::Receive {
            absolute_offset: 0,
            buffers: if data.is_empty() {
                Vec::new()
            } else {
                vec![Bytes::copy_from_slice(data)]
            },
            fin,
            consumed: data.len() as u64,
        };
        let status = self.deliver_stream(stream, &mut event);
        let consumed = match event {
            StreamEvent::Receive { consumed, .. } => consumed,
            _ => 0,
        };
        (status, consumed)
    }

    pub fn fire_listener(&self, listener: RawHandle, mut event: ListenerEvent) -> Status {
        let registered = self.objects.lock().callbacks.get(&listener).copied();
        match registered {
            Some(Registered::Listener { callback, context }) => callback(listener, context, &mut event),
            _ => Status::InvalidState,
        }
    }

    fn deliver_connection(&self, connection: RawHandle, event: &mut ConnectionEvent) -> Status {
        let registered = self.objects.lock().callbacks.get(&connection).copied();
        match registered {
            Some(Registered::Connection { callback, context }) => {
                trace!("engine raising {} on {}", event.name(), connection);
                callback(connection, context, event)
            }
            _ => Status::InvalidState,
        }
    }

    fn deliver_stream(&self, stream: RawHandle, event: &mut StreamEvent) -> Status {
        let registered = self.objects.lock().callbacks.get(&stream).copied();
        match registered {
            Some(Registered::Stream { callback, context }) => {
                trace!("engine raising {} on {}", event.name(), stream);
                callback(stream, context, event)
            }
            _ => Status::InvalidState,
        }
    }

    fn deliver(&self, pending: Vec<Pending>) {
        for item in pending {
            match item {
                Pending::Connection(handle, mut event) => {
                    self.deliver_connection(handle, &mut event);
                }
                Pending::Stream(handle, mut event) => {
                    self.deliver_stream(handle, &mut event);
                }
            }
        }
    }

    fn allocate(&self) -> RawHandle {
        RawHandle(self.next_handle.fetch_add(0x10, Ordering::Relaxed))
    }

    fn record(&self, call: Call) {
        trace!("engine call {:?}", call);
        self.calls.lock().push(call);
    }

    fn stream_shutdown_events(record: &mut StreamRecord, stream: RawHandle, flags: StreamShutdownFlags) -> Vec<Pending> {
        let mut pending = Vec::new();
        if (flags.graceful || flags.abort_send) && !record.send_closed {
            record.send_closed = true;
            pending.push(Pending::Stream(
                stream,
                StreamEvent::SendShutdownComplete {
                    graceful: flags.graceful,
                },
            ));
        }
        if flags.abort_receive {
            record.receive_closed = true;
        }
        if record.send_closed && record.receive_closed && !record.shutdown_fired {
            record.shutdown_fired = true;
            pending.push(Pending::Stream(
                stream,
                StreamEvent::ShutdownComplete {
                    connection_shutdown: false,
                    app_close_in_progress: false,
                },
            ));
        }
        pending
    }
}

impl QuicApi for RecordingEngine {
    fn registration_open(&self, app_name: &str) -> Result<RawHandle, Status> {
        self.record(Call::RegistrationOpen(app_name.to_string()));
        let status = self.script.lock().registration_status;
        status.ok()?;
        Ok(self.allocate())
    }

    fn registration_close(&self, registration: RawHandle) {
        self.record(Call::RegistrationClose(registration));
    }

    fn configuration_open(
        &self,
        _registration: RawHandle,
        alpn: &[Vec<u8>],
        _settings: &NativeSettings,
        credentials: &CredentialConfig,
    ) -> Result<RawHandle, Status> {
        let configuration = self.allocate();
        self.objects
            .lock()
            .configurations
            .insert(configuration, alpn.to_vec());
        self.record(Call::ConfigurationOpen {
            configuration,
            alpn: alpn.to_vec(),
            client: credentials.client,
        });
        Ok(configuration)
    }

    fn configuration_close(&self, configuration: RawHandle) {
        self.record(Call::ConfigurationClose(configuration));
        self.objects.lock().configurations.remove(&configuration);
    }

    fn listener_open(
        &self,
        _registration: RawHandle,
        callback: ListenerCallback,
        context: Context,
    ) -> Result<RawHandle, Status> {
        let listener = self.allocate();
        self.objects
            .lock()
            .callbacks
            .insert(listener, Registered::Listener { callback, context });
        self.record(Call::ListenerOpen(listener));
        Ok(listener)
    }

    fn listener_start(&self, listener: RawHandle, _alpn: &[Vec<u8>], address: SocketAddr) -> Status {
        self.record(Call::ListenerStart { listener, address });
        self.script.lock().listener_start_status
    }

    fn listener_stop(&self, listener: RawHandle) {
        self.record(Call::ListenerStop(listener));
        if self.script.lock().complete_shutdowns {
            self.fire_listener(
                listener,
                ListenerEvent::StopComplete {
                    app_close_in_progress: true,
                },
            );
        }
    }

    fn listener_close(&self, listener: RawHandle) {
        self.record(Call::ListenerClose(listener));
        self.objects.lock().callbacks.remove(&listener);
    }

    fn connection_open(
        &self,
        _registration: RawHandle,
        callback: ConnectionCallback,
        context: Context,
    ) -> Result<RawHandle, Status> {
        let status = self.script.lock().connection_open_status;
        status.ok()?;
        let connection = self.allocate();
        {
            let mut objects = self.objects.lock();
            objects
                .callbacks
                .insert(connection, Registered::Connection { callback, context });
            objects.connections.insert(connection, ConnectionRecord::new(false));
        }
        self.record(Call::ConnectionOpen(connection));
        Ok(connection)
    }

    fn set_connection_callback(&self, connection: RawHandle, callback: ConnectionCallback, context: Context) {
        self.objects
            .lock()
            .callbacks
            .insert(connection, Registered::Connection { callback, context });
        self.record(Call::SetConnectionCallback(connection));
    }

    fn connection_set_configuration(&self, connection: RawHandle, configuration: RawHandle) -> Status {
        self.record(Call::ConnectionSetConfiguration {
            connection,
            configuration,
        });
        self.script.lock().set_configuration_status
    }

    fn connection_start(
        &self,
        connection: RawHandle,
        configuration: RawHandle,
        server_name: &str,
        port: u16,
    ) -> Status {
        self.record(Call::ConnectionStart {
            connection,
            server_name: server_name.to_string(),
            port,
        });
        let (status, complete) = {
            let script = self.script.lock();
            (script.connection_start_status, script.complete_connects)
        };
        if status.is_failure() || !complete {
            return status;
        }
        let negotiated_alpn = {
            let mut objects = self.objects.lock();
            let alpn = objects
                .configurations
                .get(&configuration)
                .and_then(|alpn| alpn.first().cloned())
                .unwrap_or_default();
            if let Some(record) = objects.connections.get_mut(&connection) {
                record.negotiated_alpn = alpn.clone();
            }
            alpn
        };
        self.fire_connection(
            connection,
            ConnectionEvent::Connected {
                session_resumed: false,
                negotiated_alpn,
            },
        );
        status
    }

    fn connection_shutdown(&self, connection: RawHandle, flags: ConnectionShutdownFlags, error_code: u64) {
        self.record(Call::ConnectionShutdown {
            connection,
            silent: flags.silent,
            error_code,
        });
        if !self.script.lock().complete_shutdowns {
            return;
        }
        let mut pending = Vec::new();
        {
            let mut objects = self.objects.lock();
            let Some(record) = objects.connections.get_mut(&connection) else {
                return;
            };
            if record.shutdown_fired {
                return;
            }
            record.shutdown_fired = true;
            for (handle, stream) in objects.streams.iter_mut() {
                if stream.connection == connection && !stream.shutdown_fired {
                    stream.shutdown_fired = true;
                    pending.push(Pending::Stream(
                        *handle,
                        StreamEvent::ShutdownComplete {
                            connection_shutdown: true,
                            app_close_in_progress: false,
                        },
                    ));
                }
            }
        }
        pending.push(Pending::Connection(
            connection,
            ConnectionEvent::ShutdownComplete {
                handshake_completed: true,
                peer_acknowledged_shutdown: !flags.silent,
                app_close_in_progress: false,
            },
        ));
        self.deliver(pending);
    }

    fn connection_close(&self, connection: RawHandle) {
        self.record(Call::ConnectionClose(connection));
        let mut objects = self.objects.lock();
        objects.callbacks.remove(&connection);
        objects.connections.remove(&connection);
    }

    fn stream_open(
        &self,
        connection: RawHandle,
        flags: StreamOpenFlags,
        callback: StreamCallback,
        context: Context,
    ) -> Result<RawHandle, Status> {
        let stream = self.allocate();
        {
            let mut objects = self.objects.lock();
            objects
                .callbacks
                .insert(stream, Registered::Stream { callback, context });
            objects.streams.insert(
                stream,
                StreamRecord {
                    connection,
                    unidirectional: flags.unidirectional,
                    receive_closed: flags.unidirectional,
                    ..StreamRecord::default()
                },
            );
        }
        self.record(Call::StreamOpen {
            connection,
            stream,
            unidirectional: flags.unidirectional,
        });
        Ok(stream)
    }

    fn set_stream_callback(&self, stream: RawHandle, callback: StreamCallback, context: Context) {
        self.objects
            .lock()
            .callbacks
            .insert(stream, Registered::Stream { callback, context });
        self.record(Call::SetStreamCallback(stream));
    }

    fn stream_start(&self, stream: RawHandle, _flags: StreamStartFlags) -> Status {
        self.record(Call::StreamStart(stream));
        let (status, complete) = {
            let script = self.script.lock();
            (script.stream_start_status, script.complete_starts)
        };
        if status.is_failure() {
            return status;
        }
        let id = {
            let mut objects = self.objects.lock();
            let Objects {
                connections, streams, ..
            } = &mut *objects;
            streams.get_mut(&stream).and_then(|record| {
                let id = connections
                    .get_mut(&record.connection)?
                    .next_id(true, record.unidirectional);
                record.id = Some(id);
                Some(id)
            })
        };
        if complete {
            self.fire_stream(
                stream,
                StreamEvent::StartComplete {
                    status: Status::Success,
                    id: id.unwrap_or_default(),
                    peer_accepted: true,
                },
            );
        }
        status
    }

    fn stream_send(&self, stream: RawHandle, buffers: &[Bytes], flags: SendFlags) -> Status {
        self.record(Call::StreamSend {
            stream,
            data: buffers.iter().flat_map(|buffer| buffer.iter().copied()).collect(),
            fin: flags.fin,
        });
        let (status, complete) = {
            let script = self.script.lock();
            (script.stream_send_status, script.complete_sends)
        };
        if status.is_failure() {
            return status;
        }
        if complete {
            self.fire_stream(stream, StreamEvent::SendComplete { canceled: false });
            if flags.fin {
                let pending = {
                    let mut objects = self.objects.lock();
                    match objects.streams.get_mut(&stream) {
                        Some(record) => Self::stream_shutdown_events(record, stream, StreamShutdownFlags::GRACEFUL),
                        None => Vec::new(),
                    }
                };
                self.deliver(pending);
            }
        }
        Status::Pending
    }

    fn stream_receive_complete(&self, stream: RawHandle, length: u64) {
        self.record(Call::StreamReceiveComplete { stream, length });
    }

    fn stream_receive_set_enabled(&self, stream: RawHandle, enabled: bool) -> Status {
        self.record(Call::StreamReceiveSetEnabled { stream, enabled });
        Status::Success
    }

    fn stream_shutdown(&self, stream: RawHandle, flags: StreamShutdownFlags, error_code: u64) -> Status {
        self.record(Call::StreamShutdown {
            stream,
            flags,
            error_code,
        });
        if !self.script.lock().complete_shutdowns {
            return Status::Success;
        }
        let pending = {
            let mut objects = self.objects.lock();
            match objects.streams.get_mut(&stream) {
                Some(record) => Self::stream_shutdown_events(record, stream, flags),
                None => return Status::HandleClosed,
            }
        };
        self.deliver(pending);
        Status::Success
    }

    fn stream_close(&self, stream: RawHandle) {
        self.record(Call::StreamClose(stream));
        let mut objects = self.objects.lock();
        objects.callbacks.remove(&stream);
        objects.streams.remove(&stream);
    }

    fn get_param(&self, handle: RawHandle, param: Param) -> Result<ParamValue, Status> {
        let script = self.script.lock().clone();
        let objects = self.objects.lock();
        match param {
            Param::LocalAddress => Ok(ParamValue::Address(script.local_address)),
            Param::RemoteAddress => Ok(ParamValue::Address(script.remote_address)),
            Param::LocalBidirectionalStreamCount => Ok(ParamValue::U16(script.bidirectional_credit)),
            Param::LocalUnidirectionalStreamCount => Ok(ParamValue::U16(script.unidirectional_credit)),
            Param::StreamId => objects
                .streams
                .get(&handle)
                .and_then(|record| record.id)
                .map(ParamValue::U64)
                .ok_or(Status::InvalidState),
            Param::NegotiatedAlpn => objects
                .connections
                .get(&handle)
                .map(|record| ParamValue::Bytes(record.negotiated_alpn.clone()))
                .ok_or(Status::InvalidParameter),
        }
    }
}
