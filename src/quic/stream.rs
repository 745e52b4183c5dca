//! QUIC stream lifecycle
//!
//! Each direction runs its own small state machine inside [`StreamState`]:
//! reads, sends, the graceful send shutdown and the overall shutdown. All
//! four only move forward toward a terminal state, except that a completed
//! read or write returns to `None` so the stream can be used again.
//!
//! Native resources are released by a one-time cleanup that needs two
//! signals: the application disposing the [`Stream`] and the engine raising
//! SHUTDOWN_COMPLETE. Whichever arrives second runs it.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{QuicError, Result};
use crate::native::{
    Context, HandleKind, NativeHandle, Param, QuicApi, RawHandle, SendFlags, Status, StreamEvent, StreamOpenFlags,
    StreamShutdownFlags, StreamStartFlags,
};

use super::completion::{complete, completion, receive, with_cancellation, Completer, OnceSignal};
use super::connection::ConnectionState;
use super::dispatch::stream_callback;
use super::registry::STREAMS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Unidirectional,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Read,
    Write,
    Both,
}

impl StreamDirection {
    fn includes_read(self) -> bool {
        matches!(self, StreamDirection::Read | StreamDirection::Both)
    }

    fn includes_write(self) -> bool {
        matches!(self, StreamDirection::Write | StreamDirection::Both)
    }
}

/// Everything from `ReadsCompleted` on is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum ReadState {
    None,
    IndividualReadComplete,
    PendingRead,
    ReadsCompleted,
    Aborted,
    ConnectionClosed,
    Closed,
}

/// Everything from `Aborted` on is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SendState {
    None,
    Pending,
    Finished,
    Aborted,
    ConnectionClosed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownWriteState {
    None,
    Canceled,
    Finished,
    ConnectionClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShutdownState {
    None,
    Canceled,
    Pending,
    Finished,
    ConnectionClosed,
}

const CLEANUP_NONE: u8 = 0;
const CLEANUP_DISPOSED: u8 = 1;
const CLEANUP_SHUTDOWN_EVENT: u8 = 2;
const CLEANUP_DONE: u8 = 3;

/// Data the engine delivered that no read has consumed yet.
#[derive(Debug, Default)]
struct ReceiveBuffers {
    buffers: Vec<Bytes>,
    total_length: usize,
    is_final: bool,
}

impl ReceiveBuffers {
    fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for buffer in &self.buffers {
            if copied == dst.len() {
                break;
            }
            let n = buffer.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&buffer[..n]);
            copied += n;
        }
        copied
    }

    fn clear(&mut self) {
        self.buffers.clear();
        self.total_length = 0;
        self.is_final = false;
    }
}

fn gather(buffers: &[Bytes], limit: usize) -> Bytes {
    let mut data = BytesMut::with_capacity(limit);
    for buffer in buffers {
        let remaining = limit - data.len();
        if remaining == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..buffer.len().min(remaining)]);
    }
    data.freeze()
}

#[derive(Debug)]
struct ReadCompletion {
    data: Bytes,
    /// The engine still holds data and paused delivery until re-enabled.
    re_enable_receive: bool,
}

struct PendingRead {
    capacity: usize,
    completer: Completer<ReadCompletion>,
}

struct StreamInner {
    id: Option<u64>,
    read_state: ReadState,
    read_error_code: Option<u64>,
    receive: ReceiveBuffers,
    pending_read: Option<PendingRead>,
    send_state: SendState,
    send_error_code: Option<u64>,
    // Kept alive until SEND_COMPLETE; the engine reads from them.
    send_buffers: Vec<Bytes>,
    pending_write: Option<Completer<()>>,
    shutdown_write_state: ShutdownWriteState,
    shutdown_write: Option<Completer<()>>,
    shutdown_state: ShutdownState,
}

impl StreamInner {
    fn send_error(&self) -> QuicError {
        match self.send_error_code {
            Some(code) => QuicError::StreamAborted(code),
            None => QuicError::Canceled,
        }
    }
}

// Lock order: a stream's lock may be held while taking its connection's
// lock, never the other way around.
pub(crate) struct StreamState {
    handle: NativeHandle,
    connection: Arc<ConnectionState>,
    context: Context,
    trace_id: String,
    kind: StreamKind,
    inbound: bool,
    default_error_code: u64,
    inner: Mutex<StreamInner>,
    shutdown: OnceSignal<()>,
    cleanup: AtomicU8,
}

impl StreamState {
    fn new(
        connection: &Arc<ConnectionState>,
        raw: RawHandle,
        context: Context,
        kind: StreamKind,
        inbound: bool,
    ) -> Arc<Self> {
        let (read_state, send_state) = match (kind, inbound) {
            (StreamKind::Unidirectional, false) => (ReadState::Closed, SendState::None),
            (StreamKind::Unidirectional, true) => (ReadState::None, SendState::Closed),
            (StreamKind::Bidirectional, _) => (ReadState::None, SendState::None),
        };
        Arc::new(Self {
            handle: NativeHandle::new(connection.api().clone(), raw, HandleKind::Stream),
            connection: connection.clone(),
            context,
            trace_id: format!("[strm][{}]", raw),
            kind,
            inbound,
            default_error_code: connection.default_stream_error_code(),
            inner: Mutex::new(StreamInner {
                id: None,
                read_state,
                read_error_code: None,
                receive: ReceiveBuffers::default(),
                pending_read: None,
                send_state,
                send_error_code: None,
                send_buffers: Vec::new(),
                pending_write: None,
                shutdown_write_state: ShutdownWriteState::None,
                shutdown_write: None,
                shutdown_state: ShutdownState::None,
            }),
            shutdown: OnceSignal::new(),
            cleanup: AtomicU8::new(CLEANUP_NONE),
        })
    }

    pub(crate) fn trace_id(&self) -> &str {
        &self.trace_id
    }

    fn api(&self) -> &Arc<dyn QuicApi> {
        self.handle.api()
    }

    fn raw(&self) -> RawHandle {
        self.handle.raw()
    }

    /// Records that one of the two cleanup triggers arrived. Returns `true`
    /// for the second arrival, which must run the cleanup.
    fn arrive(&self, path: u8) -> bool {
        match self
            .cleanup
            .compare_exchange(CLEANUP_NONE, path, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => false,
            Err(current) if current != path && current != CLEANUP_DONE => self
                .cleanup
                .compare_exchange(current, CLEANUP_DONE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            Err(_) => false,
        }
    }

    /// Cleanup for a stream the engine will never raise events for.
    fn force_cleanup(&self) {
        if self.cleanup.swap(CLEANUP_DONE, Ordering::AcqRel) != CLEANUP_DONE {
            self.cleanup();
        }
    }

    fn cleanup(&self) {
        debug!("{} releasing stream", self.trace_id);
        self.handle.release();
        STREAMS.remove(self.context);
        self.connection.release_stream();
    }

    /// Issues a shutdown, ignoring the engine telling us the stream is
    /// already gone.
    fn shutdown_quietly(&self, flags: StreamShutdownFlags, error_code: u64) {
        let status = self.api().stream_shutdown(self.raw(), flags, error_code);
        if status.is_failure() && !matches!(status, Status::HandleClosed | Status::InvalidState) {
            warn!("{} stream shutdown {:?} failed: {}", self.trace_id, flags, status);
        }
    }

    pub(crate) fn handle_event(&self, event: &mut StreamEvent) -> Result<Status> {
        match event {
            StreamEvent::StartComplete { status, id, .. } => self.on_start_complete(*status, *id),
            StreamEvent::Receive {
                buffers, fin, consumed, ..
            } => self.on_receive(buffers, *fin, consumed),
            StreamEvent::SendComplete { canceled } => self.on_send_complete(*canceled),
            StreamEvent::PeerSendShutdown => self.on_peer_send_shutdown(),
            StreamEvent::PeerSendAborted { error_code } => self.on_peer_send_aborted(*error_code),
            StreamEvent::PeerReceiveAborted { error_code } => self.on_peer_receive_aborted(*error_code),
            StreamEvent::SendShutdownComplete { graceful } => self.on_send_shutdown_complete(*graceful),
            StreamEvent::ShutdownComplete {
                connection_shutdown, ..
            } => self.on_shutdown_complete(*connection_shutdown),
            _ => Ok(Status::Success),
        }
    }

    fn on_start_complete(&self, status: Status, id: u64) -> Result<Status> {
        let pending_write = {
            let mut inner = self.inner.lock();
            inner.id = Some(id);
            if status.is_failure() && inner.send_state < SendState::Aborted {
                inner.send_state = SendState::Aborted;
                inner.pending_write.take()
            } else {
                None
            }
        };
        if status.is_failure() {
            warn!("{} start failed: {}", self.trace_id, status);
            complete(pending_write, Err(QuicError::from(status)));
        } else {
            trace!("{} started with id {}", self.trace_id, id);
        }
        Ok(Status::Success)
    }

    fn on_receive(&self, buffers: &[Bytes], fin: bool, consumed: &mut u64) -> Result<Status> {
        let total: usize = buffers.iter().map(Bytes::len).sum();
        let mut inner = self.inner.lock();
        let current = inner.read_state;
        match current {
            // An empty receive without FIN carries nothing for a reader.
            ReadState::None | ReadState::PendingRead if total == 0 && !fin => {
                *consumed = 0;
                Ok(Status::Success)
            }
            ReadState::None if total == 0 && fin => {
                inner.read_state = ReadState::ReadsCompleted;
                *consumed = 0;
                Ok(Status::Success)
            }
            ReadState::None => {
                // Leave the data with the engine until a read takes it.
                inner.receive = ReceiveBuffers {
                    buffers: buffers.to_vec(),
                    total_length: total,
                    is_final: fin,
                };
                inner.read_state = ReadState::IndividualReadComplete;
                Ok(Status::Pending)
            }
            ReadState::PendingRead => {
                let Some(pending) = inner.pending_read.take() else {
                    return Err(QuicError::invalid_operation("pending read without a waiter"));
                };
                let data = gather(buffers, pending.capacity.min(total));
                let drained = data.len() == total;
                inner.read_state = if drained && fin {
                    ReadState::ReadsCompleted
                } else {
                    ReadState::None
                };
                drop(inner);

                *consumed = data.len() as u64;
                complete(
                    Some(pending.completer),
                    Ok(ReadCompletion {
                        data,
                        re_enable_receive: !drained,
                    }),
                );
                Ok(Status::Success)
            }
            state => {
                trace!("{} discarding {} bytes in {:?}", self.trace_id, total, state);
                *consumed = total as u64;
                Ok(Status::Success)
            }
        }
    }

    fn on_send_complete(&self, canceled: bool) -> Result<Status> {
        let (pending_write, result) = {
            let mut inner = self.inner.lock();
            inner.send_buffers.clear();
            let result = if canceled {
                if inner.send_state < SendState::Aborted {
                    inner.send_state = SendState::Aborted;
                }
                Err(inner.send_error())
            } else {
                if inner.send_state == SendState::Pending {
                    inner.send_state = SendState::Finished;
                }
                Ok(())
            };
            (inner.pending_write.take(), result)
        };
        complete(pending_write, result);
        Ok(Status::Success)
    }

    fn on_peer_send_shutdown(&self) -> Result<Status> {
        let pending_read = {
            let mut inner = self.inner.lock();
            let current = inner.read_state;
            match current {
                ReadState::None => {
                    inner.read_state = ReadState::ReadsCompleted;
                    None
                }
                ReadState::PendingRead => {
                    inner.read_state = ReadState::ReadsCompleted;
                    inner.pending_read.take()
                }
                ReadState::IndividualReadComplete => {
                    inner.receive.is_final = true;
                    None
                }
                _ => None,
            }
        };
        if let Some(pending) = pending_read {
            complete(
                Some(pending.completer),
                Ok(ReadCompletion {
                    data: Bytes::new(),
                    re_enable_receive: false,
                }),
            );
        }
        Ok(Status::Success)
    }

    fn on_peer_send_aborted(&self, error_code: u64) -> Result<Status> {
        debug!("{} peer aborted sending with code {}", self.trace_id, error_code);
        let pending_read = {
            let mut inner = self.inner.lock();
            if inner.read_state < ReadState::ReadsCompleted {
                inner.read_state = ReadState::Aborted;
                inner.read_error_code = Some(error_code);
                inner.receive.clear();
                inner.pending_read.take()
            } else {
                None
            }
        };
        if let Some(pending) = pending_read {
            complete(Some(pending.completer), Err(QuicError::StreamAborted(error_code)));
        }
        Ok(Status::Success)
    }

    fn on_peer_receive_aborted(&self, error_code: u64) -> Result<Status> {
        debug!("{} peer aborted receiving with code {}", self.trace_id, error_code);
        let (pending_write, shutdown_write) = {
            let mut inner = self.inner.lock();
            if inner.send_state < SendState::Aborted {
                inner.send_state = SendState::Aborted;
                inner.send_error_code = Some(error_code);
                (inner.pending_write.take(), inner.shutdown_write.take())
            } else {
                (None, None)
            }
        };
        complete(pending_write, Err(QuicError::StreamAborted(error_code)));
        complete(shutdown_write, Err(QuicError::StreamAborted(error_code)));
        Ok(Status::Success)
    }

    fn on_send_shutdown_complete(&self, graceful: bool) -> Result<Status> {
        let (shutdown_write, result) = {
            let mut inner = self.inner.lock();
            if inner.shutdown_write_state == ShutdownWriteState::None {
                inner.shutdown_write_state = if graceful {
                    ShutdownWriteState::Finished
                } else {
                    ShutdownWriteState::Canceled
                };
            }
            let result = if graceful { Ok(()) } else { Err(inner.send_error()) };
            (inner.shutdown_write.take(), result)
        };
        complete(shutdown_write, result);
        Ok(Status::Success)
    }

    fn on_shutdown_complete(&self, connection_shutdown: bool) -> Result<Status> {
        let connection_error = connection_shutdown.then(|| self.connection.abort_error());
        let (pending_read, read_result, pending_write, write_result, shutdown_write, shutdown_write_result) = {
            let mut inner = self.inner.lock();
            match &connection_error {
                Some(err) => {
                    if inner.read_state < ReadState::ReadsCompleted {
                        inner.read_state = ReadState::ConnectionClosed;
                    }
                    if inner.send_state < SendState::Aborted {
                        inner.send_state = SendState::ConnectionClosed;
                    }
                    if inner.shutdown_write_state == ShutdownWriteState::None {
                        inner.shutdown_write_state = ShutdownWriteState::ConnectionClosed;
                    }
                    inner.shutdown_state = ShutdownState::ConnectionClosed;
                    inner.send_buffers.clear();
                    (
                        inner.pending_read.take(),
                        Err(err.clone()),
                        inner.pending_write.take(),
                        Err(err.clone()),
                        inner.shutdown_write.take(),
                        Err(err.clone()),
                    )
                }
                None => {
                    if matches!(inner.read_state, ReadState::None | ReadState::PendingRead) {
                        inner.read_state = ReadState::ReadsCompleted;
                    }
                    inner.shutdown_state = ShutdownState::Finished;
                    let write_error = inner.send_error();
                    let shutdown_write_result = if inner.shutdown_write_state == ShutdownWriteState::Finished {
                        Ok(())
                    } else {
                        Err(QuicError::OperationAborted)
                    };
                    (
                        inner.pending_read.take(),
                        Ok(ReadCompletion {
                            data: Bytes::new(),
                            re_enable_receive: false,
                        }),
                        inner.pending_write.take(),
                        Err(write_error),
                        inner.shutdown_write.take(),
                        shutdown_write_result,
                    )
                }
            }
        };
        debug!("{} shutdown complete (connection shutdown: {})", self.trace_id, connection_shutdown);

        complete(pending_read.map(|pending| pending.completer), read_result);
        complete(pending_write, write_result);
        complete(shutdown_write, shutdown_write_result);
        self.shutdown.complete(match connection_error {
            Some(err) => Err(err),
            None => Ok(()),
        });

        if self.arrive(CLEANUP_SHUTDOWN_EVENT) {
            self.cleanup();
        }
        Ok(Status::Success)
    }

    /// Gives up on the outstanding read and asks the engine to stop
    /// receiving.
    fn cancel_read(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.read_state != ReadState::PendingRead {
                return;
            }
            inner.read_state = ReadState::Aborted;
            inner.pending_read.take()
        };
        debug!("{} read canceled", self.trace_id);
        complete(pending.map(|pending| pending.completer), Err(QuicError::Canceled));
        self.shutdown_quietly(StreamShutdownFlags::ABORT_RECEIVE, self.default_error_code);
    }

    fn cancel_write(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            if inner.send_state != SendState::Pending {
                return;
            }
            inner.send_state = SendState::Aborted;
            inner.pending_write.take()
        };
        debug!("{} write canceled", self.trace_id);
        complete(pending, Err(QuicError::Canceled));
        self.shutdown_quietly(StreamShutdownFlags::ABORT_SEND, self.default_error_code);
    }
}

/// Cancels the operation if its future is dropped before it finished.
struct CancelOnDrop<'a> {
    state: &'a StreamState,
    direction: StreamDirection,
    armed: bool,
}

impl<'a> CancelOnDrop<'a> {
    fn new(state: &'a StreamState, direction: StreamDirection) -> Self {
        Self {
            state,
            direction,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.direction.includes_read() {
            self.state.cancel_read();
        }
        if self.direction.includes_write() {
            self.state.cancel_write();
        }
    }
}

enum ReadStep {
    Copied { length: usize, re_enable_receive: bool },
    Wait(tokio::sync::oneshot::Receiver<Result<ReadCompletion>>),
}

/// One QUIC stream.
///
/// At most one read and one write may be in flight at a time. Dropping a
/// read or write future before it resolves cancels that operation and
/// aborts the corresponding direction.
pub struct Stream {
    state: Arc<StreamState>,
    disposed: AtomicBool,
}

impl Stream {
    pub(crate) fn outbound(connection: &Arc<ConnectionState>, kind: StreamKind) -> Result<Self> {
        connection.try_add_stream()?;
        let api = connection.api().clone();
        let context = STREAMS.allocate();
        let flags = StreamOpenFlags {
            unidirectional: kind == StreamKind::Unidirectional,
        };
        let raw = match api.stream_open(connection.raw(), flags, stream_callback, context) {
            Ok(raw) => raw,
            Err(status) => {
                connection.release_stream();
                return Err(QuicError::from(status));
            }
        };

        let state = StreamState::new(connection, raw, context, kind, false);
        STREAMS.insert(context, state.clone());

        let status = api.stream_start(
            raw,
            StreamStartFlags {
                immediate: true,
                fail_blocked: false,
            },
        );
        if status.is_failure() {
            warn!("{} failed to start: {}", state.trace_id, status);
            state.force_cleanup();
            return Err(QuicError::from(status));
        }
        debug!("{} opened {:?} stream on {}", state.trace_id, kind, connection.trace_id());
        Ok(Self {
            state,
            disposed: AtomicBool::new(false),
        })
    }

    pub(crate) fn inbound(connection: &Arc<ConnectionState>, raw: RawHandle, unidirectional: bool) -> Result<Self> {
        connection.try_add_stream()?;
        let kind = if unidirectional {
            StreamKind::Unidirectional
        } else {
            StreamKind::Bidirectional
        };
        let context = STREAMS.allocate();
        let state = StreamState::new(connection, raw, context, kind, true);
        STREAMS.insert(context, state.clone());
        connection.api().set_stream_callback(raw, stream_callback, context);
        debug!("{} peer started {:?} stream on {}", state.trace_id, kind, connection.trace_id());
        Ok(Self {
            state,
            disposed: AtomicBool::new(false),
        })
    }

    /// Reads into `buf`. Returns 0 once the peer finished sending.
    pub async fn read(&self, buf: &mut [u8], cancel: &CancellationToken) -> Result<usize> {
        let state = &*self.state;
        let step = {
            let mut inner = state.inner.lock();
            let current = inner.read_state;
            match current {
                ReadState::Closed => return Err(QuicError::invalid_operation("stream is write-only")),
                ReadState::PendingRead => return Err(QuicError::invalid_operation("a read is already in progress")),
                ReadState::ReadsCompleted => return Ok(0),
                ReadState::Aborted => return Err(QuicError::stream_aborted(inner.read_error_code)),
                ReadState::ConnectionClosed => return Err(state.connection.abort_error()),
                ReadState::IndividualReadComplete => {
                    let length = inner.receive.copy_to(buf);
                    let drained = length == inner.receive.total_length;
                    inner.read_state = if drained && inner.receive.is_final {
                        ReadState::ReadsCompleted
                    } else {
                        ReadState::None
                    };
                    inner.receive.clear();
                    ReadStep::Copied {
                        length,
                        re_enable_receive: !drained,
                    }
                }
                ReadState::None => {
                    if buf.is_empty() {
                        return Ok(0);
                    }
                    let (completer, receiver) = completion();
                    inner.read_state = ReadState::PendingRead;
                    inner.pending_read = Some(PendingRead {
                        capacity: buf.len(),
                        completer,
                    });
                    ReadStep::Wait(receiver)
                }
            }
        };

        let receiver = match step {
            ReadStep::Copied {
                length,
                re_enable_receive,
            } => {
                state.api().stream_receive_complete(state.raw(), length as u64);
                if re_enable_receive {
                    self.enable_receive();
                }
                return Ok(length);
            }
            ReadStep::Wait(receiver) => receiver,
        };

        let guard = CancelOnDrop::new(state, StreamDirection::Read);
        let result = with_cancellation(receive(receiver), cancel, || {
            state.cancel_read();
            QuicError::Canceled
        })
        .await;
        guard.disarm();

        let completion = result?;
        let length = completion.data.len();
        buf[..length].copy_from_slice(&completion.data);
        if completion.re_enable_receive {
            self.enable_receive();
        }
        Ok(length)
    }

    fn enable_receive(&self) {
        let status = self.state.api().stream_receive_set_enabled(self.state.raw(), true);
        if status.is_failure() {
            warn!("{} failed to re-enable receive: {}", self.state.trace_id, status);
        }
    }

    /// Sends `buf`, setting FIN with it when `end_of_message` is true.
    pub async fn write(&self, buf: &[u8], end_of_message: bool, cancel: &CancellationToken) -> Result<()> {
        let state = &*self.state;
        let (receiver, buffers) = {
            let mut inner = state.inner.lock();
            let current = inner.send_state;
            match current {
                SendState::Closed => return Err(QuicError::invalid_operation("stream is read-only")),
                SendState::Aborted => return Err(inner.send_error()),
                SendState::ConnectionClosed => return Err(state.connection.abort_error()),
                SendState::Pending => return Err(QuicError::invalid_operation("a write is already in progress")),
                SendState::Finished => return Err(QuicError::invalid_operation("writes have been completed")),
                SendState::None => {}
            }
            if inner.shutdown_write_state != ShutdownWriteState::None {
                return Err(QuicError::invalid_operation("writes have been completed"));
            }
            if buf.is_empty() && !end_of_message {
                return Ok(());
            }

            let buffers = if buf.is_empty() {
                Vec::new()
            } else {
                vec![Bytes::copy_from_slice(buf)]
            };
            let (completer, receiver) = completion();
            inner.send_state = SendState::Pending;
            inner.send_buffers = buffers.clone();
            inner.pending_write = Some(completer);
            (receiver, buffers)
        };

        let status = state
            .api()
            .stream_send(state.raw(), &buffers, SendFlags { fin: end_of_message });
        if status.is_failure() {
            let mut inner = state.inner.lock();
            inner.pending_write.take();
            inner.send_buffers.clear();
            if inner.send_state == SendState::Pending {
                inner.send_state = SendState::None;
            }
            return Err(QuicError::from(status));
        }

        let guard = CancelOnDrop::new(state, StreamDirection::Write);
        let result = with_cancellation(receive(receiver), cancel, || {
            state.cancel_write();
            QuicError::Canceled
        })
        .await;
        guard.disarm();
        result?;

        if !end_of_message {
            let mut inner = state.inner.lock();
            if inner.send_state == SendState::Finished {
                inner.send_state = SendState::None;
            }
        }
        Ok(())
    }

    /// Nothing is buffered locally; sends are handed to the engine directly.
    pub async fn flush(&self) -> Result<()> {
        Ok(())
    }

    /// Gracefully finishes the send direction and waits until the peer
    /// acknowledged everything.
    pub async fn shutdown_write(&self, cancel: &CancellationToken) -> Result<()> {
        let state = &*self.state;
        let receiver = {
            let mut inner = state.inner.lock();
            let current = inner.send_state;
            match current {
                SendState::Closed => return Err(QuicError::invalid_operation("stream is read-only")),
                SendState::Aborted => return Err(inner.send_error()),
                SendState::ConnectionClosed => return Err(state.connection.abort_error()),
                _ => {}
            }
            let current = inner.shutdown_write_state;
            match current {
                ShutdownWriteState::Finished => return Ok(()),
                ShutdownWriteState::Canceled => return Err(inner.send_error()),
                ShutdownWriteState::ConnectionClosed => return Err(state.connection.abort_error()),
                ShutdownWriteState::None => {}
            }
            if inner.shutdown_write.is_some() {
                return Err(QuicError::invalid_operation("a write shutdown is already in progress"));
            }
            let (completer, receiver) = completion();
            inner.shutdown_write = Some(completer);
            receiver
        };

        let status = state
            .api()
            .stream_shutdown(state.raw(), StreamShutdownFlags::GRACEFUL, 0);
        if status.is_failure() {
            state.inner.lock().shutdown_write.take();
            return Err(QuicError::from(status));
        }

        with_cancellation(receive(receiver), cancel, || {
            let mut inner = state.inner.lock();
            inner.shutdown_write.take();
            if inner.shutdown_write_state == ShutdownWriteState::None {
                inner.shutdown_write_state = ShutdownWriteState::Canceled;
            }
            QuicError::Canceled
        })
        .await
    }

    /// Stops receiving and tells the peer to stop sending with `error_code`.
    pub fn abort_read(&self, error_code: u64) {
        self.abort(StreamDirection::Read, error_code);
    }

    /// Resets the send side with `error_code`.
    pub fn abort_write(&self, error_code: u64) {
        self.abort(StreamDirection::Write, error_code);
    }

    /// Aborts one or both directions. Directions already in a terminal
    /// state are left alone, so repeated calls are harmless.
    pub fn abort(&self, direction: StreamDirection, error_code: u64) {
        let state = &*self.state;
        let (abort_read, pending_read, abort_write, pending_write, shutdown_write) = {
            let mut inner = state.inner.lock();
            let abort_read = direction.includes_read() && inner.read_state < ReadState::ReadsCompleted;
            let pending_read = if abort_read {
                inner.read_state = ReadState::Aborted;
                inner.read_error_code = Some(error_code);
                inner.receive.clear();
                inner.pending_read.take()
            } else {
                None
            };
            let abort_write = direction.includes_write() && inner.send_state < SendState::Aborted;
            let (pending_write, shutdown_write) = if abort_write {
                inner.send_state = SendState::Aborted;
                inner.send_error_code = Some(error_code);
                (inner.pending_write.take(), inner.shutdown_write.take())
            } else {
                (None, None)
            };
            (abort_read, pending_read, abort_write, pending_write, shutdown_write)
        };
        if !abort_read && !abort_write {
            return;
        }
        debug!("{} aborting {:?} with code {}", state.trace_id, direction, error_code);

        let err = QuicError::StreamAborted(error_code);
        complete(pending_read.map(|pending| pending.completer), Err(err.clone()));
        complete(pending_write, Err(err.clone()));
        complete(shutdown_write, Err(err));

        let flags = StreamShutdownFlags {
            abort_send: abort_write,
            abort_receive: abort_read,
            ..StreamShutdownFlags::default()
        };
        state.shutdown_quietly(flags, error_code);
    }

    /// Waits until the engine finished with both directions.
    pub async fn shutdown_completed(&self, cancel: &CancellationToken) -> Result<()> {
        let state = &*self.state;
        {
            let mut inner = state.inner.lock();
            let current = inner.shutdown_state;
            match current {
                ShutdownState::ConnectionClosed => return Err(state.connection.abort_error()),
                ShutdownState::None => inner.shutdown_state = ShutdownState::Pending,
                _ => {}
            }
        }
        with_cancellation(state.shutdown.wait(), cancel, || {
            let mut inner = state.inner.lock();
            if inner.shutdown_state == ShutdownState::Pending {
                inner.shutdown_state = ShutdownState::Canceled;
            }
            QuicError::Canceled
        })
        .await
    }

    /// Finishes the stream: a graceful send shutdown if sending is still
    /// open, an abortive receive shutdown if reading is. Runs on drop.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let state = &*self.state;
        let (graceful, abort_read, pending_read) = {
            let mut inner = state.inner.lock();
            let graceful = inner.send_state < SendState::Aborted
                && inner.shutdown_write_state == ShutdownWriteState::None;
            let abort_read = inner.read_state < ReadState::ReadsCompleted;
            let pending_read = if abort_read {
                inner.read_state = ReadState::Aborted;
                inner.receive.clear();
                inner.pending_read.take()
            } else {
                None
            };
            (graceful, abort_read, pending_read)
        };
        complete(pending_read.map(|pending| pending.completer), Err(QuicError::OperationAborted));

        if graceful {
            state.shutdown_quietly(StreamShutdownFlags::GRACEFUL, 0);
        }
        if abort_read {
            state.shutdown_quietly(StreamShutdownFlags::ABORT_RECEIVE, state.default_error_code);
        }
        if state.arrive(CLEANUP_DISPOSED) {
            state.cleanup();
        }
    }

    /// The stream id, once the engine assigned one.
    pub fn id(&self) -> Option<u64> {
        if let Some(id) = self.state.inner.lock().id {
            return Some(id);
        }
        let id = self
            .state
            .api()
            .get_param(self.state.raw(), Param::StreamId)
            .ok()
            .and_then(|value| value.as_u64())?;
        self.state.inner.lock().id = Some(id);
        Some(id)
    }

    /// Get the stream kind
    pub fn kind(&self) -> StreamKind {
        self.state.kind
    }

    /// Whether the peer opened this stream
    pub fn is_inbound(&self) -> bool {
        self.state.inbound
    }

    /// Whether this side of the stream receives data
    pub fn can_read(&self) -> bool {
        self.state.kind == StreamKind::Bidirectional || self.state.inbound
    }

    /// Whether this side of the stream sends data
    pub fn can_write(&self) -> bool {
        self.state.kind == StreamKind::Bidirectional || !self.state.inbound
    }

    /// Log prefix, `[strm][<handle>]`
    pub fn trace_id(&self) -> &str {
        &self.state.trace_id
    }

    /// Get the raw engine handle
    pub fn raw_handle(&self) -> RawHandle {
        self.state.raw()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("trace_id", &self.state.trace_id)
            .field("kind", &self.state.kind)
            .field("inbound", &self.state.inbound)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::recording::{Call, RecordingEngine};
    use crate::native::Registration;
    use crate::quic::connection::Connection;
    use crate::quic::options::ClientConnectionOptions;
    use std::net::SocketAddr;
    use tokio_test::{assert_pending, assert_ready};

    async fn connected(engine: &Arc<RecordingEngine>) -> Connection {
        let registration = Registration::open(engine.clone(), "test").unwrap();
        let options =
            ClientConnectionOptions::new(SocketAddr::from(([127, 0, 0, 1], 4433)), vec![b"test".to_vec()]);
        Connection::connect_with(&registration, options, &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_buffered_data_is_copied_synchronously() {
        let engine = RecordingEngine::new();
        let connection = connected(&engine).await;
        let stream = connection.open_bidirectional_stream().unwrap();
        let raw = stream.raw_handle();

        assert_eq!(engine.fire_receive(raw, b"hello world", false).0, Status::Pending);

        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf, &CancellationToken::new()).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(
            engine.count(|call| *call == Call::StreamReceiveComplete { stream: raw, length: 5 }),
            1
        );
        assert_eq!(
            engine.count(|call| *call == Call::StreamReceiveSetEnabled { stream: raw, enabled: true }),
            1
        );
    }

    #[tokio::test]
    async fn test_pending_read_is_filled_by_receive_event() {
        let engine = RecordingEngine::new();
        let connection = connected(&engine).await;
        let stream = connection.open_bidirectional_stream().unwrap();
        let raw = stream.raw_handle();
        let cancel = CancellationToken::new();

        let mut buf = [0u8; 16];
        let mut read = tokio_test::task::spawn(stream.read(&mut buf, &cancel));
        assert_pending!(read.poll());

        let (status, consumed) = engine.fire_receive(raw, b"abc", true);
        assert_eq!(status, Status::Success);
        assert_eq!(consumed, 3);
        assert_eq!(assert_ready!(read.poll()), Ok(3));
        drop(read);

        assert_eq!(&buf[..3], b"abc");
        assert_eq!(stream.read(&mut buf, &cancel).await, Ok(0));
    }

    #[tokio::test]
    async fn test_canceled_read_aborts_receive() {
        let engine = RecordingEngine::new();
        let connection = connected(&engine).await;
        let stream = connection.open_bidirectional_stream().unwrap();
        let raw = stream.raw_handle();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf, &cancel).await, Err(QuicError::Canceled));
        assert_eq!(
            engine.count(|call| matches!(
                call,
                Call::StreamShutdown { stream, flags, .. } if *stream == raw && flags.abort_receive
            )),
            1
        );
        // The read side stays aborted without a peer code.
        assert_eq!(
            stream.read(&mut buf, &CancellationToken::new()).await,
            Err(QuicError::OperationAborted)
        );
    }

    #[tokio::test]
    async fn test_write_on_peer_unidirectional_stream_is_invalid() {
        let engine = RecordingEngine::new();
        let connection = connected(&engine).await;
        let raw_connection = connection.state().raw();
        let peer = engine.new_peer_stream(raw_connection, true);
        engine.fire_connection(
            raw_connection,
            crate::native::ConnectionEvent::PeerStreamStarted {
                stream: peer,
                unidirectional: true,
            },
        );

        let stream = connection.accept_inbound_stream(&CancellationToken::new()).await.unwrap();
        assert!(!stream.can_write());
        let err = stream.write(b"x", false, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, QuicError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_repeated_writes_then_fin() {
        let engine = RecordingEngine::new();
        let connection = connected(&engine).await;
        let stream = connection.open_unidirectional_stream().unwrap();
        let cancel = CancellationToken::new();

        stream.write(b"one ", false, &cancel).await.unwrap();
        stream.write(b"two", true, &cancel).await.unwrap();
        assert_eq!(engine.sent_data(stream.raw_handle()), b"one two");

        let err = stream.write(b"three", false, &cancel).await.unwrap_err();
        assert!(matches!(err, QuicError::InvalidOperation(_)));
        assert_eq!(stream.shutdown_write(&cancel).await, Ok(()));
        assert_eq!(stream.id(), Some(2));
    }

    #[tokio::test]
    async fn test_empty_receive_without_fin_keeps_read_waiting() {
        let engine = RecordingEngine::new();
        let connection = connected(&engine).await;
        let stream = connection.open_bidirectional_stream().unwrap();
        let raw = stream.raw_handle();
        let cancel = CancellationToken::new();

        assert_eq!(engine.fire_receive(raw, b"", false), (Status::Success, 0));

        let mut buf = [0u8; 16];
        let mut read = tokio_test::task::spawn(stream.read(&mut buf, &cancel));
        assert_pending!(read.poll());
        assert_eq!(engine.fire_receive(raw, b"", false), (Status::Success, 0));
        assert_pending!(read.poll());

        engine.fire_receive(raw, b"data", true);
        assert_eq!(assert_ready!(read.poll()), Ok(4));
        drop(read);

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf, &cancel).await, Ok(0));
    }

    #[tokio::test]
    async fn test_handler_error_is_reported_as_internal_error() {
        let engine = RecordingEngine::new();
        let connection = connected(&engine).await;
        let stream = connection.open_bidirectional_stream().unwrap();

        // A pending read state with no waiter cannot be served.
        stream.state.inner.lock().read_state = ReadState::PendingRead;
        let (status, _) = engine.fire_receive(stream.raw_handle(), b"lost", false);
        assert_eq!(status, Status::InternalError);
    }
}
