//! WebSocket message engine over an established byte stream
//!
//! One send and one receive may run concurrently; each side is serialized
//! by its own async lock. The close handshake is driven by the application:
//! receiving a Close frame does not send one back.

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{WebSocketError, WebSocketResult};

use super::close::{encode_close_payload, parse_close_payload, CloseStatus};
use super::deflate::{DeflateOptions, Deflater, Inflater};
use super::header::{self, FrameHeader, MessageHeader, MessageInProgress, Opcode, MAX_HEADER_LEN};
use super::mask::apply_mask;
use super::utf8::Utf8Validator;

pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Text,
    Binary,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebSocketState {
    Open,
    CloseSent,
    CloseReceived,
    Closed,
    Aborted,
}

impl fmt::Display for WebSocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WebSocketState::Open => "open",
            WebSocketState::CloseSent => "close-sent",
            WebSocketState::CloseReceived => "close-received",
            WebSocketState::Closed => "closed",
            WebSocketState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendFlags {
    pub end_of_message: bool,
    pub disable_compression: bool,
}

impl SendFlags {
    pub const END_OF_MESSAGE: Self = Self {
        end_of_message: true,
        disable_compression: false,
    };
    pub const FRAGMENT: Self = Self {
        end_of_message: false,
        disable_compression: false,
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResult {
    pub count: usize,
    pub message_type: MessageType,
    pub end_of_message: bool,
    pub close_status: Option<CloseStatus>,
    pub close_status_description: Option<String>,
}

impl ReceiveResult {
    fn data(count: usize, message_type: MessageType, end_of_message: bool) -> Self {
        Self {
            count,
            message_type,
            end_of_message,
            close_status: None,
            close_status_description: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebSocketOptions {
    pub role: Role,
    pub sub_protocol: Option<String>,
    /// Interval for unsolicited Pong frames. `None` disables keep-alive.
    pub keep_alive_interval: Option<Duration>,
    /// How long [`WebSocket::close`] waits for the peer's Close frame.
    pub close_timeout: Duration,
    /// Negotiated permessage-deflate parameters, if any.
    pub deflate: Option<DeflateOptions>,
}

impl WebSocketOptions {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            sub_protocol: None,
            keep_alive_interval: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            deflate: None,
        }
    }

    pub fn with_deflate(mut self, deflate: DeflateOptions) -> Self {
        self.deflate = Some(deflate);
        self
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = Some(interval);
        self
    }
}

struct CloseInfo {
    state: WebSocketState,
    sent_close: bool,
    received_close: bool,
    close_status: Option<CloseStatus>,
    close_description: Option<String>,
}

struct Sender<S> {
    io: WriteHalf<S>,
    deflater: Option<Deflater>,
    buffer: BytesMut,
    in_progress: Option<(MessageType, bool)>,
}

struct Receiver<S> {
    io: ReadHalf<S>,
    buffer: BytesMut,
    header: Option<MessageHeader>,
    in_progress: Option<MessageInProgress>,
    mask_offset: usize,
    inflater: Option<Inflater>,
    inflated: BytesMut,
    utf8: Utf8Validator,
}

struct Shared<S> {
    role: Role,
    sub_protocol: Option<String>,
    close_timeout: Duration,
    deflate_negotiated: bool,
    info: Mutex<CloseInfo>,
    sender: tokio::sync::Mutex<Sender<S>>,
    receiver: tokio::sync::Mutex<Receiver<S>>,
    aborted: CancellationToken,
}

/// Aborts the socket if an I/O operation is dropped before it finished.
struct AbortOnDrop<'a, S> {
    shared: &'a Shared<S>,
    armed: bool,
}

impl<'a, S> AbortOnDrop<'a, S> {
    fn new(shared: &'a Shared<S>) -> Self {
        Self { shared, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<S> Drop for AbortOnDrop<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            debug!("websocket operation dropped mid-flight, aborting");
            self.shared.abort();
        }
    }
}

impl<S> Shared<S> {
    fn state(&self) -> WebSocketState {
        self.info.lock().state
    }

    fn abort(&self) {
        {
            let mut info = self.info.lock();
            if info.state != WebSocketState::Closed {
                info.state = WebSocketState::Aborted;
            }
        }
        self.aborted.cancel();
    }

    fn check_state(&self, allowed: &[WebSocketState], operation: &str) -> WebSocketResult<()> {
        let state = self.state();
        if allowed.contains(&state) {
            return Ok(());
        }
        if state == WebSocketState::Aborted {
            return Err(WebSocketError::Aborted);
        }
        Err(WebSocketError::InvalidState(format!("{} not allowed while {}", operation, state)))
    }
}

impl<S: AsyncWrite> Sender<S> {
    async fn write_frame(
        &mut self,
        role: Role,
        aborted: &CancellationToken,
        opcode: Opcode,
        fin: bool,
        compressed: bool,
        payload: &[u8],
    ) -> WebSocketResult<()> {
        let mask = match role {
            Role::Client => Some(rand::random::<[u8; 4]>()),
            Role::Server => None,
        };
        self.buffer.clear();
        self.buffer.reserve(MAX_HEADER_LEN + payload.len());
        header::encode(&mut self.buffer, opcode, fin, compressed, payload.len(), mask);
        let start = self.buffer.len();
        self.buffer.extend_from_slice(payload);
        if let Some(mask) = mask {
            apply_mask(&mut self.buffer[start..], mask, 0);
        }

        trace!("sending {:?} frame fin={} len={}", opcode, fin, payload.len());
        let io = &mut self.io;
        let buffer = &self.buffer;
        tokio::select! {
            biased;
            _ = aborted.cancelled() => Err(WebSocketError::Aborted),
            written = async {
                io.write_all(buffer).await?;
                io.flush().await
            } => written.map_err(WebSocketError::from),
        }
    }
}

impl<S: AsyncRead> Receiver<S> {
    /// Reads from the transport until at least `needed` bytes are buffered.
    async fn fill(&mut self, needed: usize, aborted: &CancellationToken) -> WebSocketResult<()> {
        while self.buffer.len() < needed {
            self.buffer.reserve(READ_CHUNK);
            let io = &mut self.io;
            let buffer = &mut self.buffer;
            let read = tokio::select! {
                biased;
                _ = aborted.cancelled() => return Err(WebSocketError::Aborted),
                read = io.read_buf(buffer) => read?,
            };
            if read == 0 {
                return Err(WebSocketError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed before the close handshake",
                )));
            }
        }
        Ok(())
    }

    async fn read_frame_header(&mut self, aborted: &CancellationToken) -> WebSocketResult<FrameHeader> {
        self.fill(2, aborted).await?;
        let needed = header::header_len([self.buffer[0], self.buffer[1]]);
        self.fill(needed, aborted).await?;
        match FrameHeader::decode(&self.buffer)? {
            Some((frame, consumed)) => {
                self.buffer.advance(consumed);
                self.mask_offset = 0;
                Ok(frame)
            }
            None => Err(WebSocketError::InvalidState("incomplete frame header".into())),
        }
    }

    /// Takes up to `max` unmasked payload bytes of the current frame.
    async fn take_payload(
        &mut self,
        header: &mut MessageHeader,
        max: usize,
        aborted: &CancellationToken,
    ) -> WebSocketResult<BytesMut> {
        let wanted = (header.payload_length.min(max as u64)) as usize;
        if wanted == 0 {
            return Ok(BytesMut::new());
        }
        if self.buffer.is_empty() {
            self.fill(1, aborted).await?;
        }
        let mut chunk = self.buffer.split_to(wanted.min(self.buffer.len()));
        if let Some(mask) = header.mask {
            self.mask_offset = apply_mask(&mut chunk, mask, self.mask_offset);
        }
        header.payload_length -= chunk.len() as u64;
        Ok(chunk)
    }

    async fn read_control_payload(
        &mut self,
        header: &mut MessageHeader,
        aborted: &CancellationToken,
    ) -> WebSocketResult<BytesMut> {
        let len = header.payload_length as usize;
        self.fill(len, aborted).await?;
        self.take_payload(header, len, aborted).await
    }
}

/// A WebSocket over an established, already upgraded byte stream.
pub struct WebSocket<S> {
    shared: Arc<Shared<S>>,
    keep_alive: Option<JoinHandle<()>>,
}

impl<S> WebSocket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps `stream`. Starts the keep-alive task when an interval is set,
    /// which requires a Tokio runtime.
    pub fn new(stream: S, options: WebSocketOptions) -> WebSocketResult<Self> {
        if let Some(deflate) = &options.deflate {
            deflate.validate()?;
        }
        let (deflater, inflater) = match (&options.deflate, options.role) {
            (None, _) => (None, None),
            (Some(d), Role::Client) => (
                Some(Deflater::new(d.client_max_window_bits, d.client_context_takeover)),
                Some(Inflater::new(d.server_max_window_bits, d.server_context_takeover)),
            ),
            (Some(d), Role::Server) => (
                Some(Deflater::new(d.server_max_window_bits, d.server_context_takeover)),
                Some(Inflater::new(d.client_max_window_bits, d.client_context_takeover)),
            ),
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            role: options.role,
            sub_protocol: options.sub_protocol.clone(),
            close_timeout: options.close_timeout,
            deflate_negotiated: options.deflate.is_some(),
            info: Mutex::new(CloseInfo {
                state: WebSocketState::Open,
                sent_close: false,
                received_close: false,
                close_status: None,
                close_description: None,
            }),
            sender: tokio::sync::Mutex::new(Sender {
                io: write_half,
                deflater,
                buffer: BytesMut::new(),
                in_progress: None,
            }),
            receiver: tokio::sync::Mutex::new(Receiver {
                io: read_half,
                buffer: BytesMut::with_capacity(READ_CHUNK),
                header: None,
                in_progress: None,
                mask_offset: 0,
                inflater,
                inflated: BytesMut::new(),
                utf8: Utf8Validator::new(),
            }),
            aborted: CancellationToken::new(),
        });

        let keep_alive = options
            .keep_alive_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| tokio::spawn(keep_alive(Arc::downgrade(&shared), interval)));

        debug!("websocket opened as {:?}", options.role);
        Ok(Self { shared, keep_alive })
    }

    /// Sends a data message or one fragment of it.
    pub async fn send(&self, buf: &[u8], message_type: MessageType, flags: SendFlags) -> WebSocketResult<()> {
        if message_type == MessageType::Close {
            return Err(WebSocketError::InvalidOperation(
                "close frames are sent with close or close_output".into(),
            ));
        }
        let shared = &*self.shared;
        shared.check_state(&[WebSocketState::Open, WebSocketState::CloseReceived], "send")?;

        let mut sender = shared.sender.lock().await;
        let (opcode, compressed, first) = match sender.in_progress {
            Some((current, _)) if current != message_type => {
                return Err(WebSocketError::InvalidOperation(
                    "message type changed before the previous message ended".into(),
                ));
            }
            Some((_, compressed)) => (Opcode::Continuation, compressed, false),
            None => {
                let opcode = match message_type {
                    MessageType::Text => Opcode::Text,
                    _ => Opcode::Binary,
                };
                (opcode, sender.deflater.is_some() && !flags.disable_compression, true)
            }
        };

        let compressed_payload;
        let payload = if compressed {
            let Some(deflater) = sender.deflater.as_mut() else {
                return Err(WebSocketError::InvalidState("deflate not negotiated".into()));
            };
            compressed_payload = deflater.deflate(buf, flags.end_of_message)?;
            &compressed_payload[..]
        } else {
            buf
        };

        let guard = AbortOnDrop::new(shared);
        let written = sender
            .write_frame(
                shared.role,
                &shared.aborted,
                opcode,
                flags.end_of_message,
                compressed && first,
                payload,
            )
            .await;
        guard.disarm();
        if let Err(err) = written {
            shared.abort();
            return Err(err);
        }

        sender.in_progress = if flags.end_of_message {
            None
        } else {
            Some((message_type, compressed))
        };
        Ok(())
    }

    /// Receives the next chunk of a message into `buf`.
    ///
    /// Pings are answered and Pongs skipped transparently. A received Close
    /// frame is reported with [`MessageType::Close`] and its status.
    pub async fn receive(&self, buf: &mut [u8]) -> WebSocketResult<ReceiveResult> {
        let shared = &*self.shared;
        shared.check_state(&[WebSocketState::Open, WebSocketState::CloseSent], "receive")?;

        let mut receiver = shared.receiver.lock().await;
        let guard = AbortOnDrop::new(shared);
        let result = self.receive_locked(&mut receiver, buf).await;
        guard.disarm();

        match result {
            Ok(result) => {
                if result.message_type == MessageType::Close && shared.state() == WebSocketState::Closed {
                    shutdown_transport(&mut *shared.sender.lock().await).await;
                }
                Ok(result)
            }
            Err(WebSocketError::Protocol { status, message }) => {
                warn!("websocket protocol violation ({}): {}", status, message);
                self.fail(status).await;
                Err(WebSocketError::Protocol { status, message })
            }
            Err(err) => {
                shared.abort();
                Err(err)
            }
        }
    }

    async fn receive_locked(&self, receiver: &mut Receiver<S>, buf: &mut [u8]) -> WebSocketResult<ReceiveResult> {
        let shared = &*self.shared;
        let aborted = &shared.aborted;
        loop {
            let mut header = match receiver.header {
                Some(header) => header,
                None => {
                    let frame = receiver.read_frame_header(aborted).await?;
                    let mut header = MessageHeader::validate(
                        frame,
                        shared.role == Role::Server,
                        shared.deflate_negotiated,
                        receiver.in_progress,
                    )?;
                    trace!(
                        "received {:?} frame fin={} len={}",
                        header.opcode,
                        header.fin,
                        header.payload_length
                    );

                    if header.opcode.is_control() {
                        let payload = receiver.read_control_payload(&mut header, aborted).await?;
                        match header.opcode {
                            Opcode::Ping => {
                                self.send_control(Opcode::Pong, &payload).await?;
                                continue;
                            }
                            Opcode::Pong => continue,
                            _ => return self.on_close_received(&payload),
                        }
                    }
                    header
                }
            };

            let (count, frame_done) = if header.compressed {
                while receiver.inflated.is_empty() && !header.processed {
                    let chunk = receiver.take_payload(&mut header, READ_CHUNK, aborted).await?;
                    let last = header.payload_length == 0;
                    let Some(inflater) = receiver.inflater.as_mut() else {
                        return Err(WebSocketError::InvalidState("deflate not negotiated".into()));
                    };
                    let mut output = Vec::new();
                    inflater.inflate(&chunk, last && header.fin, &mut output)?;
                    receiver.inflated.extend_from_slice(&output);
                    header.processed = last;
                }
                let count = buf.len().min(receiver.inflated.len());
                buf[..count].copy_from_slice(&receiver.inflated[..count]);
                receiver.inflated.advance(count);
                (count, header.processed && receiver.inflated.is_empty())
            } else {
                let chunk = receiver.take_payload(&mut header, buf.len(), aborted).await?;
                buf[..chunk.len()].copy_from_slice(&chunk);
                (chunk.len(), header.payload_length == 0)
            };

            let end_of_message = frame_done && header.fin;
            if header.opcode == Opcode::Text && !receiver.utf8.validate(&buf[..count], end_of_message) {
                return Err(WebSocketError::protocol(
                    CloseStatus::INVALID_PAYLOAD_DATA,
                    "text message is not valid UTF-8",
                ));
            }

            if frame_done {
                receiver.header = None;
                receiver.in_progress = if header.fin {
                    None
                } else {
                    Some(MessageInProgress {
                        opcode: header.opcode,
                        compressed: header.compressed,
                    })
                };
            } else {
                receiver.header = Some(header);
            }

            if count == 0 && frame_done && !end_of_message && !buf.is_empty() {
                continue;
            }
            let message_type = if header.opcode == Opcode::Text {
                MessageType::Text
            } else {
                MessageType::Binary
            };
            return Ok(ReceiveResult::data(count, message_type, end_of_message));
        }
    }

    fn on_close_received(&self, payload: &[u8]) -> WebSocketResult<ReceiveResult> {
        let (status, description) = parse_close_payload(payload)?;
        let state = {
            let mut info = self.shared.info.lock();
            info.received_close = true;
            info.close_status = Some(status);
            info.close_description = Some(description.clone());
            info.state = match info.state {
                WebSocketState::CloseSent => WebSocketState::Closed,
                WebSocketState::Open => WebSocketState::CloseReceived,
                other => other,
            };
            info.state
        };
        debug!("websocket received close {} '{}', now {}", status, description, state);
        Ok(ReceiveResult {
            count: 0,
            message_type: MessageType::Close,
            end_of_message: true,
            close_status: Some(status),
            close_status_description: Some(description),
        })
    }

    async fn send_control(&self, opcode: Opcode, payload: &[u8]) -> WebSocketResult<()> {
        let shared = &*self.shared;
        send_control(shared, opcode, payload).await
    }

    /// Best-effort Close carrying `status`, then abort.
    async fn fail(&self, status: CloseStatus) {
        let sent_close = self.shared.info.lock().sent_close;
        if !sent_close {
            if let Err(err) = self.send_close_frame(status, "").await {
                debug!("failed to send close {} after protocol error: {}", status, err);
            }
        }
        self.shared.abort();
    }

    async fn send_close_frame(&self, status: CloseStatus, description: &str) -> WebSocketResult<()> {
        let payload = encode_close_payload(status, description)?;
        let shared = &*self.shared;
        let mut sender = shared.sender.lock().await;
        if shared.info.lock().sent_close {
            return Ok(());
        }

        let guard = AbortOnDrop::new(shared);
        let written = sender
            .write_frame(shared.role, &shared.aborted, Opcode::Close, true, false, &payload)
            .await;
        guard.disarm();
        written?;

        let state = {
            let mut info = shared.info.lock();
            info.sent_close = true;
            info.state = match info.state {
                WebSocketState::CloseReceived => WebSocketState::Closed,
                WebSocketState::Open => WebSocketState::CloseSent,
                other => other,
            };
            info.state
        };
        debug!("websocket sent close {}, now {}", status, state);
        if state == WebSocketState::Closed {
            shutdown_transport(&mut sender).await;
        }
        Ok(())
    }

    /// Sends a Close frame without waiting for the peer's.
    pub async fn close_output(&self, status: CloseStatus, description: &str) -> WebSocketResult<()> {
        self.shared.check_state(
            &[WebSocketState::Open, WebSocketState::CloseReceived, WebSocketState::CloseSent],
            "close_output",
        )?;
        self.send_close_frame(status, description).await
    }

    /// Sends a Close frame and waits for the peer's, discarding data that
    /// arrives first. Aborts the socket if the peer does not answer within
    /// the close timeout.
    pub async fn close(&self, status: CloseStatus, description: &str) -> WebSocketResult<()> {
        self.close_output(status, description).await?;
        if self.shared.info.lock().received_close {
            return Ok(());
        }

        let drain = async {
            let mut scratch = vec![0u8; 1024];
            loop {
                let result = self.receive(&mut scratch).await?;
                if result.message_type == MessageType::Close {
                    return Ok::<(), WebSocketError>(());
                }
            }
        };
        match tokio::time::timeout(self.shared.close_timeout, drain).await {
            Ok(result) => result,
            Err(_) => {
                warn!("websocket peer did not answer close within {:?}", self.shared.close_timeout);
                self.shared.abort();
                Err(WebSocketError::CloseTimeout)
            }
        }
    }

    /// Moves to `Aborted` and fails pending operations. A closed socket
    /// stays closed.
    pub fn abort(&self) {
        self.shared.abort();
    }

    pub fn state(&self) -> WebSocketState {
        self.shared.state()
    }

    pub fn close_status(&self) -> Option<CloseStatus> {
        self.shared.info.lock().close_status
    }

    pub fn close_status_description(&self) -> Option<String> {
        self.shared.info.lock().close_description.clone()
    }

    pub fn sub_protocol(&self) -> Option<&str> {
        self.shared.sub_protocol.as_deref()
    }
}

/// Closes the write side once both Close frames have crossed.
async fn shutdown_transport<S: AsyncWrite>(sender: &mut Sender<S>) {
    if let Err(err) = sender.io.shutdown().await {
        trace!("websocket transport shutdown failed: {}", err);
    }
}

async fn send_control<S: AsyncWrite>(shared: &Shared<S>, opcode: Opcode, payload: &[u8]) -> WebSocketResult<()> {
    let mut sender = shared.sender.lock().await;
    let guard = AbortOnDrop::new(shared);
    let written = sender
        .write_frame(shared.role, &shared.aborted, opcode, true, false, payload)
        .await;
    guard.disarm();
    written
}

/// Sends an unsolicited Pong every `interval` until the socket is gone or
/// can no longer send.
async fn keep_alive<S: AsyncWrite>(shared: Weak<Shared<S>>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !matches!(shared.state(), WebSocketState::Open | WebSocketState::CloseReceived) {
            return;
        }
        if let Err(err) = send_control(&shared, Opcode::Pong, &[]).await {
            trace!("keep-alive pong failed: {}", err);
        }
    }
}

impl<S> Drop for WebSocket<S> {
    fn drop(&mut self) {
        if let Some(task) = self.keep_alive.take() {
            task.abort();
        }
    }
}

impl<S> fmt::Debug for WebSocket<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocket")
            .field("role", &self.shared.role)
            .field("state", &self.shared.state())
            .field("sub_protocol", &self.shared.sub_protocol)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, DuplexStream};

    fn pair() -> (WebSocket<DuplexStream>, WebSocket<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        (
            WebSocket::new(a, WebSocketOptions::new(Role::Client)).unwrap(),
            WebSocket::new(b, WebSocketOptions::new(Role::Server)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_fragmented_text_message() {
        let (client, server) = pair();
        client.send(b"Hello, ", MessageType::Text, SendFlags::FRAGMENT).await.unwrap();
        client.send(b"world", MessageType::Text, SendFlags::END_OF_MESSAGE).await.unwrap();

        let mut buf = [0u8; 64];
        let first = server.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..first.count], b"Hello, ");
        assert!(!first.end_of_message);
        let second = server.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..second.count], b"world");
        assert!(second.end_of_message);
        assert_eq!(second.message_type, MessageType::Text);
    }

    #[tokio::test]
    async fn test_message_type_change_mid_message_rejected() {
        let (client, _server) = pair();
        client.send(b"a", MessageType::Text, SendFlags::FRAGMENT).await.unwrap();
        let err = client.send(b"b", MessageType::Binary, SendFlags::END_OF_MESSAGE).await.unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_small_buffer_reads_in_pieces() {
        let (client, server) = pair();
        client.send(b"0123456789", MessageType::Binary, SendFlags::END_OF_MESSAGE).await.unwrap();

        let mut buf = [0u8; 4];
        let mut received = Vec::new();
        loop {
            let result = server.receive(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..result.count]);
            if result.end_of_message {
                break;
            }
        }
        assert_eq!(received, b"0123456789");
    }

    #[tokio::test]
    async fn test_compressed_messages() {
        let (a, b) = duplex(64 * 1024);
        let deflate = DeflateOptions {
            client_max_window_bits: 10,
            ..Default::default()
        };
        let client = WebSocket::new(a, WebSocketOptions::new(Role::Client).with_deflate(deflate)).unwrap();
        let server = WebSocket::new(b, WebSocketOptions::new(Role::Server).with_deflate(deflate)).unwrap();

        let text = "compress me ".repeat(200);
        for _ in 0..2 {
            client.send(text.as_bytes(), MessageType::Text, SendFlags::END_OF_MESSAGE).await.unwrap();
            let mut buf = vec![0u8; text.len()];
            let mut filled = 0;
            loop {
                let result = server.receive(&mut buf[filled..]).await.unwrap();
                filled += result.count;
                if result.end_of_message {
                    break;
                }
            }
            assert_eq!(&buf[..filled], text.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let (a, mut raw) = duplex(1024);
        let server = WebSocket::new(a, WebSocketOptions::new(Role::Server)).unwrap();

        // Masked ping "hi" with an all-zero key.
        raw.write_all(&[0x89, 0x82, 0, 0, 0, 0, b'h', b'i']).await.unwrap();
        raw.write_all(&[0x82, 0x81, 0, 0, 0, 0, 7]).await.unwrap();

        let mut buf = [0u8; 8];
        let result = server.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..result.count], &[7]);

        let mut pong = [0u8; 4];
        raw.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8a, 0x02, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_invalid_utf8_fails_with_invalid_payload() {
        let (a, mut raw) = duplex(1024);
        let server = WebSocket::new(a, WebSocketOptions::new(Role::Server)).unwrap();
        raw.write_all(&[0x81, 0x82, 0, 0, 0, 0, 0xc0, 0x80]).await.unwrap();

        let mut buf = [0u8; 8];
        let err = server.receive(&mut buf).await.unwrap_err();
        assert!(matches!(
            err,
            WebSocketError::Protocol {
                status: CloseStatus::INVALID_PAYLOAD_DATA,
                ..
            }
        ));
        assert_eq!(server.state(), WebSocketState::Aborted);

        let mut close = [0u8; 4];
        raw.read_exact(&mut close).await.unwrap();
        assert_eq!(close, [0x88, 0x02, 0x03, 0xef]);
    }

    #[tokio::test]
    async fn test_keep_alive_sends_pongs() {
        let (a, mut raw) = duplex(1024);
        let _server = WebSocket::new(
            a,
            WebSocketOptions::new(Role::Server).with_keep_alive(Duration::from_millis(10)),
        )
        .unwrap();

        let mut pong = [0u8; 2];
        raw.read_exact(&mut pong).await.unwrap();
        assert_eq!(pong, [0x8a, 0x00]);
    }

    #[tokio::test]
    async fn test_send_after_abort_fails() {
        let (client, _server) = pair();
        client.abort();
        assert_eq!(client.state(), WebSocketState::Aborted);
        let err = client.send(b"x", MessageType::Binary, SendFlags::END_OF_MESSAGE).await.unwrap_err();
        assert!(matches!(err, WebSocketError::Aborted));
    }
}
