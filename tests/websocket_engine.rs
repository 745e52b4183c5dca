use gsock::prelude::*;
use gsock::websocket::header::{self, Opcode};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

fn pair(deflate: Option<DeflateOptions>) -> (WebSocket<DuplexStream>, WebSocket<DuplexStream>) {
    let (a, b) = duplex(256 * 1024);
    let mut client = WebSocketOptions::new(Role::Client);
    let mut server = WebSocketOptions::new(Role::Server);
    client.deflate = deflate;
    server.deflate = deflate;
    (
        WebSocket::new(a, client).unwrap(),
        WebSocket::new(b, server).unwrap(),
    )
}

async fn receive_all(socket: &WebSocket<DuplexStream>, chunk: usize) -> (Vec<u8>, ReceiveResult) {
    let mut buf = vec![0u8; chunk];
    let mut data = Vec::new();
    loop {
        let result = socket.receive(&mut buf).await.unwrap();
        data.extend_from_slice(&buf[..result.count]);
        if result.end_of_message {
            return (data, result);
        }
    }
}

#[tokio::test]
async fn test_text_round_trip_without_compression() {
    let (client, server) = pair(None);
    let text = "Grüße über WebSocket ".repeat(50);

    client
        .send(text.as_bytes(), MessageType::Text, SendFlags::END_OF_MESSAGE)
        .await
        .unwrap();
    let (received, last) = receive_all(&server, 97).await;
    assert_eq!(received, text.as_bytes());
    assert!(last.end_of_message);
    assert_eq!(last.message_type, MessageType::Text);

    server
        .send(&received, MessageType::Text, SendFlags::END_OF_MESSAGE)
        .await
        .unwrap();
    let (echoed, _) = receive_all(&client, 4096).await;
    assert_eq!(echoed, text.as_bytes());
}

#[tokio::test]
async fn test_fragmented_binary_round_trip_with_compression() {
    let (client, server) = pair(Some(DeflateOptions::default()));
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

    let (head, tail) = payload.split_at(7_000);
    client.send(head, MessageType::Binary, SendFlags::FRAGMENT).await.unwrap();
    client
        .send(tail, MessageType::Binary, SendFlags::END_OF_MESSAGE)
        .await
        .unwrap();

    let (received, last) = receive_all(&server, 1500).await;
    assert_eq!(received, payload);
    assert_eq!(last.message_type, MessageType::Binary);
}

#[tokio::test]
async fn test_reserved_bits_fail_with_protocol_close() {
    let (io, mut peer) = duplex(1024);
    let server = WebSocket::new(io, WebSocketOptions::new(Role::Server)).unwrap();

    // Masked text frame with RSV2 set.
    peer.write_all(&[0xa1, 0x81, 0, 0, 0, 0, b'x']).await.unwrap();

    let mut buf = [0u8; 8];
    let err = server.receive(&mut buf).await.unwrap_err();
    assert!(matches!(
        err,
        WebSocketError::Protocol {
            status: CloseStatus::PROTOCOL_ERROR,
            ..
        }
    ));
    assert_eq!(server.state(), WebSocketState::Aborted);

    let mut close = [0u8; 4];
    peer.read_exact(&mut close).await.unwrap();
    assert_eq!(close, [0x88, 0x02, 0x03, 0xea]);
}

#[tokio::test]
async fn test_close_handshake_reaches_closed() {
    let (client, server) = pair(None);

    client.close_output(CloseStatus::NORMAL_CLOSURE, "").await.unwrap();
    assert_eq!(client.state(), WebSocketState::CloseSent);

    let mut buf = [0u8; 16];
    let result = server.receive(&mut buf).await.unwrap();
    assert_eq!(result.message_type, MessageType::Close);
    assert_eq!(result.close_status, Some(CloseStatus::NORMAL_CLOSURE));
    assert_eq!(server.state(), WebSocketState::CloseReceived);

    server
        .close_output(CloseStatus::NORMAL_CLOSURE, "bye")
        .await
        .unwrap();
    assert_eq!(server.state(), WebSocketState::Closed);

    let result = client.receive(&mut buf).await.unwrap();
    assert_eq!(result.message_type, MessageType::Close);
    assert_eq!(result.close_status_description.as_deref(), Some("bye"));
    assert_eq!(client.state(), WebSocketState::Closed);
    assert_eq!(client.close_status(), Some(CloseStatus::NORMAL_CLOSURE));
}

#[tokio::test]
async fn test_close_waits_for_peer_and_discards_data() {
    let (client, server) = pair(None);

    let peer = async {
        server
            .send(b"late data", MessageType::Binary, SendFlags::END_OF_MESSAGE)
            .await
            .unwrap();
        let (_, result) = receive_all(&server, 64).await;
        assert_eq!(result.message_type, MessageType::Close);
        server.close_output(CloseStatus::NORMAL_CLOSURE, "").await.unwrap();
    };
    let (closed, ()) = tokio::join!(client.close(CloseStatus::NORMAL_CLOSURE, "done"), peer);
    closed.unwrap();
    assert_eq!(client.state(), WebSocketState::Closed);
}

#[tokio::test]
async fn test_close_times_out_and_aborts() {
    let (io, mut peer) = duplex(1024);
    let mut options = WebSocketOptions::new(Role::Client);
    options.close_timeout = Duration::from_millis(50);
    let client = WebSocket::new(io, options).unwrap();

    let err = client
        .close(CloseStatus::NORMAL_CLOSURE, "")
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::CloseTimeout));
    assert_eq!(client.state(), WebSocketState::Aborted);

    // The Close frame still went out before the wait began.
    let mut first = [0u8; 2];
    peer.read_exact(&mut first).await.unwrap();
    assert_eq!(first[0], 0x88);
    assert_eq!(first[1], 0x80 | 2);
}

#[tokio::test]
async fn test_invalid_close_arguments_rejected() {
    let (client, _server) = pair(None);
    let err = client.close_output(CloseStatus::EMPTY, "").await.unwrap_err();
    assert!(matches!(err, WebSocketError::InvalidOperation(_)));

    let reason = "r".repeat(124);
    let err = client
        .close_output(CloseStatus::NORMAL_CLOSURE, &reason)
        .await
        .unwrap_err();
    assert!(matches!(err, WebSocketError::InvalidOperation(_)));
    assert_eq!(client.state(), WebSocketState::Open);
}

#[tokio::test]
async fn test_unmasked_client_frame_rejected_by_server() {
    let (io, mut peer) = duplex(1024);
    let server = WebSocket::new(io, WebSocketOptions::new(Role::Server)).unwrap();

    let mut frame = bytes::BytesMut::new();
    header::encode(&mut frame, Opcode::Binary, true, false, 1, None);
    frame.extend_from_slice(&[1]);
    peer.write_all(&frame).await.unwrap();

    let mut buf = [0u8; 4];
    assert!(matches!(
        server.receive(&mut buf).await,
        Err(WebSocketError::Protocol { .. })
    ));
    assert_eq!(server.state(), WebSocketState::Aborted);
}

#[tokio::test]
async fn test_peer_disconnect_aborts() {
    let (io, peer) = duplex(1024);
    let server = WebSocket::new(io, WebSocketOptions::new(Role::Server)).unwrap();
    drop(peer);

    let mut buf = [0u8; 4];
    assert!(matches!(server.receive(&mut buf).await, Err(WebSocketError::Io(_))));
    assert_eq!(server.state(), WebSocketState::Aborted);
}
