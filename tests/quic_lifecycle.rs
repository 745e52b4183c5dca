use gsock::native::recording::{Call, RecordingEngine};
use gsock::native::{ConnectionEvent, Registration, Status, StreamEvent};
use gsock::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready};

fn options() -> ClientConnectionOptions {
    ClientConnectionOptions::new(SocketAddr::from(([127, 0, 0, 1], 4433)), vec![b"gsock".to_vec()])
}

async fn connected(engine: &Arc<RecordingEngine>) -> Connection {
    let registration = Registration::open(engine.clone(), "lifecycle").unwrap();
    Connection::connect_with(&registration, options(), &CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_end_of_stream_is_sticky() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    let stream = connection.open_bidirectional_stream().unwrap();
    let cancel = CancellationToken::new();

    engine.fire_receive(stream.raw_handle(), b"last", true);

    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf, &cancel).await, Ok(4));
    for _ in 0..3 {
        let read = tokio::time::timeout(Duration::from_millis(100), stream.read(&mut buf, &cancel)).await;
        assert_eq!(read, Ok(Ok(0)));
    }
}

#[tokio::test]
async fn test_second_concurrent_read_is_rejected() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    let stream = connection.open_bidirectional_stream().unwrap();
    let cancel = CancellationToken::new();

    let mut first_buf = [0u8; 8];
    let mut first = tokio_test::task::spawn(stream.read(&mut first_buf, &cancel));
    assert_pending!(first.poll());

    let mut second_buf = [0u8; 8];
    let err = stream.read(&mut second_buf, &cancel).await.unwrap_err();
    assert!(matches!(err, QuicError::InvalidOperation(_)));

    // The first read is unaffected.
    engine.fire_receive(stream.raw_handle(), b"ok", false);
    assert_eq!(assert_ready!(first.poll()), Ok(2));
}

#[tokio::test]
async fn test_close_twice_shuts_down_once() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    let cancel = CancellationToken::new();

    connection.close(7, &cancel).await.unwrap();
    connection.close(7, &cancel).await.unwrap();
    drop(connection);

    assert_eq!(
        engine.count(|call| matches!(call, Call::ConnectionShutdown { .. })),
        1
    );
    assert_eq!(engine.count(|call| matches!(call, Call::ConnectionClose(_))), 1);
}

fn shutdown_complete() -> StreamEvent {
    StreamEvent::ShutdownComplete {
        connection_shutdown: false,
        app_close_in_progress: false,
    }
}

#[tokio::test]
async fn test_stream_released_once_when_disposed_first() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    engine.script(|script| script.complete_shutdowns = false);

    let stream = connection.open_bidirectional_stream().unwrap();
    let raw = stream.raw_handle();
    stream.dispose();
    assert_eq!(engine.count(|call| *call == Call::StreamClose(raw)), 0);

    engine.fire_stream(raw, shutdown_complete());
    drop(stream);
    engine.fire_stream(raw, shutdown_complete());
    assert_eq!(engine.count(|call| *call == Call::StreamClose(raw)), 1);
}

#[tokio::test]
async fn test_stream_released_once_when_shutdown_event_first() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    engine.script(|script| script.complete_shutdowns = false);

    let stream = connection.open_bidirectional_stream().unwrap();
    let raw = stream.raw_handle();
    engine.fire_stream(raw, shutdown_complete());
    assert_eq!(engine.count(|call| *call == Call::StreamClose(raw)), 0);

    stream.dispose();
    drop(stream);
    assert_eq!(engine.count(|call| *call == Call::StreamClose(raw)), 1);
}

#[tokio::test]
async fn test_stream_release_races_from_two_threads() {
    for _ in 0..50 {
        let engine = RecordingEngine::new();
        let connection = connected(&engine).await;
        engine.script(|script| script.complete_shutdowns = false);

        let stream = connection.open_bidirectional_stream().unwrap();
        let raw = stream.raw_handle();
        let firing = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                engine.fire_stream(raw, shutdown_complete());
            })
        };
        let disposing = std::thread::spawn(move || drop(stream));
        firing.join().unwrap();
        disposing.join().unwrap();

        assert_eq!(engine.count(|call| *call == Call::StreamClose(raw)), 1);
    }
}

#[tokio::test]
async fn test_unreachable_host_fails_connect_immediately() {
    let engine = RecordingEngine::new();
    engine.script(|script| script.connection_start_status = Status::Unreachable);
    let registration = Registration::open(engine.clone(), "lifecycle").unwrap();
    let connection = Connection::new_outbound(&registration, options()).unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        connection.connect(None, &CancellationToken::new()),
    )
    .await
    .expect("connect must not wait for an event");
    assert_eq!(result, Err(QuicError::HostUnreachable));
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_peer_streams_accepted_in_arrival_order() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    let raw_connection = engine.last_connection().unwrap();

    let first = engine.new_peer_stream(raw_connection, false);
    let second = engine.new_peer_stream(raw_connection, false);
    for stream in [first, second] {
        let status = engine.fire_connection(
            raw_connection,
            ConnectionEvent::PeerStreamStarted {
                stream,
                unidirectional: false,
            },
        );
        assert_eq!(status, Status::Success);
    }

    let cancel = CancellationToken::new();
    let a = connection.accept_inbound_stream(&cancel).await.unwrap();
    let b = connection.accept_inbound_stream(&cancel).await.unwrap();
    assert_eq!(a.raw_handle(), first);
    assert_eq!(b.raw_handle(), second);
    assert!(a.is_inbound() && b.is_inbound());
}

#[tokio::test]
async fn test_write_after_abort_write_reports_code() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    let stream = connection.open_bidirectional_stream().unwrap();
    let raw = stream.raw_handle();

    stream.abort_write(42);
    let err = stream
        .write(b"late", false, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err, QuicError::StreamAborted(42));
    assert_eq!(
        engine.count(|call| matches!(
            call,
            Call::StreamShutdown { stream, flags, error_code: 42 } if *stream == raw && flags.abort_send
        )),
        1
    );
}

#[tokio::test]
async fn test_connection_abort_fails_pending_read() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    let stream = connection.open_bidirectional_stream().unwrap();
    let raw_connection = engine.last_connection().unwrap();
    let cancel = CancellationToken::new();

    let mut buf = [0u8; 8];
    let mut read = tokio_test::task::spawn(stream.read(&mut buf, &cancel));
    assert_pending!(read.poll());

    engine.fire_connection(raw_connection, ConnectionEvent::ShutdownInitiatedByPeer { error_code: 9 });
    engine.fire_connection(
        raw_connection,
        ConnectionEvent::ShutdownComplete {
            handshake_completed: true,
            peer_acknowledged_shutdown: true,
            app_close_in_progress: false,
        },
    );
    engine.fire_stream(
        stream.raw_handle(),
        StreamEvent::ShutdownComplete {
            connection_shutdown: true,
            app_close_in_progress: false,
        },
    );
    assert_eq!(assert_ready!(read.poll()), Err(QuicError::ConnectionAborted(9)));
}

#[tokio::test]
async fn test_wait_for_streams_returns_with_credit() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;

    let wait = tokio::time::timeout(
        Duration::from_secs(1),
        connection.wait_for_available_streams(StreamKind::Bidirectional, &CancellationToken::new()),
    )
    .await;
    assert_eq!(wait, Ok(Ok(())));
}

#[tokio::test]
async fn test_wait_for_streams_wakes_on_streams_available() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    let raw_connection = engine.last_connection().unwrap();
    engine.script(|script| script.unidirectional_credit = 0);
    let cancel = CancellationToken::new();

    let mut wait = tokio_test::task::spawn(connection.wait_for_available_streams(StreamKind::Unidirectional, &cancel));
    assert_pending!(wait.poll());

    // Credit for the other kind does not wake the waiter.
    engine.fire_connection(
        raw_connection,
        ConnectionEvent::StreamsAvailable {
            bidirectional_count: 4,
            unidirectional_count: 0,
        },
    );
    assert_pending!(wait.poll());

    engine.fire_connection(
        raw_connection,
        ConnectionEvent::StreamsAvailable {
            bidirectional_count: 4,
            unidirectional_count: 1,
        },
    );
    assert_eq!(assert_ready!(wait.poll()), Ok(()));
}

#[tokio::test]
async fn test_wait_for_streams_fails_when_connection_shuts_down() {
    let engine = RecordingEngine::new();
    let connection = connected(&engine).await;
    let raw_connection = engine.last_connection().unwrap();
    engine.script(|script| script.bidirectional_credit = 0);
    let cancel = CancellationToken::new();

    let mut wait = tokio_test::task::spawn(connection.wait_for_available_streams(StreamKind::Bidirectional, &cancel));
    assert_pending!(wait.poll());

    engine.fire_connection(raw_connection, ConnectionEvent::ShutdownInitiatedByPeer { error_code: 5 });
    engine.fire_connection(
        raw_connection,
        ConnectionEvent::ShutdownComplete {
            handshake_completed: true,
            peer_acknowledged_shutdown: true,
            app_close_in_progress: false,
        },
    );
    assert_eq!(assert_ready!(wait.poll()), Err(QuicError::ConnectionAborted(5)));

    let late = connection
        .wait_for_available_streams(StreamKind::Bidirectional, &cancel)
        .await;
    assert_eq!(late, Err(QuicError::ConnectionAborted(5)));
}
