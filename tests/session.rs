//! Connection and state-machine behaviour of the session layer.

use std::{collections::HashSet, sync::Arc, time::Duration};

use muxpack::{
    BasicSession, Client, Endpoint, Error, FrameDecoder, SessionConfig, Value,
};
use tokio::{io::AsyncReadExt, net::TcpListener, task};
use tracing_test::traced_test;

async fn loopback() -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = Endpoint::Tcp(listener.local_addr().unwrap());
    (listener, endpoint)
}

#[tokio::test]
async fn constructor_performs_no_io() {
    let session = BasicSession::new(SessionConfig::default());
    assert!(!session.connected());
    assert_eq!(session.active_channels(), 0);
}

#[tokio::test]
async fn connect_resolves_ok() {
    let (listener, endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let session = BasicSession::new(SessionConfig::default());
    session.connect(endpoint).get().await.unwrap();
    assert!(session.connected());

    accept.await.unwrap();
    session.disconnect();
}

#[tokio::test]
async fn connection_refused() {
    // Bind and immediately drop to obtain a port with no listener.
    let (listener, endpoint) = loopback().await;
    drop(listener);

    let session = BasicSession::new(SessionConfig::default());
    match session.connect(endpoint).get().await {
        Err(Error::Connect { .. }) => {}
        other => panic!("expected connect failure, got {other:?}"),
    }
    assert!(!session.connected());
}

#[tokio::test]
async fn connect_tries_endpoints_in_order() {
    let (dead, dead_endpoint) = loopback().await;
    drop(dead);
    let (listener, live_endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let session = BasicSession::new(SessionConfig::default());
    session
        .connect_any(vec![dead_endpoint, live_endpoint])
        .get()
        .await
        .unwrap();
    assert!(session.connected());

    accept.await.unwrap();
    session.disconnect();
}

#[tokio::test]
async fn second_connect_while_connecting_fails() {
    let (listener, endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let session = BasicSession::new(SessionConfig::default());
    let first = session.connect(endpoint.clone());
    // The basic layer rejects any concurrent connect outright.
    match session.connect(endpoint).get().await {
        Err(Error::AlreadyStarted) => {}
        other => panic!("expected already_started, got {other:?}"),
    }
    first.get().await.unwrap();

    accept.await.unwrap();
    session.disconnect();
}

#[tokio::test]
async fn concurrent_connects_latch_onto_one_outcome() {
    let (listener, endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let client = Client::new();
    let first = client.connect(endpoint.clone());
    let second = client.connect(endpoint.clone());
    let third = client.connect(endpoint);

    first.get().await.unwrap();
    second.get().await.unwrap();
    third.get().await.unwrap();
    assert!(client.connected());

    accept.await.unwrap();
    client.disconnect();
}

#[tokio::test]
async fn connect_to_different_endpoint_while_connecting() {
    let (listener, endpoint) = loopback().await;
    let (_other_listener, other_endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let client = Client::new();
    let first = client.connect(endpoint);
    match client.connect(other_endpoint).get().await {
        Err(Error::AlreadyStarted) => {}
        other => panic!("expected already_started, got {other:?}"),
    }
    first.get().await.unwrap();

    accept.await.unwrap();
    client.disconnect();
}

#[tokio::test]
async fn connect_while_connected() {
    let (listener, endpoint) = loopback().await;
    let (_other_listener, other_endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let client = Client::new();
    client.connect(endpoint.clone()).get().await.unwrap();
    accept.await.unwrap();

    // Same endpoint is a no-op; a different one is refused.
    client.connect(endpoint).get().await.unwrap();
    match client.connect(other_endpoint).get().await {
        Err(Error::AlreadyConnected) => {}
        other => panic!("expected already_connected, got {other:?}"),
    }
    client.disconnect();
}

#[tokio::test]
async fn disconnect_is_idempotent_and_terminal() {
    let (listener, endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let session = BasicSession::new(SessionConfig::default());
    session.connect(endpoint.clone()).get().await.unwrap();
    accept.await.unwrap();

    session.disconnect();
    session.disconnect();
    assert!(!session.connected());

    // Subsequent operations fail promptly.
    match session.push(vec![0x90]).get().await {
        Err(Error::NotConnected) => {}
        other => panic!("expected not_connected, got {other:?}"),
    }
    match session.connect(endpoint).get().await {
        Err(Error::NotConnected) => {}
        other => panic!("expected not_connected, got {other:?}"),
    }
}

#[tokio::test]
async fn peer_hangup_disconnects_the_session() {
    let (listener, endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let session = BasicSession::new(SessionConfig::default());
    session.connect(endpoint).get().await.unwrap();
    let (socket, _) = accept.await.unwrap();
    drop(socket);

    for _ in 0..100 {
        if !session.connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session still connected after peer hangup");
}

#[tokio::test]
async fn malformed_frame_is_fatal() {
    let (listener, endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let session = BasicSession::new(SessionConfig::default());
    session.connect(endpoint).get().await.unwrap();
    let (mut socket, _) = accept.await.unwrap();

    // A lone nil decodes but is not a `[span, type, args]` frame.
    tokio::io::AsyncWriteExt::write_all(&mut socket, &[0xc0])
        .await
        .unwrap();

    for _ in 0..100 {
        if !session.connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session survived a malformed frame");
}

#[traced_test]
#[tokio::test]
async fn unknown_span_is_dropped_with_a_warning() {
    let (listener, endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let session = BasicSession::new(SessionConfig::default());
    session.connect(endpoint).get().await.unwrap();
    let (mut socket, _) = accept.await.unwrap();

    let bytes = muxpack::encode_frame(42, 0, &[Value::from(1)]).unwrap();
    tokio::io::AsyncWriteExt::write_all(&mut socket, &bytes)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session.connected());
    assert!(logs_contain("dropping frame for unknown span"));
    session.disconnect();
}

#[tokio::test]
async fn spans_are_a_gapless_prefix() {
    let session = BasicSession::new(SessionConfig::default());
    let spans: Vec<u64> = (0..100).map(|_| session.next()).collect();
    assert_eq!(spans, (1..=100).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn spans_are_unique_under_contention() {
    let session = BasicSession::new(SessionConfig::default());
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let session = Arc::clone(&session);
        tasks.push(task::spawn(async move {
            (0..250).map(|_| session.next()).collect::<Vec<u64>>()
        }));
    }
    let mut seen = HashSet::new();
    for task in tasks {
        for span in task.await.unwrap() {
            assert_ne!(span, muxpack::CONTROL_SPAN);
            assert!(seen.insert(span), "duplicate span {span}");
        }
    }
    assert_eq!(seen.len(), 1000);
}

#[tokio::test]
async fn write_future_resolves_after_transport_accepts() {
    let (listener, endpoint) = loopback().await;
    let accept = task::spawn(async move { listener.accept().await.unwrap() });

    let session = BasicSession::new(SessionConfig::default());
    session.connect(endpoint).get().await.unwrap();
    let (mut socket, _) = accept.await.unwrap();

    let bytes = muxpack::encode_frame(1, 0, &[Value::from(7)]).unwrap();
    session.push(bytes.clone()).get().await.unwrap();

    // The peer observes exactly the bytes that were pushed.
    let mut decoder = FrameDecoder::with_capacity(64);
    let frame = loop {
        if let Some(frame) = decoder.next_frame().unwrap() {
            break frame;
        }
        let read = socket.read_buf(decoder.buffer_mut()).await.unwrap();
        assert!(read > 0);
    };
    assert_eq!(frame.span, 1);
    assert_eq!(frame.args, vec![Value::from(7)]);
    session.disconnect();
}
