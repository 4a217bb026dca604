//! Unit tests for the WebSocket transport driver.

use super::*;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, client_async};

/// Spawn the driver over a plaintext WebSocket pair and hand back the
/// server side of the socket.
async fn driver_with_peer() -> (
    mpsc::UnboundedSender<Command>,
    mpsc::UnboundedReceiver<Event>,
    WebSocketStream<TcpStream>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    let (ws, _) = client_async(format!("ws://{addr}/cmsocket/"), stream)
        .await
        .unwrap();

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let cmd_tx = spawn_stream(ws, event_tx);
    let server = server_task.await.unwrap();
    (cmd_tx, event_rx, server)
}

#[tokio::test]
async fn test_binary_frame_becomes_packet() {
    let (_cmd_tx, mut events, mut server) = driver_with_peer().await;

    server
        .send(Message::Binary(vec![1, 2, 3, 4]))
        .await
        .unwrap();

    match events.recv().await.unwrap() {
        Event::Packet(payload) => assert_eq!(payload, vec![1, 2, 3, 4]),
        other => panic!("expected packet, got {other:?}"),
    }
}

#[tokio::test]
async fn test_send_is_one_binary_frame() {
    let (cmd_tx, _events, mut server) = driver_with_peer().await;

    cmd_tx.send(Command::Send(b"payload".to_vec())).unwrap();

    match server.next().await.unwrap().unwrap() {
        Message::Binary(data) => assert_eq!(data, b"payload"),
        other => panic!("expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_binary_frames_dropped() {
    let (_cmd_tx, mut events, mut server) = driver_with_peer().await;

    server
        .send(Message::Text("not for us".into()))
        .await
        .unwrap();
    server.send(Message::Binary(vec![9])).await.unwrap();

    // Only the binary frame surfaces.
    match events.recv().await.unwrap() {
        Event::Packet(payload) => assert_eq!(payload, vec![9]),
        other => panic!("expected packet, got {other:?}"),
    }
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_peer_close_emits_closed() {
    let (_cmd_tx, mut events, mut server) = driver_with_peer().await;

    server.close(None).await.unwrap();
    assert!(matches!(events.recv().await, Some(Event::Closed)));
}

#[tokio::test]
async fn test_end_closes_gracefully() {
    let (cmd_tx, mut events, mut server) = driver_with_peer().await;

    cmd_tx.send(Command::End).unwrap();

    // Peer observes a close frame.
    loop {
        match server.next().await {
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("unexpected error: {e}"),
        }
    }
    assert!(matches!(events.recv().await, Some(Event::Closed)));
}
