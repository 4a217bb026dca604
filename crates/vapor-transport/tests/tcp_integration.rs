//! End-to-end tests for the TCP transport through the connection façade.
//!
//! A local listener stands in for the CM server; frames on the wire are
//! read and written with the same `"VT01"` layout the real servers use.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use vapor_core::frame;
use vapor_crypto::SessionCipher;
use vapor_transport::{ConnectOptions, Connection, Error, Event, Protocol};

const GUARD: Duration = Duration::from_secs(5);

async fn listener() -> (TcpListener, ConnectOptions) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut opts = ConnectOptions::new(addr.ip().to_string(), addr.port());
    opts.auto_retry = false;
    (listener, opts)
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(&header[4..8], b"VT01", "client sent a malformed frame");
    let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.unwrap();
    payload
}

async fn next_event(conn: &mut Connection) -> Event {
    timeout(GUARD, conn.recv())
        .await
        .expect("no event within guard")
        .expect("connection event stream ended")
}

#[tokio::test]
async fn test_framed_echo() {
    let (listener, opts) = listener().await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let payload = read_frame(&mut stream).await;
        assert_eq!(payload, b"hello cm");
        stream.write_all(&frame::encode(&payload)).await.unwrap();
        stream
    });

    let mut conn = Connection::connect(opts).await.unwrap();
    conn.send(b"hello cm").await.unwrap();

    match next_event(&mut conn).await {
        Event::Packet(payload) => assert_eq!(payload, b"hello cm"),
        other => panic!("expected packet, got {other:?}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_bad_magic_is_fatal() {
    let (listener, opts) = listener().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(&[0x00, 0x00, 0x00, 0x00, b'B', b'A', b'D', b'!'])
            .await
            .unwrap();
        // Hold the socket open so the error comes from parsing, not EOF.
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut conn = Connection::connect(opts).await.unwrap();

    match next_event(&mut conn).await {
        Event::Fatal(error) => {
            assert!(matches!(error, Error::BadMagic));
            assert_eq!(error.to_string(), "Bad magic");
        }
        other => panic!("expected fatal, got {other:?}"),
    }
    assert!(matches!(next_event(&mut conn).await, Event::Closed));
}

#[tokio::test]
async fn test_single_packet_from_trickled_bytes() {
    let (listener, opts) = listener().await;

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        for byte in frame::encode(&[0xAA, 0xBB, 0xCC, 0xDD]) {
            stream.write_all(&[byte]).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut conn = Connection::connect(opts).await.unwrap();

    match next_event(&mut conn).await {
        Event::Packet(payload) => assert_eq!(payload, vec![0xAA, 0xBB, 0xCC, 0xDD]),
        other => panic!("expected packet, got {other:?}"),
    }
}

#[tokio::test]
async fn test_encrypted_session() {
    let (listener, opts) = listener().await;
    let key = [0x42u8; 32];

    let server = tokio::spawn(async move {
        let cipher = SessionCipher::new(&key, true).unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        let payload = read_frame(&mut stream).await;
        let plain = cipher.decrypt(&payload).unwrap();
        assert_eq!(plain, b"ping");

        let reply = cipher.encrypt(b"pong").unwrap();
        stream.write_all(&frame::encode(&reply)).await.unwrap();
        stream
    });

    let mut conn = Connection::connect(opts).await.unwrap();
    conn.set_session_key(&key, true).await.unwrap();
    assert!(conn.connected());

    conn.send(b"ping").await.unwrap();

    match next_event(&mut conn).await {
        Event::Packet(payload) => assert_eq!(payload, b"pong"),
        other => panic!("expected packet, got {other:?}"),
    }
    server.await.unwrap();
}

#[tokio::test]
async fn test_undecryptable_payload_is_survivable() {
    let (listener, opts) = listener().await;
    let key = [0x42u8; 32];

    let server = tokio::spawn(async move {
        let cipher = SessionCipher::new(&key, true).unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        // Garbage that cannot authenticate, then a valid payload.
        stream.write_all(&frame::encode(&[0u8; 48])).await.unwrap();
        let reply = cipher.encrypt(b"still here").unwrap();
        stream.write_all(&frame::encode(&reply)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut conn = Connection::connect(opts).await.unwrap();
    conn.set_session_key(&key, true).await.unwrap();

    assert!(matches!(
        next_event(&mut conn).await,
        Event::EncryptionError(_)
    ));
    match next_event(&mut conn).await {
        Event::Packet(payload) => assert_eq!(payload, b"still here"),
        other => panic!("expected packet, got {other:?}"),
    }
    server.abort();
}

#[tokio::test]
async fn test_session_key_set_once() {
    let (listener, opts) = listener().await;
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let conn = Connection::connect(opts).await.unwrap();
    conn.set_session_key(&[1u8; 32], false).await.unwrap();

    let err = conn.set_session_key(&[2u8; 32], false).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_double_disconnect_is_invalid() {
    let (listener, opts) = listener().await;
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let conn = Connection::connect(opts).await.unwrap();
    conn.disconnect().await.unwrap();

    let err = conn.disconnect().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_auto_retry_before_handshake() {
    let (listener, mut opts) = listener().await;
    opts.auto_retry = true;

    let server = tokio::spawn(async move {
        // First connection dies immediately; the façade should come back.
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        let (mut stream, _) = listener.accept().await.unwrap();
        stream
            .write_all(&frame::encode(b"second time lucky"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let mut conn = Connection::connect(opts).await.unwrap();

    let event = timeout(Duration::from_secs(10), conn.recv())
        .await
        .expect("no event after retry")
        .expect("event stream ended");
    match event {
        Event::Packet(payload) => assert_eq!(payload, b"second time lucky"),
        other => panic!("expected packet after silent retry, got {other:?}"),
    }
    server.abort();
}

#[tokio::test]
async fn test_failure_after_handshake_surfaces() {
    let (listener, mut opts) = listener().await;
    opts.auto_retry = true;

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        drop(stream);
    });

    let mut conn = Connection::connect(opts).await.unwrap();
    conn.set_session_key(&[3u8; 32], false).await.unwrap();

    // With the key set, the peer dropping is no longer retried.
    assert!(matches!(next_event(&mut conn).await, Event::Closed));
}

#[tokio::test]
async fn test_protocol_and_address_accessors() {
    let (listener, opts) = listener().await;
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let expected = opts.remote_address();
    let conn = Connection::connect(opts).await.unwrap();
    assert_eq!(conn.remote_address(), expected);
    assert_eq!(conn.protocol(), Protocol::Tcp);
    assert!(!conn.connected());
    assert!(!conn.logged_on());
    conn.set_logged_on(true);
    assert!(conn.logged_on());
}
