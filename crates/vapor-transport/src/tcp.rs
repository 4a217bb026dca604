//! TCP transport: `"VT01"`-framed payloads over a stream socket.
//!
//! The read loop feeds raw bytes through [`FrameReader`], so payloads
//! survive arbitrary read fragmentation; a desynchronized stream (bad
//! magic) is fatal. Outbound payloads are wrapped by `frame::encode`.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use vapor_core::frame::{self, FrameReader};

use crate::event::{emit_fatal, Command, Event};
use crate::options::ConnectOptions;
use crate::{proxy, Error, Result};

const READ_BUF_LEN: usize = 8192;

/// Connect the TCP transport and spawn its driver task.
///
/// Events flow out on `events`; the returned sender accepts [`Command`]s
/// until the task dies.
pub(crate) async fn spawn(
    opts: &ConnectOptions,
    events: mpsc::UnboundedSender<Event>,
) -> Result<mpsc::UnboundedSender<Command>> {
    let stream = open_stream(opts).await?;
    stream.set_nodelay(true)?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(stream, events, cmd_rx));
    Ok(cmd_tx)
}

/// Establish the underlying stream for `opts`: direct connect with an
/// optional local bind, or an HTTP CONNECT tunnel when a proxy is set.
/// Shared with the WebSocket transport.
pub(crate) async fn open_stream(opts: &ConnectOptions) -> Result<TcpStream> {
    if let Some(proxy_url) = &opts.http_proxy {
        return proxy::establish(proxy_url, &opts.host, opts.port, opts.proxy_timeout).await;
    }

    let remote = resolve(opts).await?;
    let socket = match remote {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    if opts.local_address.is_some() || opts.local_port.is_some() {
        let ip = opts.local_address.unwrap_or(match remote {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        });
        socket.bind(SocketAddr::new(ip, opts.local_port.unwrap_or(0)))?;
    }

    Ok(socket.connect(remote).await?)
}

pub(crate) async fn resolve(opts: &ConnectOptions) -> Result<SocketAddr> {
    tokio::net::lookup_host((opts.host.as_str(), opts.port))
        .await?
        .next()
        .ok_or_else(|| Error::ConnectionFailed(format!("no address for {}", opts.host)))
}

async fn run(
    stream: TcpStream,
    events: mpsc::UnboundedSender<Event>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new();
    let mut buf = vec![0u8; READ_BUF_LEN];
    let mut idle_timeout: Option<Duration> = None;
    let mut idle_deadline: Option<Instant> = None;

    loop {
        let wake = idle_deadline.unwrap_or_else(park_deadline);
        tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("stream closed by peer");
                    let _ = events.send(Event::Closed);
                    return;
                }
                Ok(n) => {
                    if let Some(timeout) = idle_timeout {
                        idle_deadline = Some(Instant::now() + timeout);
                    }
                    reader.push(&buf[..n]);
                    loop {
                        match reader.next() {
                            Ok(Some(payload)) => {
                                let _ = events.send(Event::Packet(payload));
                            }
                            Ok(None) => break,
                            Err(vapor_core::Error::BadMagic) => {
                                emit_fatal(&events, Error::BadMagic);
                                return;
                            }
                            Err(e) => {
                                emit_fatal(&events, e.into());
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    emit_fatal(&events, e.into());
                    return;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(payload)) => {
                    if let Err(e) = write_half.write_all(&frame::encode(&payload)).await {
                        emit_fatal(&events, e.into());
                        return;
                    }
                }
                Some(Command::SetTimeout(timeout)) => {
                    idle_timeout = timeout;
                    idle_deadline = timeout.map(|t| Instant::now() + t);
                }
                Some(Command::End) => {
                    // Half-close; keep draining until the peer finishes.
                    let _ = write_half.shutdown().await;
                }
                Some(Command::SetSessionKey(_)) => {
                    // Stream payloads are encrypted by the façade.
                }
                Some(Command::Destroy) | None => {
                    let _ = events.send(Event::Closed);
                    return;
                }
            },
            _ = tokio::time::sleep_until(wake), if idle_deadline.is_some() => {
                let _ = events.send(Event::Timeout);
                // Rearms on the next inbound traffic.
                idle_deadline = None;
            }
        }
    }
}

/// Deadline used when no timer is armed; far enough out to never fire.
fn park_deadline() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    async fn spawn_driver(
        stream: TcpStream,
    ) -> (
        mpsc::UnboundedSender<Command>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(stream, event_tx, cmd_rx));
        (cmd_tx, event_rx)
    }

    #[tokio::test]
    async fn test_byte_at_a_time_delivery() {
        let (client, mut server) = connected_pair().await;
        let (_cmd_tx, mut events) = spawn_driver(client).await;

        for byte in frame::encode(&[0xAA, 0xBB, 0xCC, 0xDD]) {
            server.write_all(&[byte]).await.unwrap();
            server.flush().await.unwrap();
        }

        match events.recv().await.unwrap() {
            Event::Packet(payload) => assert_eq!(payload, vec![0xAA, 0xBB, 0xCC, 0xDD]),
            other => panic!("expected packet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_is_framed() {
        let (client, mut server) = connected_pair().await;
        let (cmd_tx, _events) = spawn_driver(client).await;

        cmd_tx.send(Command::Send(b"ping".to_vec())).unwrap();

        let mut wire = vec![0u8; 12];
        server.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, frame::encode(b"ping"));
    }

    #[tokio::test]
    async fn test_bad_magic_is_fatal() {
        let (client, mut server) = connected_pair().await;
        let (_cmd_tx, mut events) = spawn_driver(client).await;

        server
            .write_all(&[0x00, 0x00, 0x00, 0x00, b'X', b'X', b'X', b'X'])
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            Event::Fatal(Error::BadMagic) => {}
            other => panic!("expected bad-magic fatal, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(Event::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_fires_once() {
        let (client, _server) = connected_pair().await;
        let (cmd_tx, mut events) = spawn_driver(client).await;

        cmd_tx
            .send(Command::SetTimeout(Some(Duration::from_secs(5))))
            .unwrap();

        assert!(matches!(events.recv().await, Some(Event::Timeout)));
        // Disarmed until traffic resumes: nothing else fires.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_close_emits_closed() {
        let (client, server) = connected_pair().await;
        let (_cmd_tx, mut events) = spawn_driver(client).await;

        drop(server);
        assert!(matches!(events.recv().await, Some(Event::Closed)));
    }
}
