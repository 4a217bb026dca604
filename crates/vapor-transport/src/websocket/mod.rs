//! WebSocket transport: one payload per binary frame.
//!
//! Dials `wss://<host>:<port>/cmsocket/` over a pre-established TCP stream
//! (so local binding and the HTTP proxy work the same as for raw TCP).
//! The WebSocket layer supplies message boundaries, so no `"VT01"` framing
//! is applied; non-binary frames are logged and dropped.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::event::{emit_fatal, Command, Event};
use crate::options::ConnectOptions;
use crate::{tcp, Error, Result};

#[cfg(test)]
mod tests;

/// Interval between keepalive pings.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connect the WebSocket transport and spawn its driver task.
pub(crate) async fn spawn(
    opts: &ConnectOptions,
    events: mpsc::UnboundedSender<Event>,
) -> Result<mpsc::UnboundedSender<Command>> {
    let stream = tcp::open_stream(opts).await?;
    stream.set_nodelay(true)?;

    let url = format!("wss://{}:{}/cmsocket/", opts.host, opts.port);
    let (ws, _response) = tokio_tungstenite::client_async_tls(url, stream)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("WebSocket handshake failed: {e}")))?;

    Ok(spawn_stream(ws, events))
}

/// Spawn the driver over an already-upgraded WebSocket stream.
pub(crate) fn spawn_stream<S>(
    ws: WebSocketStream<S>,
    events: mpsc::UnboundedSender<Event>,
) -> mpsc::UnboundedSender<Command>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    tokio::spawn(run(ws, events, cmd_rx));
    cmd_tx
}

async fn run<S>(
    ws: WebSocketStream<S>,
    events: mpsc::UnboundedSender<Event>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut idle_timeout: Option<Duration> = None;
    let mut idle_deadline: Option<Instant> = None;

    loop {
        let wake = idle_deadline.unwrap_or_else(park_deadline);
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => {
                    if let Some(timeout) = idle_timeout {
                        idle_deadline = Some(Instant::now() + timeout);
                    }
                    let _ = events.send(Event::Packet(data));
                }
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        emit_fatal(&events, Error::ConnectionFailed("pong send failed".into()));
                        return;
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!("WebSocket closed by peer");
                    let _ = events.send(Event::Closed);
                    return;
                }
                Some(Ok(other)) => {
                    tracing::debug!(?other, "dropping non-binary WebSocket frame");
                }
                Some(Err(e)) => {
                    emit_fatal(
                        &events,
                        Error::ConnectionFailed(format!("WebSocket error: {e}")),
                    );
                    return;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(payload)) => {
                    if let Err(e) = sink.send(Message::Binary(payload)).await {
                        emit_fatal(
                            &events,
                            Error::ConnectionFailed(format!("WebSocket send failed: {e}")),
                        );
                        return;
                    }
                }
                Some(Command::SetTimeout(timeout)) => {
                    idle_timeout = timeout;
                    idle_deadline = timeout.map(|t| Instant::now() + t);
                }
                Some(Command::SetSessionKey(_)) => {
                    // Stream payloads are encrypted by the façade.
                }
                Some(Command::End) | Some(Command::Destroy) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    let _ = events.send(Event::Closed);
                    return;
                }
            },
            _ = ping.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    emit_fatal(&events, Error::ConnectionFailed("ping send failed".into()));
                    return;
                }
            }
            _ = tokio::time::sleep_until(wake), if idle_deadline.is_some() => {
                let _ = events.send(Event::Timeout);
                idle_deadline = None;
            }
        }
    }
}

fn park_deadline() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
