//! HTTP CONNECT tunnelling for the stream transports.
//!
//! When `http_proxy` is configured, TCP and WebSocket connections first
//! open a tunnel through the proxy and then run their normal protocol over
//! the returned stream. `Basic` credentials come from the proxy URL's
//! userinfo.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use url::Url;

use crate::{Error, Result};

/// Upper bound on the CONNECT response head we are willing to buffer.
const MAX_RESPONSE_HEAD: usize = 8192;

/// Open a tunnel to `host:port` through `proxy`.
///
/// # Errors
///
/// Returns [`Error::Proxy`] when the exchange exceeds `limit`, the proxy
/// answers with a non-200 status, or the response is malformed.
pub async fn establish(proxy: &Url, host: &str, port: u16, limit: Duration) -> Result<TcpStream> {
    tokio::time::timeout(limit, tunnel(proxy, host, port))
        .await
        .map_err(|_| Error::Proxy("CONNECT timed out".into()))?
}

async fn tunnel(proxy: &Url, host: &str, port: u16) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| Error::Proxy("proxy URL has no host".into()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);

    let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(auth) = basic_auth(proxy) {
        request.push_str(&format!("Proxy-Authorization: Basic {auth}\r\n"));
    }
    request.push_str("Connection: keep-alive\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(&mut stream).await?;
    let status = parse_status(&head)?;
    if status != 200 {
        return Err(Error::Proxy(format!("HTTP status {status}")));
    }

    tracing::debug!(%proxy_host, proxy_port, "CONNECT tunnel established");
    Ok(stream)
}

fn basic_auth(proxy: &Url) -> Option<String> {
    let user = proxy.username();
    let pass = proxy.password().unwrap_or("");
    if user.is_empty() && pass.is_empty() {
        return None;
    }
    Some(STANDARD.encode(format!("{user}:{pass}")))
}

/// Read up to and including the blank line terminating the response head.
///
/// Reads one byte at a time so no tunneled bytes are consumed past the
/// head.
async fn read_response_head(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(Error::Proxy("oversized response head".into()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::Proxy("connection closed during CONNECT".into()));
        }
        head.push(byte[0]);
    }
    Ok(head)
}

fn parse_status(head: &[u8]) -> Result<u16> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::Proxy("non-UTF-8 response head".into()))?;
    let status_line = text
        .lines()
        .next()
        .ok_or_else(|| Error::Proxy("empty response".into()))?;
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Proxy(format!("malformed status line: {status_line:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal proxy: capture the request head, send `response`, then echo
    /// a marker through the tunnel.
    async fn fake_proxy(response: &'static str) -> (std::net::SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                stream.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.write_all(b"tunnel").await.unwrap();
            head
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn test_connect_success() {
        let (addr, proxy_task) = fake_proxy("HTTP/1.1 200 Connection established\r\n\r\n").await;
        let url: Url = format!("http://{addr}").parse().unwrap();

        let mut stream = establish(&url, "203.0.113.7", 27017, Duration::from_secs(2))
            .await
            .unwrap();

        let mut marker = [0u8; 6];
        stream.read_exact(&mut marker).await.unwrap();
        assert_eq!(&marker, b"tunnel");

        let head = String::from_utf8(proxy_task.await.unwrap()).unwrap();
        assert!(head.starts_with("CONNECT 203.0.113.7:27017 HTTP/1.1\r\n"));
        assert!(!head.contains("Proxy-Authorization"));
    }

    #[tokio::test]
    async fn test_connect_sends_basic_auth() {
        let (addr, proxy_task) = fake_proxy("HTTP/1.1 200 OK\r\n\r\n").await;
        let url: Url = format!("http://user:secret@{addr}").parse().unwrap();

        establish(&url, "203.0.113.7", 27017, Duration::from_secs(2))
            .await
            .unwrap();

        let head = String::from_utf8(proxy_task.await.unwrap()).unwrap();
        let expected = STANDARD.encode("user:secret");
        assert!(head.contains(&format!("Proxy-Authorization: Basic {expected}\r\n")));
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let (addr, _proxy_task) =
            fake_proxy("HTTP/1.1 407 Proxy Authentication Required\r\n\r\n").await;
        let url: Url = format!("http://{addr}").parse().unwrap();

        let err = establish(&url, "203.0.113.7", 27017, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Proxy(ref msg) if msg.contains("407")));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // A proxy that accepts and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let silent = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let url: Url = format!("http://{addr}").parse().unwrap();
        let err = establish(&url, "203.0.113.7", 27017, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Proxy(ref msg) if msg.contains("timed out")));
        silent.abort();
    }
}
