//! Connection configuration.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

/// Default time allowed for an HTTP CONNECT exchange.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(5);

/// Which transport carries the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Raw TCP with length-prefixed framing.
    Tcp,
    /// Valve's reliable-datagram protocol over UDP.
    Udp,
    /// Binary WebSocket frames over TLS.
    WebSocket,
}

/// Options for one connection attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// CM endpoint host (IP or name).
    pub host: String,
    /// CM endpoint port.
    pub port: u16,
    /// Transport selection.
    pub protocol: Protocol,
    /// Optional local address to bind outgoing sockets to.
    pub local_address: Option<IpAddr>,
    /// Optional local port to bind outgoing sockets to.
    pub local_port: Option<u16>,
    /// Optional HTTP proxy for TCP and WebSocket; `Basic` credentials are
    /// read from the URL userinfo. Ignored for UDP.
    pub http_proxy: Option<Url>,
    /// Time allowed for the proxy CONNECT exchange.
    pub proxy_timeout: Duration,
    /// Reconnect on failures that happen before the encryption handshake
    /// completes.
    pub auto_retry: bool,
}

impl ConnectOptions {
    /// Options for `host:port` with defaults: TCP, no binding, no proxy,
    /// auto-retry on.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: Protocol::Tcp,
            local_address: None,
            local_port: None,
            http_proxy: None,
            proxy_timeout: DEFAULT_PROXY_TIMEOUT,
            auto_retry: true,
        }
    }

    /// Same options with a different transport.
    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// The remote endpoint as `"host:port"`.
    pub fn remote_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ConnectOptions::new("203.0.113.7", 27017);
        assert_eq!(opts.protocol, Protocol::Tcp);
        assert_eq!(opts.proxy_timeout, DEFAULT_PROXY_TIMEOUT);
        assert!(opts.auto_retry);
        assert_eq!(opts.remote_address(), "203.0.113.7:27017");
    }

    #[test]
    fn test_protocol_selector() {
        let opts = ConnectOptions::new("203.0.113.7", 27017).protocol(Protocol::Udp);
        assert_eq!(opts.protocol, Protocol::Udp);
    }
}
