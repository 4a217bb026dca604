//! Transport layer errors.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection establishment failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A framed stream desynchronized.
    #[error("Bad magic")]
    BadMagic,

    /// An outbound packet went unacknowledged past the ack timeout.
    #[error("Connection timed out")]
    ConnectionTimedOut,

    /// The HTTP proxy refused or mishandled the CONNECT request.
    #[error("Proxy CONNECT failed: {0}")]
    Proxy(String),

    /// API misuse, e.g. disconnecting a connection that is not up.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The connection is already closed.
    #[error("Connection closed")]
    Closed,

    /// Wire-format error from the core codecs.
    #[error("Protocol error: {0}")]
    Protocol(#[from] vapor_core::Error),

    /// Cryptographic error.
    #[error("Crypto error: {0}")]
    Crypto(#[from] vapor_crypto::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
