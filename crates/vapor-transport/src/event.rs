//! Typed surfaces between a connection task and its owner.

use std::time::Duration;

use vapor_crypto::SessionCipher;

use crate::Error;

/// Events a connection emits to its owner.
///
/// Delivery order on failure is always `Fatal` followed by `Closed`;
/// `Closed` alone means an orderly shutdown.
#[derive(Debug)]
pub enum Event {
    /// The transport-level handshake finished. UDP reports the server load
    /// learned during the challenge exchange; stream transports have none.
    Connected {
        /// Server load from the challenge payload, when available.
        server_load: Option<u32>,
    },
    /// One complete inbound payload, already decrypted when a session key
    /// is active.
    Packet(Vec<u8>),
    /// An inbound payload failed decryption or authentication. The payload
    /// is dropped; the connection stays up.
    EncryptionError(vapor_crypto::Error),
    /// The connection failed; a `Closed` event follows.
    Fatal(Error),
    /// The user-configured inactivity timer elapsed.
    Timeout,
    /// The connection is gone and no further events will arrive.
    Closed,
}

/// Emit the failure pair every dying transport produces.
pub(crate) fn emit_fatal(events: &tokio::sync::mpsc::UnboundedSender<Event>, error: Error) {
    let _ = events.send(Event::Fatal(error));
    let _ = events.send(Event::Closed);
}

/// Commands a connection owner sends into a transport task.
#[derive(Debug)]
pub(crate) enum Command {
    /// Transmit one payload.
    Send(Vec<u8>),
    /// Install or clear the session cipher. Only the UDP engine consumes
    /// this; stream transports are encrypted by the façade.
    SetSessionKey(Option<SessionCipher>),
    /// Arm or disarm the inactivity timer.
    SetTimeout(Option<Duration>),
    /// Graceful shutdown: half-close (TCP), close frame (WebSocket), or
    /// the Disconnect exchange (UDP).
    End,
    /// Immediate teardown.
    Destroy,
}
