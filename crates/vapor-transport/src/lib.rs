//! Transport layer for Steam CM connections.
//!
//! Implements the three interchangeable transports a CM session can run
//! over, plus the connection façade that selects one and applies session
//! encryption:
//! - raw TCP with `"VT01"` length-prefixed framing
//! - WebSocket (`wss://host:port/cmsocket/`), one payload per binary frame
//! - Valve's reliable-datagram protocol over UDP (`"VS01"` packets with
//!   sequencing, acks, retransmission, and fragmentation)
//!
//! Each live connection is one spawned task owning all of its state;
//! callers talk to it through [`Connection`] and consume a stream of
//! [`Event`]s.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod error;
pub mod event;
pub mod options;
pub mod proxy;
pub mod tcp;
pub mod udp;
pub mod websocket;

pub use connection::Connection;
pub use error::{Error, Result};
pub use event::Event;
pub use options::{ConnectOptions, Protocol};
