//! Error types for wire-format operations.

use thiserror::Error;

/// Result type alias for wire-format operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Wire-format errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Frame or packet magic did not match.
    #[error("Bad magic")]
    BadMagic,

    /// Not enough bytes to parse the structure.
    #[error("Insufficient data: need {0} bytes")]
    InsufficientData(usize),

    /// Declared payload length exceeds the protocol maximum.
    #[error("Payload length {len} exceeds maximum {max}")]
    PayloadTooLarge {
        /// Declared length in bytes.
        len: usize,
        /// Protocol maximum in bytes.
        max: usize,
    },

    /// Unknown datagram packet type.
    #[error("Unknown packet type: 0x{0:02X}")]
    UnknownPacketType(u8),

    /// Declared and actual payload lengths disagree.
    #[error("Payload length mismatch: header says {expected}, got {actual}")]
    LengthMismatch {
        /// Length declared in the header.
        expected: usize,
        /// Length actually present.
        actual: usize,
    },
}
