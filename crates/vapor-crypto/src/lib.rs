//! Symmetric encryption for Steam CM session traffic.
//!
//! After the logon layer negotiates a 32-byte session key, every payload on
//! the wire is AES-256-CBC encrypted with a per-message IV carried in the
//! first 16 bytes of the ciphertext. Two IV schemes exist:
//! - plain: the IV is an ECB-encrypted random block
//! - authenticated: the IV embeds a truncated HMAC-SHA1 over the plaintext,
//!   letting the receiver reject tampered payloads before trusting them
//!
//! Key exchange itself happens a layer above; this crate only consumes the
//! negotiated key.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod symmetric;

pub use error::{Error, Result};
pub use symmetric::SessionCipher;
