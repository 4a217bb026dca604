//! Datagram packets for the reliable-UDP transport.
//!
//! Every UDP datagram carries a fixed 36-byte header followed by at most
//! [`MAX_PAYLOAD`] payload bytes. All multi-byte integers are little-endian:
//!
//! ```ascii
//!  0: magic "VS01" (4 ASCII bytes)
//!  4: payload length (u16)
//!  6: packet type (u8)
//!  7: flags (u8, always 0)
//!  8: source connection id (u32)
//! 12: destination connection id (u32)
//! 16: sequence number (u32, 0 for pure acks)
//! 20: acknowledged sequence number (u32)
//! 24: packets in message (u32, 0 for pure acks)
//! 28: message start sequence (u32)
//! 32: message size (u32)
//! ```

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{Error, Result};

/// Magic marker opening every datagram.
pub const PACKET_MAGIC: [u8; 4] = *b"VS01";

/// Fixed header length.
pub const PACKET_HEADER_LEN: usize = 36;

/// Maximum payload carried by one datagram; larger messages fragment.
pub const MAX_PAYLOAD: usize = 1244;

/// XOR mask applied to the server challenge before echoing it back.
pub const CHALLENGE_MASK: u32 = 0xA426_DF2B;

/// Datagram packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Client requests a connection challenge.
    ChallengeReq = 1,
    /// Server responds with a challenge value and its load.
    Challenge = 2,
    /// Client echoes the obfuscated challenge to open the connection.
    Connect = 3,
    /// Server accepts the connection.
    Accept = 4,
    /// Either side requests an orderly teardown.
    Disconnect = 5,
    /// Application payload (possibly one fragment of a larger message).
    Data = 6,
    /// Pure acknowledgment, never sequenced.
    Datagram = 7,
}

impl PacketType {
    /// Convert from the wire byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ChallengeReq),
            2 => Some(Self::Challenge),
            3 => Some(Self::Connect),
            4 => Some(Self::Accept),
            5 => Some(Self::Disconnect),
            6 => Some(Self::Data),
            7 => Some(Self::Datagram),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// One datagram: header fields plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet type.
    pub packet_type: PacketType,
    /// Sender's connection id.
    pub source_conn_id: u32,
    /// Recipient's connection id (0 until learned).
    pub dest_conn_id: u32,
    /// This packet's sequence number; 0 for pure acks.
    pub seq: u32,
    /// Highest consecutive sequence the sender has received.
    pub ack: u32,
    /// Number of packets the containing message spans; 0 for pure acks.
    pub packets_in_msg: u32,
    /// Sequence of the first packet of the containing message.
    pub msg_start_seq: u32,
    /// Total reassembled message size in bytes.
    pub msg_size: u32,
    /// Payload fragment.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Parse one datagram.
    ///
    /// # Errors
    ///
    /// Rejects short input, wrong magic, oversized or inconsistent payload
    /// lengths, and unknown packet types. The transport drops such
    /// datagrams without killing the connection.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_HEADER_LEN {
            return Err(Error::InsufficientData(PACKET_HEADER_LEN));
        }
        if data[0..4] != PACKET_MAGIC {
            return Err(Error::BadMagic);
        }

        let payload_len = u16::from_le_bytes([data[4], data[5]]) as usize;
        if payload_len > MAX_PAYLOAD {
            return Err(Error::PayloadTooLarge {
                len: payload_len,
                max: MAX_PAYLOAD,
            });
        }

        let packet_type =
            PacketType::from_u8(data[6]).ok_or(Error::UnknownPacketType(data[6]))?;

        let actual = data.len() - PACKET_HEADER_LEN;
        if actual != payload_len {
            return Err(Error::LengthMismatch {
                expected: payload_len,
                actual,
            });
        }

        Ok(Packet {
            packet_type,
            source_conn_id: read_u32_le(&data[8..12]),
            dest_conn_id: read_u32_le(&data[12..16]),
            seq: read_u32_le(&data[16..20]),
            ack: read_u32_le(&data[20..24]),
            packets_in_msg: read_u32_le(&data[24..28]),
            msg_start_seq: read_u32_le(&data[28..32]),
            msg_size: read_u32_le(&data[32..36]),
            payload: data[PACKET_HEADER_LEN..].to_vec(),
        })
    }

    /// Serialize to wire bytes.
    pub fn serialize(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);

        let mut buf = Vec::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&PACKET_MAGIC);
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.push(self.packet_type.to_u8());
        buf.push(0); // flags
        buf.extend_from_slice(&self.source_conn_id.to_le_bytes());
        buf.extend_from_slice(&self.dest_conn_id.to_le_bytes());
        buf.extend_from_slice(&self.seq.to_le_bytes());
        buf.extend_from_slice(&self.ack.to_le_bytes());
        buf.extend_from_slice(&self.packets_in_msg.to_le_bytes());
        buf.extend_from_slice(&self.msg_start_seq.to_le_bytes());
        buf.extend_from_slice(&self.msg_size.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

#[inline]
fn read_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}

/// First connection id handed out by [`next_conn_id`].
const CONN_ID_INIT: u32 = 512;

/// Spacing between consecutive connection ids.
const CONN_ID_STEP: u32 = 256;

static NEXT_CONN_ID: AtomicU32 = AtomicU32::new(CONN_ID_INIT);

/// Allocate a fresh local connection id.
///
/// Process-wide and monotonic: 512, 768, 1024, ... 32-bit wraparound is a
/// theoretical concern only.
pub fn next_conn_id() -> u32 {
    NEXT_CONN_ID.fetch_add(CONN_ID_STEP, Ordering::Relaxed)
}
