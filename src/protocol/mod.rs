//! Wire protocol definitions and constants
//!
//! Every message on the tunnel is one length-prefixed frame:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |  Type  |        Length (4B, BE)            |
//! +--------+--------+--------+--------+--------+
//! |              Payload (Length bytes)        |
//! +--------+--------+--------+--------+--------+
//! ```

mod frame;

pub use frame::{decode, encode, write_message, Message};

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame header size in bytes (type + length)
pub const HEADER_SIZE: usize = 5;

/// Maximum payload size (1 MiB)
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

/// Payload sent by the server when authentication succeeds
pub const AUTH_OK: &[u8] = b"ok";

/// Payload sent by the server when authentication is rejected
pub const AUTH_REJECTED: &[u8] = b"invalid credentials";

/// Message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client credentials
    Auth = 0,
    /// Server verdict on credentials
    AuthResponse = 1,
    /// Opaque tunneled bytes
    Data = 2,
    /// Session close
    Close = 3,
    /// Keepalive
    Heartbeat = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Auth),
            1 => Ok(MessageType::AuthResponse),
            2 => Ok(MessageType::Data),
            3 => Ok(MessageType::Close),
            4 => Ok(MessageType::Heartbeat),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }
}
