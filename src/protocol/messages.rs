//! Wire formats, little-endian throughout.
//!
//! The type byte is followed by three zero bytes, so the first four bytes of
//! every message parse as a 32-bit little-endian type field:
//!
//! ```text
//! 1: initiation    148 B  type(4) sender(4) ephemeral(32) static_ct(48) ts_ct(28) mac1(16) mac2(16)
//! 2: response       92 B  type(4) sender(4) receiver(4) ephemeral(32) empty_ct(16) mac1(16) mac2(16)
//! 3: cookie reply   64 B  type(4) receiver(4) nonce(24) cookie_ct(32)
//! 4: transport  16+N+16   type(4) receiver(4) counter(8) ciphertext+tag
//! ```

use crate::error::ProtocolError;

/// Message type discriminants.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Initiation = 1,
    Response = 2,
    CookieReply = 3,
    Transport = 4,
}

impl TryFrom<u32> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Initiation),
            2 => Ok(Self::Response),
            3 => Ok(Self::CookieReply),
            4 => Ok(Self::Transport),
            _ => Err(ProtocolError::InvalidMessageType { msg_type: value }),
        }
    }
}

/// Read the 32-bit type field from a raw datagram.
pub fn message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    if data.len() < 4 {
        return Err(ProtocolError::MessageTooShort {
            expected: 4,
            got: data.len(),
        });
    }
    MessageType::try_from(u32::from_le_bytes(data[..4].try_into().unwrap()))
}

/// Handshake initiation (type 1).
#[derive(Debug, Clone)]
pub struct MessageInitiation {
    pub sender: u32,
    pub ephemeral: [u8; 32],
    /// Encrypted static public key (32 + 16 tag).
    pub static_ct: [u8; 48],
    /// Encrypted TAI64N timestamp (12 + 16 tag).
    pub timestamp_ct: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl MessageInitiation {
    pub const SIZE: usize = 148;
    /// Bytes covered by MAC1 (everything before it).
    pub const MAC1_OFFSET: usize = 116;
    /// Bytes covered by MAC2 (everything before it, including MAC1).
    pub const MAC2_OFFSET: usize = 132;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&(MessageType::Initiation as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral);
        buf[40..88].copy_from_slice(&self.static_ct);
        buf[88..116].copy_from_slice(&self.timestamp_ct);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            sender: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            ephemeral: data[8..40].try_into().unwrap(),
            static_ct: data[40..88].try_into().unwrap(),
            timestamp_ct: data[88..116].try_into().unwrap(),
            mac1: data[116..132].try_into().unwrap(),
            mac2: data[132..148].try_into().unwrap(),
        })
    }
}

/// Handshake response (type 2).
#[derive(Debug, Clone)]
pub struct MessageResponse {
    pub sender: u32,
    pub receiver: u32,
    pub ephemeral: [u8; 32],
    /// Empty payload ciphertext: just the tag authenticating the transcript.
    pub empty_ct: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl MessageResponse {
    pub const SIZE: usize = 92;
    pub const MAC1_OFFSET: usize = 60;
    pub const MAC2_OFFSET: usize = 76;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&(MessageType::Response as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.sender.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral);
        buf[44..60].copy_from_slice(&self.empty_ct);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            sender: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            receiver: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            ephemeral: data[12..44].try_into().unwrap(),
            empty_ct: data[44..60].try_into().unwrap(),
            mac1: data[60..76].try_into().unwrap(),
            mac2: data[76..92].try_into().unwrap(),
        })
    }
}

/// Cookie reply (type 3).
#[derive(Debug, Clone)]
pub struct MessageCookieReply {
    pub receiver: u32,
    pub nonce: [u8; 24],
    /// Encrypted 16-byte cookie (16 + 16 tag).
    pub cookie_ct: [u8; 32],
}

impl MessageCookieReply {
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&(MessageType::CookieReply as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.receiver.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.cookie_ct);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            receiver: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            nonce: data[8..32].try_into().unwrap(),
            cookie_ct: data[32..64].try_into().unwrap(),
        })
    }
}

/// Transport header (type 4); the ciphertext follows in the same datagram.
#[derive(Debug, Clone, Copy)]
pub struct TransportHeader {
    pub receiver: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub const SIZE: usize = 16;
    /// Header plus at least a tag (an empty keepalive).
    pub const MIN_MESSAGE_SIZE: usize = Self::SIZE + 16;

    /// Assemble a full transport datagram around sealed payload bytes.
    pub fn assemble(receiver: u32, counter: u64, ciphertext: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + ciphertext.len());
        buf.extend_from_slice(&(MessageType::Transport as u32).to_le_bytes());
        buf.extend_from_slice(&receiver.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(ciphertext);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooShort {
                expected: Self::MIN_MESSAGE_SIZE,
                got: data.len(),
            });
        }
        Ok(Self {
            receiver: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            counter: u64::from_le_bytes(data[8..16].try_into().unwrap()),
        })
    }

    /// The ciphertext portion of a transport datagram.
    pub fn ciphertext(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}
