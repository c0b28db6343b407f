//! 128-bit Bluetooth UUIDs
//!
//! Services and characteristics are always identified by a full 128-bit UUID.
//! SIG-assigned 16/32-bit values are expanded against the Bluetooth base UUID.

use rand::RngCore;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bluetooth base UUID "00000000-0000-1000-8000-00805F9B34FB", big-endian.
const BASE_UUID_BYTES: [u8; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5F, 0x9B, 0x34, 0xFB,
];

/// A 128-bit UUID stored in big-endian (textual) byte order.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Uuid {
    bytes: [u8; 16],
}

impl Uuid {
    /// Creates a UUID from 16 big-endian bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid { bytes }
    }

    pub const fn from_u128(value: u128) -> Self {
        Uuid {
            bytes: value.to_be_bytes(),
        }
    }

    /// Expands a SIG-assigned 16-bit value against the base UUID.
    pub const fn from_u16(uuid16: u16) -> Self {
        Self::from_u32(uuid16 as u32)
    }

    /// Expands a SIG-assigned 32-bit value against the base UUID.
    pub const fn from_u32(uuid32: u32) -> Self {
        let mut bytes = BASE_UUID_BYTES;
        let short = uuid32.to_be_bytes();
        bytes[0] = short[0];
        bytes[1] = short[1];
        bytes[2] = short[2];
        bytes[3] = short[3];
        Uuid { bytes }
    }

    /// Generates a random (version 4) UUID.
    pub fn new_random_v4() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Uuid { bytes }
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    pub const fn as_u128(&self) -> u128 {
        u128::from_be_bytes(self.bytes)
    }

    fn is_sig_assigned(&self) -> bool {
        self.bytes[4..] == BASE_UUID_BYTES[4..]
    }

    /// Returns the 16-bit short form for SIG-assigned UUIDs.
    pub fn as_u16(&self) -> Option<u16> {
        if self.is_sig_assigned() && self.bytes[0] == 0 && self.bytes[1] == 0 {
            Some(u16::from_be_bytes([self.bytes[2], self.bytes[3]]))
        } else {
            None
        }
    }

    /// Returns the 32-bit short form for SIG-assigned UUIDs.
    pub fn as_u32(&self) -> Option<u32> {
        if self.is_sig_assigned() {
            Some(u32::from_be_bytes([
                self.bytes[0],
                self.bytes[1],
                self.bytes[2],
                self.bytes[3],
            ]))
        } else {
            None
        }
    }
}

impl From<u16> for Uuid {
    fn from(uuid16: u16) -> Self {
        Uuid::from_u16(uuid16)
    }
}

impl From<u128> for Uuid {
    fn from(value: u128) -> Self {
        Uuid::from_u128(value)
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.bytes;
        write!(
            f,
            "{}-{}-{}-{}-{}",
            hex::encode(&b[0..4]),
            hex::encode(&b[4..6]),
            hex::encode(&b[6..8]),
            hex::encode(&b[8..10]),
            hex::encode(&b[10..16])
        )
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u16() {
            Some(short) => write!(f, "Uuid(0x{:04X})", short),
            None => write!(f, "Uuid({})", self),
        }
    }
}

/// Errors produced while parsing a textual UUID
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UuidParseError {
    #[error("invalid UUID length: {0} hex digits")]
    InvalidLength(usize),

    #[error("invalid UUID format: {0}")]
    InvalidFormat(String),
}

impl From<hex::FromHexError> for UuidParseError {
    fn from(err: hex::FromHexError) -> Self {
        UuidParseError::InvalidFormat(err.to_string())
    }
}

impl FromStr for Uuid {
    type Err = UuidParseError;

    /// Accepts "180A", "0000180A" and the 128-bit form with or without hyphens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.trim().chars().filter(|c| *c != '-').collect();
        if let Some(bad) = cleaned.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(UuidParseError::InvalidFormat(format!(
                "unexpected character {:?} in {:?}",
                bad, s
            )));
        }

        match cleaned.len() {
            4 => {
                let mut short = [0u8; 2];
                hex::decode_to_slice(&cleaned, &mut short)?;
                Ok(Uuid::from_u16(u16::from_be_bytes(short)))
            }
            8 => {
                let mut short = [0u8; 4];
                hex::decode_to_slice(&cleaned, &mut short)?;
                Ok(Uuid::from_u32(u32::from_be_bytes(short)))
            }
            32 => {
                let mut bytes = [0u8; 16];
                hex::decode_to_slice(&cleaned, &mut bytes)?;
                Ok(Uuid::from_bytes(bytes))
            }
            len => Err(UuidParseError::InvalidLength(len)),
        }
    }
}
