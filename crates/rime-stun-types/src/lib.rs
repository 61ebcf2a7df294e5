#![deny(unreachable_pub, unsafe_code)]

//! STUN/TURN message types and codec
//!
//! Implements the message layer shared by ICE connectivity checks, STUN
//! discovery and TURN relaying (RFC 5389, RFC 5245, RFC 5766), plus the
//! legacy RFC 3489 transaction-id scheme used by some older dialects.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |0 0|     STUN Message Type     |         Message Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Magic Cookie                          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                     Transaction ID (96 bits)                  |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use core::fmt;

pub mod attributes;
mod channel;
mod error;
mod message;

pub use channel::{ChannelData, CHANNEL_NUMBER_MAX, CHANNEL_NUMBER_MIN};
pub use error::MessageError;
pub use message::{IntegrityKey, Message, MessageBuilder};

/// The RFC 5389 magic cookie, fixed value of header bytes 4..8.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;

/// Hard upper bound for an encoded message, larger inputs are rejected.
pub const MAX_MESSAGE_SIZE: usize = 65_535;

/// STUN message class, encoded in two spread bits of the message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Class {
    Request,
    Indication,
    Success,
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0b00,
            Class::Indication => 0b01,
            Class::Success => 0b10,
            Class::Error => 0b11,
        }
    }

    fn from_bits(bits: u16) -> Self {
        match bits & 0b11 {
            0b00 => Class::Request,
            0b01 => Class::Indication,
            0b10 => Class::Success,
            _ => Class::Error,
        }
    }
}

/// STUN methods used by the ICE, STUN-discovery and TURN usages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Method {
    Binding = 0x001,
    Allocate = 0x003,
    Refresh = 0x004,
    Send = 0x006,
    Data = 0x007,
    CreatePermission = 0x008,
    ChannelBind = 0x009,
}

impl Method {
    fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0x001 => Method::Binding,
            0x003 => Method::Allocate,
            0x004 => Method::Refresh,
            0x006 => Method::Send,
            0x007 => Method::Data,
            0x008 => Method::CreatePermission,
            0x009 => Method::ChannelBind,
            _ => return None,
        })
    }
}

/// Splice class & method into the 14-bit message type field.
fn message_type(class: Class, method: Method) -> u16 {
    let m = method as u16;
    let c = class.bits();

    ((m & 0x1F80) << 2)
        | ((m & 0x0070) << 1)
        | (m & 0x000F)
        | ((c & 0b10) << 7)
        | ((c & 0b01) << 4)
}

fn split_message_type(ty: u16) -> (Class, u16) {
    let class = Class::from_bits(((ty >> 7) & 0b10) | ((ty >> 4) & 0b01));
    let method = ((ty >> 2) & 0x1F80) | ((ty >> 1) & 0x0070) | (ty & 0x000F);
    (class, method)
}

/// Transaction id including the 4 cookie bytes.
///
/// In RFC 5389 mode the first four bytes are the magic cookie and the random
/// part is 96 bits. Legacy RFC 3489 dialects (Google, MSN) randomize all
/// 128 bits; XOR'd attributes are computed against the actual header bytes so
/// both modes share one code path.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId([u8; 16]);

impl TransactionId {
    /// A fresh 96-bit transaction id with the RFC 5389 magic cookie.
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        bytes[4..].copy_from_slice(&rand::random::<[u8; 12]>());
        TransactionId(bytes)
    }

    /// A fully random 128-bit id for RFC 3489 legacy dialects.
    pub fn random_legacy() -> Self {
        TransactionId(rand::random())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        TransactionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Whether the id carries the RFC 5389 magic cookie.
    pub fn has_magic_cookie(&self) -> bool {
        self.0[..4] == MAGIC_COOKIE.to_be_bytes()
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Returns true if `buf` starts like a TURN ChannelData frame rather than a
/// STUN message (first two bytes >= 0x4000).
pub fn is_channel_data(buf: &[u8]) -> bool {
    buf.len() >= 2 && u16::from_be_bytes([buf[0], buf[1]]) >= 0x4000
}
