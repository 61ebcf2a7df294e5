//! Typed STUN attributes.
//!
//! Each attribute knows its type code and how to encode/decode its value.
//! XOR'd address attributes are computed against the actual header bytes
//! (cookie + transaction id) so RFC 5389 and legacy 128-bit-id messages share
//! one code path.

use crate::{MessageError, TransactionId};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub const MAPPED_ADDRESS: u16 = 0x0001;
pub const USERNAME: u16 = 0x0006;
pub const MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ERROR_CODE: u16 = 0x0009;
pub const UNKNOWN_ATTRIBUTES: u16 = 0x000A;
pub const CHANNEL_NUMBER: u16 = 0x000C;
pub const LIFETIME: u16 = 0x000D;
pub const XOR_PEER_ADDRESS: u16 = 0x0012;
pub const DATA: u16 = 0x0013;
pub const REALM: u16 = 0x0014;
pub const NONCE: u16 = 0x0015;
pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const REQUESTED_TRANSPORT: u16 = 0x0019;
pub const DONT_FRAGMENT: u16 = 0x001A;
pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
pub const PRIORITY: u16 = 0x0024;
pub const USE_CANDIDATE: u16 = 0x0025;
pub const MS_VERSION: u16 = 0x8008;
pub const MS_XOR_MAPPED_ADDRESS: u16 = 0x8020;
pub const SOFTWARE: u16 = 0x8022;
pub const FINGERPRINT: u16 = 0x8028;
pub const ICE_CONTROLLED: u16 = 0x8029;
pub const ICE_CONTROLLING: u16 = 0x802A;

/// Per-message context handed to attribute codecs.
#[derive(Clone, Copy)]
pub struct AttrContext {
    tid: TransactionId,
}

impl AttrContext {
    pub(crate) fn new(tid: TransactionId) -> Self {
        AttrContext { tid }
    }

    /// The 16 header bytes XOR'd addresses are masked with.
    fn xor_mask(&self) -> &[u8; 16] {
        self.tid.as_bytes()
    }
}

pub trait Attribute: Sized {
    const TYPE: u16;

    fn encode(&self, ctx: AttrContext, out: &mut Vec<u8>);
    fn decode(ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError>;
}

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

fn encode_address(addr: SocketAddr, mask: Option<&[u8; 16]>, out: &mut Vec<u8>) {
    let zero = [0u8; 16];
    let mask = mask.unwrap_or(&zero);

    out.push(0);
    let port = addr.port() ^ u16::from_be_bytes([mask[0], mask[1]]);

    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(FAMILY_IPV4);
            out.extend_from_slice(&port.to_be_bytes());
            for (b, m) in ip.octets().iter().zip(mask) {
                out.push(b ^ m);
            }
        }
        IpAddr::V6(ip) => {
            out.push(FAMILY_IPV6);
            out.extend_from_slice(&port.to_be_bytes());
            for (b, m) in ip.octets().iter().zip(mask) {
                out.push(b ^ m);
            }
        }
    }
}

fn decode_address(
    ty: u16,
    value: &[u8],
    mask: Option<&[u8; 16]>,
) -> Result<SocketAddr, MessageError> {
    let zero = [0u8; 16];
    let mask = mask.unwrap_or(&zero);

    if value.len() < 4 {
        return Err(MessageError::BadAttribute(ty));
    }

    let port = u16::from_be_bytes([value[2], value[3]]) ^ u16::from_be_bytes([mask[0], mask[1]]);

    let ip = match value[1] {
        FAMILY_IPV4 if value.len() == 8 => {
            let mut octets = [0u8; 4];
            for (o, (b, m)) in octets.iter_mut().zip(value[4..].iter().zip(mask)) {
                *o = b ^ m;
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 if value.len() == 20 => {
            let mut octets = [0u8; 16];
            for (o, (b, m)) in octets.iter_mut().zip(value[4..].iter().zip(mask)) {
                *o = b ^ m;
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(MessageError::BadAttribute(ty)),
    };

    Ok(SocketAddr::new(ip, port))
}

macro_rules! address_attr {
    ($name:ident, $ty:expr, xor) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub SocketAddr);

        impl Attribute for $name {
            const TYPE: u16 = $ty;

            fn encode(&self, ctx: AttrContext, out: &mut Vec<u8>) {
                encode_address(self.0, Some(ctx.xor_mask()), out);
            }

            fn decode(ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
                decode_address(Self::TYPE, value, Some(ctx.xor_mask())).map($name)
            }
        }
    };
    ($name:ident, $ty:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub SocketAddr);

        impl Attribute for $name {
            const TYPE: u16 = $ty;

            fn encode(&self, _ctx: AttrContext, out: &mut Vec<u8>) {
                encode_address(self.0, None, out);
            }

            fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
                decode_address(Self::TYPE, value, None).map($name)
            }
        }
    };
}

address_attr!(MappedAddress, MAPPED_ADDRESS);
address_attr!(XorMappedAddress, XOR_MAPPED_ADDRESS, xor);
address_attr!(XorPeerAddress, XOR_PEER_ADDRESS, xor);
address_attr!(XorRelayedAddress, XOR_RELAYED_ADDRESS, xor);
address_attr!(MsXorMappedAddress, MS_XOR_MAPPED_ADDRESS, xor);

macro_rules! string_attr {
    ($name:ident, $ty:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                $name(value.into())
            }
        }

        impl Attribute for $name {
            const TYPE: u16 = $ty;

            fn encode(&self, _ctx: AttrContext, out: &mut Vec<u8>) {
                out.extend_from_slice(self.0.as_bytes());
            }

            fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
                std::str::from_utf8(value)
                    .map(|s| $name(s.to_owned()))
                    .map_err(|_| MessageError::BadAttribute(Self::TYPE))
            }
        }
    };
}

string_attr!(Username, USERNAME);
string_attr!(Realm, REALM);
string_attr!(Nonce, NONCE);
string_attr!(Software, SOFTWARE);

macro_rules! u32_attr {
    ($name:ident, $ty:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub u32);

        impl Attribute for $name {
            const TYPE: u16 = $ty;

            fn encode(&self, _ctx: AttrContext, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.0.to_be_bytes());
            }

            fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
                let bytes: [u8; 4] = value
                    .try_into()
                    .map_err(|_| MessageError::BadAttribute(Self::TYPE))?;
                Ok($name(u32::from_be_bytes(bytes)))
            }
        }
    };
}

u32_attr!(Priority, PRIORITY);
u32_attr!(Lifetime, LIFETIME);
u32_attr!(MsVersion, MS_VERSION);

macro_rules! u64_attr {
    ($name:ident, $ty:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub u64);

        impl Attribute for $name {
            const TYPE: u16 = $ty;

            fn encode(&self, _ctx: AttrContext, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.0.to_be_bytes());
            }

            fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
                let bytes: [u8; 8] = value
                    .try_into()
                    .map_err(|_| MessageError::BadAttribute(Self::TYPE))?;
                Ok($name(u64::from_be_bytes(bytes)))
            }
        }
    };
}

u64_attr!(IceControlled, ICE_CONTROLLED);
u64_attr!(IceControlling, ICE_CONTROLLING);

macro_rules! flag_attr {
    ($name:ident, $ty:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name;

        impl Attribute for $name {
            const TYPE: u16 = $ty;

            fn encode(&self, _ctx: AttrContext, _out: &mut Vec<u8>) {}

            fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
                if value.is_empty() {
                    Ok($name)
                } else {
                    Err(MessageError::BadAttribute(Self::TYPE))
                }
            }
        }
    };
}

flag_attr!(UseCandidate, USE_CANDIDATE);
flag_attr!(DontFragment, DONT_FRAGMENT);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCode {
    pub number: u16,
    pub reason: String,
}

impl ErrorCode {
    pub fn new(number: u16, reason: impl Into<String>) -> Self {
        ErrorCode {
            number,
            reason: reason.into(),
        }
    }
}

impl Attribute for ErrorCode {
    const TYPE: u16 = ERROR_CODE;

    fn encode(&self, _ctx: AttrContext, out: &mut Vec<u8>) {
        out.extend_from_slice(&[0, 0]);
        out.push((self.number / 100) as u8);
        out.push((self.number % 100) as u8);
        out.extend_from_slice(self.reason.as_bytes());
    }

    fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
        if value.len() < 4 {
            return Err(MessageError::BadAttribute(Self::TYPE));
        }
        let class = (value[2] & 0x07) as u16;
        let number = class * 100 + (value[3] % 100) as u16;
        let reason = std::str::from_utf8(&value[4..])
            .map_err(|_| MessageError::BadAttribute(Self::TYPE))?
            .to_owned();
        Ok(ErrorCode { number, reason })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAttributes(pub Vec<u16>);

impl Attribute for UnknownAttributes {
    const TYPE: u16 = UNKNOWN_ATTRIBUTES;

    fn encode(&self, _ctx: AttrContext, out: &mut Vec<u8>) {
        for ty in &self.0 {
            out.extend_from_slice(&ty.to_be_bytes());
        }
    }

    fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
        if value.len() % 2 != 0 {
            return Err(MessageError::BadAttribute(Self::TYPE));
        }
        Ok(UnknownAttributes(
            value
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelNumber(pub u16);

impl Attribute for ChannelNumber {
    const TYPE: u16 = CHANNEL_NUMBER;

    fn encode(&self, _ctx: AttrContext, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
    }

    fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
        if value.len() != 4 {
            return Err(MessageError::BadAttribute(Self::TYPE));
        }
        Ok(ChannelNumber(u16::from_be_bytes([value[0], value[1]])))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data(pub Vec<u8>);

impl Attribute for Data {
    const TYPE: u16 = DATA;

    fn encode(&self, _ctx: AttrContext, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }

    fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
        Ok(Data(value.to_vec()))
    }
}

pub const TRANSPORT_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestedTransport(pub u8);

impl Attribute for RequestedTransport {
    const TYPE: u16 = REQUESTED_TRANSPORT;

    fn encode(&self, _ctx: AttrContext, out: &mut Vec<u8>) {
        out.push(self.0);
        out.extend_from_slice(&[0, 0, 0]);
    }

    fn decode(_ctx: AttrContext, value: &[u8]) -> Result<Self, MessageError> {
        if value.len() != 4 {
            return Err(MessageError::BadAttribute(Self::TYPE));
        }
        Ok(RequestedTransport(value[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Class, Message, MessageBuilder, Method};

    #[test]
    fn all_attribute_types_survive_a_roundtrip() {
        let tid = TransactionId::random();
        let mut builder = MessageBuilder::new(Class::Request, Method::Allocate, tid);

        builder.add_attr(&MappedAddress("198.51.100.4:9".parse().unwrap()));
        builder.add_attr(&XorPeerAddress("198.51.100.4:4242".parse().unwrap()));
        builder.add_attr(&XorRelayedAddress("[2001:db8::1]:555".parse().unwrap()));
        builder.add_attr(&Realm::new("example.org"));
        builder.add_attr(&Nonce::new("obMatJos2AAACf//499k954d6OL34oL9FSTvy64sA"));
        builder.add_attr(&Lifetime(600));
        builder.add_attr(&ChannelNumber(0x4000));
        builder.add_attr(&Data(vec![1, 2, 3, 4, 5]));
        builder.add_attr(&RequestedTransport(TRANSPORT_UDP));
        builder.add_attr(&DontFragment);
        builder.add_attr(&UnknownAttributes(vec![0x0024, 0x0025]));
        builder.add_attr(&IceControlled(42));
        builder.add_attr(&MsVersion(2));

        let msg = Message::parse(builder.finish()).unwrap();

        assert_eq!(
            msg.attribute::<MappedAddress>().unwrap().unwrap().0,
            "198.51.100.4:9".parse().unwrap()
        );
        assert_eq!(
            msg.attribute::<XorPeerAddress>().unwrap().unwrap().0,
            "198.51.100.4:4242".parse().unwrap()
        );
        assert_eq!(
            msg.attribute::<XorRelayedAddress>().unwrap().unwrap().0,
            "[2001:db8::1]:555".parse().unwrap()
        );
        assert_eq!(msg.attribute::<Realm>().unwrap().unwrap().0, "example.org");
        assert_eq!(msg.attribute::<Lifetime>().unwrap().unwrap().0, 600);
        assert_eq!(msg.attribute::<ChannelNumber>().unwrap().unwrap().0, 0x4000);
        assert_eq!(msg.attribute::<Data>().unwrap().unwrap().0, vec![1, 2, 3, 4, 5]);
        assert_eq!(
            msg.attribute::<RequestedTransport>().unwrap().unwrap().0,
            TRANSPORT_UDP
        );
        assert!(msg.attribute::<DontFragment>().is_some());
        assert_eq!(
            msg.attribute::<UnknownAttributes>().unwrap().unwrap().0,
            vec![0x0024, 0x0025]
        );
        assert_eq!(msg.attribute::<IceControlled>().unwrap().unwrap().0, 42);
        assert_eq!(msg.attribute::<MsVersion>().unwrap().unwrap().0, 2);
        assert!(msg.attribute::<UseCandidate>().is_none());
    }

    #[test]
    fn long_term_key_is_md5_of_credentials() {
        let key = crate::IntegrityKey::long_term("user", "realm", "pass");
        assert_eq!(key.as_bytes().len(), 16);
        assert_eq!(
            key.as_bytes(),
            md5::compute(b"user:realm:pass").0.as_slice()
        );
    }
}
