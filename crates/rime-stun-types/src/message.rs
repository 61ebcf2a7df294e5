use crate::attributes::{AttrContext, Attribute, FINGERPRINT, MESSAGE_INTEGRITY};
use crate::{message_type, split_message_type, Class, Method, TransactionId};
use crate::{MessageError, MAX_MESSAGE_SIZE};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::ops::Range;

const HEADER_LEN: usize = 20;
const FINGERPRINT_XOR: u32 = 0x5354_554E;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

type HmacSha1 = Hmac<Sha1>;

/// Key for MESSAGE-INTEGRITY computation.
pub struct IntegrityKey(Vec<u8>);

impl IntegrityKey {
    /// Short-term credential key, the raw password bytes.
    pub fn short_term(pwd: &str) -> Self {
        IntegrityKey(pwd.as_bytes().to_vec())
    }

    /// Long-term credential key, `MD5(username ":" realm ":" password)`.
    pub fn long_term(username: &str, realm: &str, password: &str) -> Self {
        let digest = md5::compute(format!("{username}:{realm}:{password}").as_bytes());
        IntegrityKey(digest.0.to_vec())
    }

    /// Key from raw bytes, for credentials that are not UTF-8 strings.
    pub fn raw(key: impl Into<Vec<u8>>) -> Self {
        IntegrityKey(key.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// HMAC-SHA1 over `buf[..end]` with the header length field patched to
/// `patched_len`, as both integrity generation and validation require.
fn integrity_hmac(key: &IntegrityKey, buf: &[u8], end: usize, patched_len: u16) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key.as_bytes()).expect("hmac accepts any key size");
    mac.update(&buf[..2]);
    mac.update(&patched_len.to_be_bytes());
    mac.update(&buf[4..end]);
    mac.finalize().into_bytes().into()
}

fn fingerprint_crc(buf: &[u8], end: usize, patched_len: u16) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&buf[..2]);
    digest.update(&patched_len.to_be_bytes());
    digest.update(&buf[4..end]);
    digest.finalize() ^ FINGERPRINT_XOR
}

/// Incrementally builds an encoded STUN message.
pub struct MessageBuilder {
    buf: Vec<u8>,
    tid: TransactionId,
}

impl MessageBuilder {
    pub fn new(class: Class, method: Method, tid: TransactionId) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&message_type(class, method).to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(tid.as_bytes());

        MessageBuilder { buf, tid }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.tid
    }

    pub fn add_attr<A: Attribute>(&mut self, attr: &A) {
        let start = self.buf.len();
        self.buf.extend_from_slice(&A::TYPE.to_be_bytes());
        self.buf.extend_from_slice(&[0, 0]);

        let ctx = AttrContext::new(self.tid);
        attr.encode(ctx, &mut self.buf);

        let value_len = self.buf.len() - start - 4;
        debug_assert!(value_len <= u16::MAX as usize);
        self.buf[start + 2..start + 4].copy_from_slice(&(value_len as u16).to_be_bytes());

        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }
    }

    /// Appends MESSAGE-INTEGRITY keyed on `key`. Must come after every other
    /// attribute except FINGERPRINT.
    pub fn add_message_integrity(&mut self, key: &IntegrityKey) {
        let attr_start = self.buf.len();
        let patched_len = (attr_start - HEADER_LEN + 24) as u16;
        let mac = integrity_hmac(key, &self.buf, attr_start, patched_len);

        self.buf.extend_from_slice(&MESSAGE_INTEGRITY.to_be_bytes());
        self.buf.extend_from_slice(&20u16.to_be_bytes());
        self.buf.extend_from_slice(&mac);
    }

    /// Appends FINGERPRINT. Must be the final attribute.
    pub fn add_fingerprint(&mut self) {
        let attr_start = self.buf.len();
        let patched_len = (attr_start - HEADER_LEN + 8) as u16;
        let crc = fingerprint_crc(&self.buf, attr_start, patched_len);

        self.buf.extend_from_slice(&FINGERPRINT.to_be_bytes());
        self.buf.extend_from_slice(&4u16.to_be_bytes());
        self.buf.extend_from_slice(&crc.to_be_bytes());
    }

    pub fn finish(mut self) -> Vec<u8> {
        let len = (self.buf.len() - HEADER_LEN) as u16;
        self.buf[2..4].copy_from_slice(&len.to_be_bytes());
        self.buf
    }
}

/// A parsed STUN message holding the raw bytes plus an attribute index.
pub struct Message {
    buf: Vec<u8>,
    class: Class,
    method: Method,
    tid: TransactionId,
    /// (attribute type, value range); order preserved
    attrs: Vec<(u16, Range<usize>)>,
}

impl Message {
    pub fn parse(buf: Vec<u8>) -> Result<Self, MessageError> {
        if buf.len() < HEADER_LEN {
            return Err(MessageError::Truncated);
        }
        if buf.len() > MAX_MESSAGE_SIZE {
            return Err(MessageError::TooLarge);
        }
        if buf[0] & 0xC0 != 0 {
            return Err(MessageError::NotStun);
        }

        let ty = u16::from_be_bytes([buf[0], buf[1]]);
        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;

        if len % 4 != 0 || HEADER_LEN + len != buf.len() {
            return Err(MessageError::LengthMismatch);
        }

        let (class, raw_method) = split_message_type(ty);
        let method = Method::from_u16(raw_method)
            .ok_or(MessageError::UnknownMethod(raw_method))?;

        let mut tid = [0u8; 16];
        tid.copy_from_slice(&buf[4..20]);

        let mut attrs = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < buf.len() {
            if pos + 4 > buf.len() {
                return Err(MessageError::Truncated);
            }
            let attr_ty = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let value_len = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]) as usize;
            let value_start = pos + 4;
            let value_end = value_start + value_len;
            if value_end > buf.len() {
                return Err(MessageError::Truncated);
            }
            attrs.push((attr_ty, value_start..value_end));
            pos = value_end + (4 - value_len % 4) % 4;
        }

        Ok(Message {
            buf,
            class,
            method,
            tid: TransactionId::from_bytes(tid),
            attrs,
        })
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.tid
    }

    /// Decode the first attribute of type `A`. `None` if absent.
    pub fn attribute<A: Attribute>(&self) -> Option<Result<A, MessageError>> {
        let (_, range) = self.attrs.iter().find(|(ty, _)| *ty == A::TYPE)?;
        let ctx = AttrContext::new(self.tid);
        Some(A::decode(ctx, &self.buf[range.clone()]))
    }

    pub fn has_attribute(&self, ty: u16) -> bool {
        self.attrs.iter().any(|(t, _)| *t == ty)
    }

    /// Comprehension-required attribute types (< 0x8000) not in `known`.
    pub fn unknown_comprehension_required(&self, known: &[u16]) -> Vec<u16> {
        self.attrs
            .iter()
            .map(|(ty, _)| *ty)
            .filter(|ty| *ty < 0x8000 && !known.contains(ty))
            .collect()
    }

    pub fn has_integrity(&self) -> bool {
        self.has_attribute(MESSAGE_INTEGRITY)
    }

    /// Validates MESSAGE-INTEGRITY against `key`. False if the attribute is
    /// missing or the HMAC does not match.
    pub fn verify_integrity(&self, key: &IntegrityKey) -> bool {
        let Some((_, range)) = self.attrs.iter().find(|(ty, _)| *ty == MESSAGE_INTEGRITY) else {
            return false;
        };
        if range.len() != 20 {
            return false;
        }

        let attr_start = range.start - 4;
        let patched_len = (attr_start - HEADER_LEN + 24) as u16;
        let expected = integrity_hmac(key, &self.buf, attr_start, patched_len);

        // not timing sensitive: short-term credentials are per-session random
        expected[..] == self.buf[range.clone()]
    }

    pub fn has_fingerprint(&self) -> bool {
        self.has_attribute(FINGERPRINT)
    }

    pub fn verify_fingerprint(&self) -> bool {
        let Some((_, range)) = self.attrs.iter().find(|(ty, _)| *ty == FINGERPRINT) else {
            return false;
        };
        if range.len() != 4 {
            return false;
        }

        let attr_start = range.start - 4;
        let patched_len = (attr_start - HEADER_LEN + 8) as u16;
        let expected = fingerprint_crc(&self.buf, attr_start, patched_len);

        expected.to_be_bytes()[..] == self.buf[range.clone()]
    }
}
