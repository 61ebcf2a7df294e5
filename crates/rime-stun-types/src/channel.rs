use crate::MessageError;

/// A TURN ChannelData frame (RFC 5766 §11.4).
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |         Channel Number        |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                       Application Data                        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    pub number: u16,
    pub data: Vec<u8>,
}

/// First channel number usable for bindings.
pub const CHANNEL_NUMBER_MIN: u16 = 0x4000;
/// Last channel number usable for bindings.
pub const CHANNEL_NUMBER_MAX: u16 = 0x7FFF;

impl ChannelData {
    pub fn new(number: u16, data: Vec<u8>) -> Self {
        ChannelData { number, data }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.extend_from_slice(&self.number.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, MessageError> {
        if buf.len() < 4 {
            return Err(MessageError::BadChannelData);
        }

        let number = u16::from_be_bytes([buf[0], buf[1]]);
        if !(CHANNEL_NUMBER_MIN..=CHANNEL_NUMBER_MAX).contains(&number) {
            return Err(MessageError::BadChannelData);
        }

        let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if buf.len() < 4 + len {
            return Err(MessageError::BadChannelData);
        }

        Ok(ChannelData {
            number,
            data: buf[4..4 + len].to_vec(),
        })
    }
}
