use thiserror::Error;

/// Reasons a byte buffer failed to parse or encode as a STUN message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("buffer too short to be a STUN message")]
    Truncated,
    #[error("not a STUN message")]
    NotStun,
    #[error("unknown method {0:#06x}")]
    UnknownMethod(u16),
    #[error("message length field does not match the buffer")]
    LengthMismatch,
    #[error("attribute {0:#06x} has a malformed value")]
    BadAttribute(u16),
    #[error("message exceeds the maximum encodable size")]
    TooLarge,
    #[error("invalid channel data frame")]
    BadChannelData,
}
