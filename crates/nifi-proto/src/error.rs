use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtoError {
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    #[error("buffer too short")]
    TooShort,
    #[error("payload length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("payload too large: {0}")]
    PayloadTooLarge(usize),
    #[error("unknown packet type {raw:#x} (payload {len} bytes)")]
    UnknownPacketType { raw: u32, len: u32 },
    #[error("unknown control opcode: {0}")]
    UnknownOpcode(u8),
    #[error("empty control message")]
    Empty,
    #[error("field out of range: {0}")]
    OutOfRange(&'static str),
}
