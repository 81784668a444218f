//! Transport error types.
//!
//! Only setup failures and rejected sends are errors. Per-frame outcomes
//! (no data, host gone, partial replies) are ordinary return values.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MpError {
    #[error("frame too large ({len} bytes, max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("no active session")]
    NotActive,
}

#[derive(Error, Debug)]
pub enum LanError {
    #[error("a session is already active")]
    AlreadyActive,

    #[error("invalid player count {0} (1-16)")]
    InvalidPlayerCount(usize),

    #[error("could not resolve host address {0}")]
    BadAddress(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timed out waiting for the host")]
    Timeout,

    #[error("the session is full")]
    SessionFull,

    #[error("protocol version mismatch (ours {ours}, theirs {theirs})")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("connection refused by host")]
    Refused,

    #[error("endpoint setup failed: {0}")]
    Endpoint(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
