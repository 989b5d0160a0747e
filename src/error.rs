//! Error taxonomy for the DHT core.
//!
//! [`ParseError`] describes *why* a byte sequence failed to decode; [`Error`]
//! is the `Result` error type returned by every public fallible function and
//! additionally carries the runtime's protocol/transport/timeout failures.

use thiserror::Error;

/// Reasons a Bencode value, compact contact, or hex string failed to decode.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("integer has no digits")]
    EmptyInteger,
    #[error("malformed integer digits")]
    MalformedInteger,
    #[error("negative byte string length")]
    NegativeLength,
    #[error("byte string length {len} exceeds remaining input of {remaining} bytes")]
    LengthExceedsInput { len: i64, remaining: usize },
    #[error("dictionary key is not a byte string")]
    NonStringKey,
    #[error("unrecognized bencode type byte {0:#04x}")]
    UnknownTypeByte(u8),
    #[error("expected {expected} bytes, got {got}")]
    WrongLength { expected: usize, got: usize },
    #[error("hex string must be exactly 40 characters, got {0}")]
    WrongHexLength(usize),
    #[error("invalid hex digit")]
    InvalidHex,
    #[error("ipv4 address required, got an ipv6 address")]
    NotIpv4,
}

/// Top-level error type for the DHT core's public API.
#[derive(Debug, Error)]
pub enum Error {
    #[error("bencode decode failed: {0}")]
    Parse(#[from] ParseError),
    #[error("krpc protocol error: {0}")]
    Protocol(String),
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    #[error("handler error: {0}")]
    Server(String),
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("request timed out")]
    Timeout,
}

impl Error {
    /// Maps this error onto the KRPC error code taxonomy from the wire spec.
    pub fn krpc_code(&self) -> i64 {
        match self {
            Error::Parse(_) | Error::Protocol(_) => 203,
            Error::UnknownMethod(_) => 204,
            Error::Server(_) | Error::Transport(_) | Error::Timeout => 202,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
