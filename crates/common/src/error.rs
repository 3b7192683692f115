//! Errors raised while parsing wire values.

use thiserror::Error;

/// Errors produced when validating or decoding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Room code has the wrong length or contains characters outside the alphabet.
    #[error("Invalid room code")]
    InvalidRoomCode,

    /// Durable identity is empty or too long.
    #[error("Invalid identity: {0}")]
    InvalidIdentity(&'static str),

    /// Frame could not be decoded.
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Result type alias using `ProtocolError`
pub type Result<T> = std::result::Result<T, ProtocolError>;
