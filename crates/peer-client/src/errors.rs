//! Peer client error types.
//!
//! Request-level errors (`RoomNotFound`, `RoomFull`, ...) are returned to
//! the caller of the session handle. Negotiation and channel errors are
//! absorbed by the resilience controller and only surface, through
//! `SessionStatus::error`, once the recovery budget is exhausted.

use common::protocol::ErrorCode;
use thiserror::Error;

/// Errors raised by the media backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("Session description rejected: {0}")]
    Description(String),

    #[error("Candidate rejected: {0}")]
    Candidate(String),

    #[error("Track operation failed: {0}")]
    Track(String),

    #[error("Media backend failure: {0}")]
    Backend(String),
}

/// Peer client error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("Room not found")]
    RoomNotFound,

    #[error("Room is full")]
    RoomFull,

    #[error("Room service at capacity")]
    AtCapacity,

    /// Any other `request-failed` response.
    #[error("Request rejected ({code}): {message}")]
    RequestRejected { code: String, message: String },

    /// A negotiation step failed or arrived out of order.
    #[error("Negotiation failed: {0}")]
    NegotiationFailure(String),

    /// The signaling channel dropped.
    #[error("Signaling channel lost")]
    ChannelLost,

    /// Automatic recovery gave up.
    #[error("Recovery exhausted: {0}")]
    RecoveryExhausted(String),

    /// Connecting to or writing on the signaling channel failed.
    #[error("Signaling channel error: {0}")]
    Channel(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Request timed out")]
    RequestTimeout,

    /// The session actor is gone.
    #[error("Session closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Map a `request-failed` response to a client error.
    #[must_use]
    pub fn from_request_failed(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::RoomNotFound => ClientError::RoomNotFound,
            ErrorCode::RoomFull => ClientError::RoomFull,
            ErrorCode::AtCapacity => ClientError::AtCapacity,
            other => ClientError::RequestRejected {
                code: other.as_str().to_string(),
                message,
            },
        }
    }

    /// Short text suitable for showing to the user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            ClientError::RoomNotFound => "That room code does not exist".to_string(),
            ClientError::RoomFull => "That room already has two people in it".to_string(),
            ClientError::AtCapacity => {
                "The service is busy, please try again shortly".to_string()
            }
            ClientError::RequestRejected { message, .. } => message.clone(),
            ClientError::NegotiationFailure(_) | ClientError::Media(_) => {
                "Could not set up the call".to_string()
            }
            ClientError::ChannelLost | ClientError::Channel(_) => {
                "Lost connection to the server".to_string()
            }
            ClientError::RecoveryExhausted(_) => {
                "The connection could not be restored".to_string()
            }
            ClientError::RequestTimeout => "The server did not respond in time".to_string(),
            ClientError::SessionClosed => "The session has ended".to_string(),
            ClientError::Config(_) => "The client is misconfigured".to_string(),
        }
    }
}
