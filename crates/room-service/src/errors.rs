//! Room service error types.
//!
//! Error types map to signaling `ErrorCode` values for `request-failed`
//! responses. Internal details are logged server-side but not exposed to
//! clients.

use common::protocol::ErrorCode;
use thiserror::Error;

/// Room service error type.
///
/// Maps to signaling `ErrorCode` values:
/// - `RoomNotFound`: `room-not-found`
/// - `RoomFull`: `room-full`
/// - `AtCapacity`: `at-capacity`
/// - `InvalidRequest`: `invalid-request`
/// - `UnauthorizedTarget`, `Internal`: `internal-error` (never sent for
///   `UnauthorizedTarget`, which the relay drops silently)
#[derive(Debug, Error)]
pub enum RoomError {
    /// No live room has this code.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Room already has two live members.
    #[error("Room is full: {0}")]
    RoomFull(String),

    /// Live room ceiling reached.
    #[error("Service at capacity ({max_rooms} rooms)")]
    AtCapacity { max_rooms: usize },

    /// Relay target is not a member of the sender's room.
    #[error("Unauthorized relay target")]
    UnauthorizedTarget,

    /// Request was well-formed JSON but semantically invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Returns the signaling `ErrorCode` for this error.
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            RoomError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            RoomError::RoomFull(_) => ErrorCode::RoomFull,
            RoomError::AtCapacity { .. } => ErrorCode::AtCapacity,
            RoomError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            RoomError::UnauthorizedTarget | RoomError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            RoomError::RoomNotFound(_) => "Room not found".to_string(),
            RoomError::RoomFull(_) => "Room is full".to_string(),
            RoomError::AtCapacity { .. } => {
                "Server is at capacity, please try again later".to_string()
            }
            RoomError::InvalidRequest(msg) => msg.clone(),
            RoomError::UnauthorizedTarget | RoomError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }
}
