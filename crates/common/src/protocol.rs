//! Signaling protocol spoken over the WebSocket channel.
//!
//! Frames are JSON text, adjacently tagged:
//!
//! ```json
//! {"event": "join-room", "data": {"request_id": 2, "room_id": "K3M9PQXT", "identity": "guest-1"}}
//! ```
//!
//! `signal` and `application-sync` payloads are opaque to the room service;
//! it only checks who may send them to whom.

use crate::error::ProtocolError;
use crate::types::{ConnectionId, RoomCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Create a new room with the caller as its only member.
    ///
    /// `identity` is validated by the service (see
    /// [`DurableIdentity::new`](crate::types::DurableIdentity::new)) so a bad
    /// value is answered under its `request_id` instead of failing decode.
    CreateRoom { request_id: u64, identity: String },

    /// Join (or rejoin) an existing room.
    ///
    /// `room_id` is raw user input; the service normalizes it.
    JoinRoom {
        request_id: u64,
        room_id: String,
        identity: String,
    },

    /// Leave the current room immediately (no grace period).
    LeaveRoom,

    /// Relay an opaque negotiation payload to another member of the room.
    Signal { to: ConnectionId, data: Value },

    /// Broadcast an opaque application payload to the rest of the room.
    ApplicationSync { payload: Value },
}

/// Messages sent by the room service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every channel.
    Welcome { connection_id: ConnectionId },

    RoomCreated {
        request_id: u64,
        room_id: RoomCode,
    },

    RoomJoined {
        request_id: u64,
        room_id: RoomCode,
    },

    RequestFailed {
        request_id: u64,
        code: ErrorCode,
        message: String,
    },

    /// Another connection joined the caller's room.
    PeerJoined { connection_id: ConnectionId },

    /// A member left the caller's room (explicitly or after its grace period).
    PeerLeft { connection_id: ConnectionId },

    Signal { from: ConnectionId, data: Value },

    ApplicationSync { from: ConnectionId, payload: Value },
}

impl ClientMessage {
    /// Short name for log fields and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom { .. } => "create-room",
            ClientMessage::JoinRoom { .. } => "join-room",
            ClientMessage::LeaveRoom => "leave-room",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::ApplicationSync { .. } => "application-sync",
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the frame is not a valid message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

impl ServerMessage {
    /// Short name for log fields and metric labels.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::RoomCreated { .. } => "room-created",
            ServerMessage::RoomJoined { .. } => "room-joined",
            ServerMessage::RequestFailed { .. } => "request-failed",
            ServerMessage::PeerJoined { .. } => "peer-joined",
            ServerMessage::PeerLeft { .. } => "peer-left",
            ServerMessage::Signal { .. } => "signal",
            ServerMessage::ApplicationSync { .. } => "application-sync",
        }
    }

    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if the frame is not a valid message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if serialization fails.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// Error codes carried by `request-failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    RoomNotFound,
    RoomFull,
    AtCapacity,
    InvalidRequest,
    InternalError,
}

impl ErrorCode {
    /// Returns the code as a string for metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RoomNotFound => "room_not_found",
            ErrorCode::RoomFull => "room_full",
            ErrorCode::AtCapacity => "at_capacity",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

/// One relay/STUN endpoint descriptor, shaped like the browser `RTCIceServer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A credential-less STUN entry.
    #[must_use]
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Response body of `GET /ice-servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerList {
    pub ice_servers: Vec<IceServer>,
    /// How long the credentials stay valid.
    pub ttl_seconds: u64,
}
