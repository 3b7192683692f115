//! Mailbox message types for the room service actors.

use super::connection::ConnectionHandle;
use super::room_table::RoomSnapshot;
use crate::errors::RoomError;

use common::protocol::ServerMessage;
use common::types::{ConnectionId, DurableIdentity, RoomCode};
use serde_json::Value;
use tokio::sync::oneshot;

/// Messages handled by the `RegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// A signaling channel opened.
    Register {
        connection: ConnectionHandle,
        respond_to: oneshot::Sender<()>,
    },

    /// Create a room with the caller as its only member.
    ///
    /// The registry writes the `room-created` or `request-failed` frame to the
    /// caller itself so it is ordered before any notification that follows.
    CreateRoom {
        request_id: u64,
        connection_id: ConnectionId,
        identity: DurableIdentity,
        respond_to: oneshot::Sender<Result<RoomCode, RoomError>>,
    },

    /// Join (or rejoin) a room by raw, un-normalized code.
    JoinRoom {
        request_id: u64,
        connection_id: ConnectionId,
        room_id: String,
        identity: DurableIdentity,
        respond_to: oneshot::Sender<Result<RoomCode, RoomError>>,
    },

    /// Leave the current room without a grace period.
    LeaveRoom { connection_id: ConnectionId },

    /// Relay a negotiation payload to one member of the sender's room.
    Relay {
        from: ConnectionId,
        to: ConnectionId,
        data: Value,
    },

    /// Broadcast an application payload to the rest of the sender's room.
    ApplicationSync { from: ConnectionId, payload: Value },

    /// A signaling channel closed.
    ConnectionClosed { connection_id: ConnectionId },

    /// Current registry counts.
    GetStats {
        respond_to: oneshot::Sender<RegistryStats>,
    },

    /// Snapshot of one room.
    GetRoom {
        room_id: RoomCode,
        respond_to: oneshot::Sender<Option<RoomSnapshot>>,
    },
}

/// Messages handled by a `ConnectionActor`.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionMessage {
    /// Write a frame to the client.
    Deliver(ServerMessage),
    /// Close the channel.
    Close { reason: &'static str },
}

/// Registry counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub rooms: usize,
    pub connections: usize,
    pub reconnecting: usize,
    pub pending_timers: usize,
}
