//! Relay authorization.
//!
//! A payload may only travel between two members of the same room. Sender
//! and target membership are both looked up in the room table; nothing the
//! client sends about rooms is trusted.

use super::room_table::{MemberState, RoomTable};

use common::types::{ConnectionId, RoomCode};

/// Why a relay request was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRejection {
    /// The sender is not in any room.
    SenderNotInRoom,
    /// The target is not in the sender's room.
    TargetNotInRoom,
    /// The sender addressed itself.
    SelfTarget,
}

impl RelayRejection {
    /// Metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            RelayRejection::SenderNotInRoom => "sender_not_in_room",
            RelayRejection::TargetNotInRoom => "target_not_in_room",
            RelayRejection::SelfTarget => "self_target",
        }
    }
}

/// Where an authorized signal goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalRoute {
    pub room_id: RoomCode,
    /// `false` while the target is inside its grace period. The payload is
    /// dropped then; the peer renegotiates after it rejoins.
    pub target_live: bool,
}

/// Authorize a point-to-point signal.
///
/// # Errors
///
/// Returns the [`RelayRejection`] when sender and target do not share a room.
pub fn authorize_signal(
    table: &RoomTable,
    from: &ConnectionId,
    to: &ConnectionId,
) -> Result<SignalRoute, RelayRejection> {
    let room_id = table
        .room_of(from)
        .ok_or(RelayRejection::SenderNotInRoom)?;

    if from == to {
        return Err(RelayRejection::SelfTarget);
    }

    let target_state = table
        .member_state(room_id, to)
        .ok_or(RelayRejection::TargetNotInRoom)?;

    Ok(SignalRoute {
        room_id: room_id.clone(),
        target_live: target_state == MemberState::Active,
    })
}

/// Live recipients of an application-sync broadcast.
///
/// # Errors
///
/// Returns `RelayRejection::SenderNotInRoom` if the sender has no room.
pub fn sync_targets(
    table: &RoomTable,
    from: &ConnectionId,
) -> Result<(RoomCode, Vec<ConnectionId>), RelayRejection> {
    let room_id = table
        .room_of(from)
        .ok_or(RelayRejection::SenderNotInRoom)?
        .clone();
    let targets = table.other_live_members(&room_id, from);
    Ok((room_id, targets))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::room_table::FixedCodes;
    use common::types::DurableIdentity;

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    fn identity(s: &str) -> DurableIdentity {
        DurableIdentity::new(s).unwrap()
    }

    /// Two rooms: (a, b) in K3M9PQXT and (c) in ABCDEFGH, plus a roomless d.
    fn two_rooms() -> (RoomTable, [ConnectionId; 4]) {
        let mut table = RoomTable::new(
            500,
            Box::new(FixedCodes::new([code("K3M9PQXT"), code("ABCDEFGH")])),
        );
        let ids = [
            ConnectionId::new(),
            ConnectionId::new(),
            ConnectionId::new(),
            ConnectionId::new(),
        ];
        let [a, b, c, _] = ids;
        table.create_room(a, identity("a")).unwrap();
        table.join_room(b, "K3M9PQXT", identity("b")).unwrap();
        table.create_room(c, identity("c")).unwrap();
        (table, ids)
    }

    #[test]
    fn test_same_room_signal_is_authorized() {
        let (table, [a, b, _, _]) = two_rooms();

        let route = authorize_signal(&table, &a, &b).unwrap();
        assert_eq!(route.room_id, code("K3M9PQXT"));
        assert!(route.target_live);
    }

    #[test]
    fn test_cross_room_signal_is_rejected() {
        let (table, [a, _, c, d]) = two_rooms();

        assert_eq!(
            authorize_signal(&table, &a, &c),
            Err(RelayRejection::TargetNotInRoom)
        );
        assert_eq!(
            authorize_signal(&table, &a, &d),
            Err(RelayRejection::TargetNotInRoom)
        );
        assert_eq!(
            authorize_signal(&table, &d, &a),
            Err(RelayRejection::SenderNotInRoom)
        );
        assert_eq!(
            authorize_signal(&table, &a, &a),
            Err(RelayRejection::SelfTarget)
        );
    }

    #[test]
    fn test_reconnecting_target_is_authorized_but_not_live() {
        let (mut table, [a, b, _, _]) = two_rooms();
        table.mark_reconnecting(&b).unwrap();

        let route = authorize_signal(&table, &a, &b).unwrap();
        assert!(!route.target_live);
    }

    #[test]
    fn test_sync_targets_exclude_sender_and_other_rooms() {
        let (table, [a, b, c, d]) = two_rooms();

        assert_eq!(
            sync_targets(&table, &a).unwrap(),
            (code("K3M9PQXT"), vec![b])
        );
        assert_eq!(sync_targets(&table, &c).unwrap().1, Vec::new());
        assert_eq!(
            sync_targets(&table, &d),
            Err(RelayRejection::SenderNotInRoom)
        );
    }
}
