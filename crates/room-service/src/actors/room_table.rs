//! In-memory room table owned by the `RegistryActor`.
//!
//! Identity and transport are keyed separately:
//!
//! ```text
//! DurableIdentity ──identity_to_room──▶ RoomCode ──rooms──▶ Room { members }
//! ConnectionId ──connection_to_identity──▶ DurableIdentity
//! ```
//!
//! A member entry is either `Active` (live channel) or `Reconnecting` (channel
//! closed, grace timer armed). Only `Active` entries count toward the
//! two-member limit; a `Reconnecting` entry keeps the identity's claim on the
//! room until it rejoins or the timer fires.
//!
//! An identity holds at most one membership at a time. Creating or joining a
//! room removes any earlier entries of the same identity.
//!
//! The table is plain synchronous state. It never sends anything; operations
//! return [`Departure`] values describing who must be told what.

use crate::errors::RoomError;

use chrono::{DateTime, Utc};
use common::types::{ConnectionId, DurableIdentity, RoomCode};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeMap, HashMap};
#[cfg(any(test, feature = "test-utils"))]
use std::collections::VecDeque;

/// Maximum number of live members in a room.
pub const MAX_ROOM_MEMBERS: usize = 2;

/// Attempts at drawing an unused room code before giving up.
const MAX_CODE_ATTEMPTS: usize = 32;

/// Source of candidate room codes.
pub trait RoomCodeSource: Send {
    fn next_code(&mut self) -> RoomCode;
}

/// Random codes from a seeded-from-entropy `StdRng`.
pub struct RandomCodes(StdRng);

impl RandomCodes {
    #[must_use]
    pub fn new() -> Self {
        Self(StdRng::from_entropy())
    }
}

impl Default for RandomCodes {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomCodeSource for RandomCodes {
    fn next_code(&mut self) -> RoomCode {
        RoomCode::generate(&mut self.0)
    }
}

/// Predetermined codes, falling back to random ones once exhausted.
#[cfg(any(test, feature = "test-utils"))]
pub struct FixedCodes {
    queue: VecDeque<RoomCode>,
    fallback: RandomCodes,
}

#[cfg(any(test, feature = "test-utils"))]
impl FixedCodes {
    #[must_use]
    pub fn new(codes: impl IntoIterator<Item = RoomCode>) -> Self {
        Self {
            queue: codes.into_iter().collect(),
            fallback: RandomCodes::new(),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl RoomCodeSource for FixedCodes {
    fn next_code(&mut self) -> RoomCode {
        self.queue
            .pop_front()
            .unwrap_or_else(|| self.fallback.next_code())
    }
}

/// Membership state of one connection within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    /// Channel is open.
    Active,
    /// Channel closed; slot held for the grace period.
    Reconnecting,
}

#[derive(Debug)]
struct Member {
    identity: DurableIdentity,
    state: MemberState,
}

#[derive(Debug)]
struct Room {
    members: BTreeMap<ConnectionId, Member>,
    created_at: DateTime<Utc>,
}

impl Room {
    fn effective_count(&self) -> usize {
        self.members
            .values()
            .filter(|m| m.state == MemberState::Active)
            .count()
    }

    fn live_members(&self) -> Vec<ConnectionId> {
        self.members
            .iter()
            .filter(|(_, m)| m.state == MemberState::Active)
            .map(|(id, _)| *id)
            .collect()
    }

    fn entries_of(&self, identity: &DurableIdentity) -> Vec<ConnectionId> {
        self.members
            .iter()
            .filter(|(_, m)| &m.identity == identity)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// Point-in-time view of a room (for state queries and tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_id: RoomCode,
    pub members: Vec<(ConnectionId, MemberState)>,
    pub effective_members: usize,
    pub created_at: DateTime<Utc>,
}

/// Consequence of a member leaving a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// The room has no members left and was deleted.
    RoomDeleted { room_id: RoomCode },
    /// The remaining live members must receive `peer-left`.
    PeerLeft {
        room_id: RoomCode,
        departed: ConnectionId,
        notify: Vec<ConnectionId>,
    },
}

/// Result of a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room_id: RoomCode,
    /// The identity was inside its grace window for this room.
    pub reconnected: bool,
    /// Stale entries of the same identity that were replaced.
    pub replaced: Vec<ConnectionId>,
    /// Live members to receive `peer-joined`.
    pub notify: Vec<ConnectionId>,
    /// Departures from rooms the caller held before this join.
    pub departures: Vec<Departure>,
}

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub room_id: RoomCode,
    /// Departures from rooms the caller held before this create.
    pub departures: Vec<Departure>,
}

/// The room table.
pub struct RoomTable {
    max_rooms: usize,
    codes: Box<dyn RoomCodeSource>,
    rooms: HashMap<RoomCode, Room>,
    identity_to_room: HashMap<DurableIdentity, RoomCode>,
    connection_to_identity: HashMap<ConnectionId, DurableIdentity>,
}

impl RoomTable {
    /// Create an empty table.
    #[must_use]
    pub fn new(max_rooms: usize, codes: Box<dyn RoomCodeSource>) -> Self {
        Self {
            max_rooms,
            codes,
            rooms: HashMap::new(),
            identity_to_room: HashMap::new(),
            connection_to_identity: HashMap::new(),
        }
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of member entries currently held in `Reconnecting` state.
    #[must_use]
    pub fn reconnecting_count(&self) -> usize {
        self.rooms
            .values()
            .flat_map(|r| r.members.values())
            .filter(|m| m.state == MemberState::Reconnecting)
            .count()
    }

    /// Room the connection is a member of (any state).
    #[must_use]
    pub fn room_of(&self, connection_id: &ConnectionId) -> Option<&RoomCode> {
        let identity = self.connection_to_identity.get(connection_id)?;
        let room_id = self.identity_to_room.get(identity)?;
        let room = self.rooms.get(room_id)?;
        room.members.contains_key(connection_id).then_some(room_id)
    }

    /// Membership state of a connection in a room.
    #[must_use]
    pub fn member_state(&self, room_id: &RoomCode, connection_id: &ConnectionId) -> Option<MemberState> {
        self.rooms
            .get(room_id)
            .and_then(|r| r.members.get(connection_id))
            .map(|m| m.state)
    }

    /// Live members of a room other than `except`.
    #[must_use]
    pub fn other_live_members(&self, room_id: &RoomCode, except: &ConnectionId) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|r| {
                r.live_members()
                    .into_iter()
                    .filter(|id| id != except)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether the identity is holding a `Reconnecting` slot in this room.
    #[must_use]
    pub fn is_reconnecting(&self, identity: &DurableIdentity, room_id: &RoomCode) -> bool {
        if self.identity_to_room.get(identity) != Some(room_id) {
            return false;
        }
        self.rooms.get(room_id).is_some_and(|r| {
            r.members
                .values()
                .any(|m| &m.identity == identity && m.state == MemberState::Reconnecting)
        })
    }

    /// Snapshot a room.
    #[must_use]
    pub fn snapshot(&self, room_id: &RoomCode) -> Option<RoomSnapshot> {
        self.rooms.get(room_id).map(|room| RoomSnapshot {
            room_id: room_id.clone(),
            members: room.members.iter().map(|(id, m)| (*id, m.state)).collect(),
            effective_members: room.effective_count(),
            created_at: room.created_at,
        })
    }

    /// Create a room with the caller as its only member.
    ///
    /// Once the checks pass, the connection leaves any room it is in and the
    /// identity gives up any slot it holds elsewhere.
    ///
    /// # Errors
    ///
    /// - `RoomError::AtCapacity` when the live room ceiling is reached
    /// - `RoomError::Internal` when no unused code could be drawn
    pub fn create_room(
        &mut self,
        connection_id: ConnectionId,
        identity: DurableIdentity,
    ) -> Result<CreateOutcome, RoomError> {
        if self.rooms.len() >= self.max_rooms {
            return Err(RoomError::AtCapacity {
                max_rooms: self.max_rooms,
            });
        }

        let room_id = self.unused_code()?;

        let mut departures = Vec::new();
        departures.extend(self.leave(&connection_id));
        departures.extend(self.release_identity(&identity));

        let mut members = BTreeMap::new();
        members.insert(
            connection_id,
            Member {
                identity: identity.clone(),
                state: MemberState::Active,
            },
        );
        self.rooms.insert(
            room_id.clone(),
            Room {
                members,
                created_at: Utc::now(),
            },
        );
        self.identity_to_room.insert(identity.clone(), room_id.clone());
        self.connection_to_identity.insert(connection_id, identity);

        Ok(CreateOutcome {
            room_id,
            departures,
        })
    }

    /// Join an existing room.
    ///
    /// `raw_room_id` is normalized (trimmed, upper-cased). The join is allowed
    /// when the room has fewer than [`MAX_ROOM_MEMBERS`] live members, or when
    /// the identity holds a `Reconnecting` slot in this exact room. Stale
    /// entries of the identity are replaced by the new connection.
    ///
    /// The reconnection path trusts the caller-supplied identity: anyone who
    /// knows both the identity string and the room code can claim the slot.
    /// Review this before exposing the service beyond trusted clients.
    ///
    /// # Errors
    ///
    /// - `RoomError::RoomNotFound` for malformed or unknown codes
    /// - `RoomError::RoomFull` when the room is full and this is not a reconnection
    pub fn join_room(
        &mut self,
        connection_id: ConnectionId,
        raw_room_id: &str,
        identity: DurableIdentity,
    ) -> Result<JoinOutcome, RoomError> {
        let room_id = RoomCode::parse(raw_room_id)
            .map_err(|_| RoomError::RoomNotFound(raw_room_id.trim().to_string()))?;

        let room = self
            .rooms
            .get(&room_id)
            .ok_or_else(|| RoomError::RoomNotFound(room_id.to_string()))?;

        // Already a member of this room: nothing to do
        if room.members.contains_key(&connection_id) {
            return Ok(JoinOutcome {
                room_id,
                reconnected: false,
                replaced: Vec::new(),
                notify: Vec::new(),
                departures: Vec::new(),
            });
        }

        let reconnected = self.is_reconnecting(&identity, &room_id);
        if !reconnected && room.effective_count() >= MAX_ROOM_MEMBERS {
            return Err(RoomError::RoomFull(room_id.to_string()));
        }

        let mut departures = Vec::new();
        departures.extend(self.leave(&connection_id));

        let mut replaced = Vec::new();
        if self.identity_to_room.get(&identity) == Some(&room_id) {
            // Same room: drop the identity's stale entries without telling anyone
            replaced = self.remove_entries(&room_id, &identity);
        } else {
            departures.extend(self.release_identity(&identity));
        }

        let Some(room) = self.rooms.get_mut(&room_id) else {
            return Err(RoomError::RoomNotFound(room_id.to_string()));
        };

        let notify = room.live_members();
        room.members.insert(
            connection_id,
            Member {
                identity: identity.clone(),
                state: MemberState::Active,
            },
        );
        self.identity_to_room.insert(identity.clone(), room_id.clone());
        self.connection_to_identity.insert(connection_id, identity);

        Ok(JoinOutcome {
            room_id,
            reconnected,
            replaced,
            notify,
            departures,
        })
    }

    /// Remove a connection from its room immediately.
    ///
    /// Returns `None` if the connection is not in a room.
    pub fn leave(&mut self, connection_id: &ConnectionId) -> Option<Departure> {
        let room_id = self.room_of(connection_id)?.clone();
        let identity = self.connection_to_identity.remove(connection_id)?;

        let room = self.rooms.get_mut(&room_id)?;
        room.members.remove(connection_id);

        if room.entries_of(&identity).is_empty() {
            self.identity_to_room.remove(&identity);
        }

        Some(self.departure_from(&room_id, *connection_id))
    }

    /// Mark a member's channel as closed.
    ///
    /// Returns the identity and room to arm a grace timer for, or `None` if
    /// the connection was not a live member.
    pub fn mark_reconnecting(
        &mut self,
        connection_id: &ConnectionId,
    ) -> Option<(DurableIdentity, RoomCode)> {
        let room_id = self.room_of(connection_id)?.clone();
        let member = self.rooms.get_mut(&room_id)?.members.get_mut(connection_id)?;

        if member.state != MemberState::Active {
            return None;
        }
        member.state = MemberState::Reconnecting;

        Some((member.identity.clone(), room_id))
    }

    /// Apply grace period expiry for an identity.
    ///
    /// Removes the identity mapping and every `Reconnecting` entry of the
    /// identity in the room. Does nothing if the identity has since moved to
    /// another room.
    pub fn expire(&mut self, identity: &DurableIdentity, room_id: &RoomCode) -> Vec<Departure> {
        if self.identity_to_room.get(identity) != Some(room_id) {
            return Vec::new();
        }

        let stale: Vec<ConnectionId> = self
            .rooms
            .get(room_id)
            .map(|r| {
                r.members
                    .iter()
                    .filter(|(_, m)| &m.identity == identity && m.state == MemberState::Reconnecting)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();

        let mut departures = Vec::new();
        for connection_id in stale {
            if let Some(room) = self.rooms.get_mut(room_id) {
                room.members.remove(&connection_id);
            }
            self.connection_to_identity.remove(&connection_id);
            departures.push(self.departure_from(room_id, connection_id));
        }

        let still_present = self
            .rooms
            .get(room_id)
            .is_some_and(|r| !r.entries_of(identity).is_empty());
        if !still_present {
            self.identity_to_room.remove(identity);
        }

        departures
    }

    /// Give up every slot the identity holds.
    pub fn release_identity(&mut self, identity: &DurableIdentity) -> Vec<Departure> {
        let Some(room_id) = self.identity_to_room.remove(identity) else {
            return Vec::new();
        };

        let entries = self
            .rooms
            .get(&room_id)
            .map(|r| r.entries_of(identity))
            .unwrap_or_default();

        let mut departures = Vec::new();
        for connection_id in entries {
            if let Some(room) = self.rooms.get_mut(&room_id) {
                room.members.remove(&connection_id);
            }
            self.connection_to_identity.remove(&connection_id);
            departures.push(self.departure_from(&room_id, connection_id));
        }
        departures
    }

    /// Remove every entry of `identity` from `room_id`, returning their ids.
    fn remove_entries(&mut self, room_id: &RoomCode, identity: &DurableIdentity) -> Vec<ConnectionId> {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return Vec::new();
        };
        let entries = room.entries_of(identity);
        for connection_id in &entries {
            room.members.remove(connection_id);
            self.connection_to_identity.remove(connection_id);
        }
        entries
    }

    /// Build the departure for a member that was just removed, deleting the
    /// room if it is now empty.
    fn departure_from(&mut self, room_id: &RoomCode, departed: ConnectionId) -> Departure {
        let is_empty = !self
            .rooms
            .get(room_id)
            .is_some_and(|r| !r.members.is_empty());

        if is_empty {
            self.rooms.remove(room_id);
            Departure::RoomDeleted {
                room_id: room_id.clone(),
            }
        } else {
            Departure::PeerLeft {
                room_id: room_id.clone(),
                departed,
                notify: self.other_live_members(room_id, &departed),
            }
        }
    }

    fn unused_code(&mut self) -> Result<RoomCode, RoomError> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = self.codes.next_code();
            if !self.rooms.contains_key(&code) {
                return Ok(code);
            }
        }
        Err(RoomError::Internal(
            "exhausted room code attempts".to_string(),
        ))
    }
}
