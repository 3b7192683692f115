//! Identifiers shared by the room service and the peer client.
//!
//! Identity and transport session are deliberately separate types:
//!
//! - [`DurableIdentity`] is held by the caller and survives reloads. It is
//!   what the room service uses to recognize a reconnection.
//! - [`ConnectionId`] names one open signaling channel and is the only id a
//!   peer ever learns about another peer.
//! - [`RoomCode`] is the short code two parties exchange out of band.

use crate::error::{ProtocolError, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Number of characters in a room code.
pub const ROOM_CODE_LENGTH: usize = 8;

/// Room code alphabet. Excludes `0 O 1 I L`, which read alike.
pub const ROOM_CODE_ALPHABET: &str = "ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Maximum accepted length of a durable identity, in bytes.
pub const MAX_IDENTITY_LENGTH: usize = 128;

/// Eight-character room code drawn from [`ROOM_CODE_ALPHABET`].
///
/// A `RoomCode` is always valid: construction goes through [`RoomCode::parse`]
/// or [`RoomCode::generate`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomCode(String);

impl RoomCode {
    /// Generate a random room code.
    ///
    /// Uniqueness among live rooms is the registry's concern; this only
    /// guarantees the format.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let alphabet = ROOM_CODE_ALPHABET.as_bytes();
        let code = (0..ROOM_CODE_LENGTH)
            .filter_map(|_| alphabet.choose(rng).copied().map(char::from))
            .collect();
        Self(code)
    }

    /// Parse user input into a room code.
    ///
    /// Input is trimmed and upper-cased first, so `" k3m9pqxt "` parses as
    /// `K3M9PQXT`.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidRoomCode` if the normalized input is not
    /// exactly eight alphabet characters.
    pub fn parse(raw: &str) -> Result<Self> {
        let normalized = raw.trim().to_ascii_uppercase();

        if normalized.len() != ROOM_CODE_LENGTH
            || !normalized.chars().all(|c| ROOM_CODE_ALPHABET.contains(c))
        {
            return Err(ProtocolError::InvalidRoomCode);
        }

        Ok(Self(normalized))
    }

    /// Borrow the code as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomCode {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<RoomCode> for String {
    fn from(code: RoomCode) -> Self {
        code.0
    }
}

/// Ephemeral id of one open signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-held identity that outlives a single signaling channel.
///
/// Presenting the same identity and room code within the grace window is
/// enough to reclaim a room slot, so the value is treated as a credential:
/// `Debug` output is redacted and there is no `Display` impl.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DurableIdentity(String);

impl DurableIdentity {
    /// Validate and wrap an identity string.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidIdentity` if the value is empty, blank,
    /// or longer than [`MAX_IDENTITY_LENGTH`] bytes.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(ProtocolError::InvalidIdentity("identity is empty"));
        }
        if value.len() > MAX_IDENTITY_LENGTH {
            return Err(ProtocolError::InvalidIdentity("identity is too long"));
        }
        Ok(Self(value))
    }

    /// Generate a fresh random identity (used for guests).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identity value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DurableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DurableIdentity([REDACTED])")
    }
}

impl TryFrom<String> for DurableIdentity {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DurableIdentity> for String {
    fn from(identity: DurableIdentity) -> Self {
        identity.0
    }
}
