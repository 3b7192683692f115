//! Wire types shared by the room service and the peer client.

#![warn(clippy::pedantic)]

/// Module for protocol parsing errors
pub mod error;

/// Module for room codes, connection ids and durable identities
pub mod types;

/// Module for the signaling protocol messages
pub mod protocol;

/// Module for secret types that prevent accidental logging
pub mod secret;
