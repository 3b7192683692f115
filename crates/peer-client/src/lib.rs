//! Peer Client Library
//!
//! The per-tab side of a two-party peer session: joins a room through the
//! room service, negotiates a direct media path with the other member and
//! keeps it alive.
//!
//! # Architecture
//!
//! ```text
//! SessionHandle ──▶ SessionActor ── SignalingChannel (WebSocket)
//!                       │
//!                       ▼
//!                   PeerLink ── NegotiationState, RecoveryState
//!                       │
//!                       ▼
//!                   MediaSession (webrtc-rs, or a test double)
//! ```
//!
//! # Modules
//!
//! - [`channel`]: signaling channel trait and WebSocket implementation
//! - [`config`]: client configuration from environment
//! - [`errors`]: client and media error types
//! - [`ice_servers`]: background fetch of STUN/TURN servers
//! - [`link`]: one negotiated link to the peer
//! - [`media`]: media backend traits and signaling payloads
//! - [`negotiation`]: offer/answer state machine
//! - [`resilience`]: ICE restart and reconnect policy
//! - [`session`]: the session actor and its handle

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod errors;
pub mod ice_servers;
pub mod link;
pub mod media;
pub mod negotiation;
pub mod resilience;
pub mod session;

#[cfg(feature = "webrtc")]
pub mod webrtc_media;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use errors::{ClientError, MediaError};
pub use session::{spawn_session, SessionActor, SessionHandle, SessionPhase, SessionStatus, SyncMessage};
