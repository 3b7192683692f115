//! Room Service Library
//!
//! Rendezvous and signaling for two-party peer sessions:
//!
//! - Short room codes (8 characters, no look-alike glyphs) that two people
//!   exchange out of band
//! - At most two live members per room and a ceiling on live rooms
//! - A reconnection grace period: a member whose channel drops keeps its
//!   slot for a while and can reclaim it with the same durable identity
//! - Relay of opaque negotiation payloads between members of the same room
//!
//! # Architecture
//!
//! ```text
//! axum /ws ──▶ ws::handle_socket (read half)
//!                 │ RegistryHandle
//!                 ▼
//!             RegistryActor ── RoomTable, GraceTracker
//!                 │ ConnectionHandle::try_send
//!                 ▼
//!             ConnectionActor (write half, one per socket)
//! ```
//!
//! # Modules
//!
//! - [`actors`]: registry and connection actors, room table, grace timers
//! - [`app`]: registry + router wiring
//! - [`config`]: service configuration from environment
//! - [`errors`]: error types mapped to wire error codes
//! - [`observability`]: health probes and Prometheus metrics
//! - [`routes`]: HTTP router and shared state
//! - [`ws`]: WebSocket signaling endpoint

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod actors;
pub mod app;
pub mod config;
pub mod errors;
pub mod observability;
pub mod routes;
pub mod ws;
