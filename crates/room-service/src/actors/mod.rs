//! Actors owning the room service's mutable state.
//!
//! ```text
//! RegistryActor (singleton)
//! ├── owns RoomTable (rooms, identity → room, connection → identity)
//! ├── owns GraceTracker (one DelayQueue timer per disconnected identity)
//! └── holds a ConnectionHandle per open channel
//!     └── ConnectionActor (one per WebSocket, owns the write half)
//! ```
//!
//! The WebSocket handler owns the read half of each socket and forwards
//! decoded requests to the registry. All room state changes happen in the
//! registry's loop; connection actors only write frames.

pub mod connection;
pub mod grace;
pub mod messages;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod room_table;

pub use connection::{ConnectionActor, ConnectionHandle};
pub use messages::{ConnectionMessage, RegistryMessage, RegistryStats};
pub use metrics::{RegistryGauges, RegistryGaugesSnapshot};
pub use registry::{RegistryActor, RegistryHandle, RegistrySettings};
pub use room_table::{MemberState, RoomSnapshot, MAX_ROOM_MEMBERS};
