//! # Room Test Utilities
//!
//! Shared test utilities for the room service and the peer client.
//!
//! This crate provides:
//! - Server test harness (`TestRoomServer`) running the real router on an
//!   ephemeral port
//! - A thin signaling client (`TestWsClient`) with expectation helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use room_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let server = TestRoomServer::spawn().await?;
//!     let mut host = TestWsClient::connect(&server.ws_url()).await?;
//!     let room = host.create_room("host-1").await?;
//!     Ok(())
//! }
//! ```

pub mod server_harness;
pub mod ws_client;

pub use server_harness::TestRoomServer;
pub use ws_client::TestWsClient;
