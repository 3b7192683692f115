//! Reconnection grace period over real sockets.
//!
//! The grace period is configured in whole seconds, so these tests run
//! with a one second period and real time.

use room_test_utils::{TestRoomServer, TestWsClient};
use serde_json::json;
use std::time::Duration;

const GRACE: &[(&str, &str)] = &[("RS_DISCONNECT_GRACE_PERIOD_SECONDS", "1")];

async fn wait_for_reconnecting(server: &TestRoomServer) -> Result<(), anyhow::Error> {
    for _ in 0..50 {
        if server.stats().await?.reconnecting == 1 {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("Member never entered the reconnecting state")
}

#[tokio::test]
async fn test_rejoin_within_grace_is_silent() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn_with(GRACE).await?;

    let mut host = TestWsClient::connect(&server.ws_url()).await?;
    let mut guest = TestWsClient::connect(&server.ws_url()).await?;

    let room = host.create_room("host-1").await?;
    guest.join_room(room.as_str(), "guest-1").await?;
    host.expect_peer_joined().await?;

    guest.drop_abruptly();
    wait_for_reconnecting(&server).await?;

    let mut guest = TestWsClient::connect(&server.ws_url()).await?;
    guest.join_room(room.as_str(), "guest-1").await?;

    // The host learns the new connection id and never sees peer-left
    assert_eq!(host.expect_peer_joined().await?, guest.connection_id());
    host.expect_silence(Duration::from_millis(1500)).await?;

    // Relay works to the new connection
    host.signal(guest.connection_id(), json!({"type": "offer"}))
        .await?;
    let (from, _) = guest.expect_signal().await?;
    assert_eq!(from, host.connection_id());

    let stats = server.stats().await?;
    assert_eq!(stats.reconnecting, 0);
    assert_eq!(stats.pending_timers, 0);
    Ok(())
}

#[tokio::test]
async fn test_expiry_announces_departure_once() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn_with(GRACE).await?;

    let mut host = TestWsClient::connect(&server.ws_url()).await?;
    let mut guest = TestWsClient::connect(&server.ws_url()).await?;

    let room = host.create_room("host-1").await?;
    guest.join_room(room.as_str(), "guest-1").await?;
    host.expect_peer_joined().await?;
    let departed = guest.connection_id();

    guest.drop_abruptly();

    assert_eq!(host.expect_peer_left().await?, departed);
    host.expect_silence(Duration::from_millis(500)).await?;

    // Room survives with the host; a newcomer can take the slot
    let mut newcomer = TestWsClient::connect(&server.ws_url()).await?;
    newcomer.join_room(room.as_str(), "newcomer-1").await?;
    assert_eq!(host.expect_peer_joined().await?, newcomer.connection_id());
    Ok(())
}

/// Only live members count toward the two-member limit, and a reconnecting
/// identity bypasses the limit for its own room.
#[tokio::test]
async fn test_reconnecting_identity_bypasses_full_room() -> Result<(), anyhow::Error> {
    let server =
        TestRoomServer::spawn_with(&[("RS_DISCONNECT_GRACE_PERIOD_SECONDS", "30")]).await?;

    let mut host = TestWsClient::connect(&server.ws_url()).await?;
    let mut guest = TestWsClient::connect(&server.ws_url()).await?;

    let room = host.create_room("host-1").await?;
    guest.join_room(room.as_str(), "guest-1").await?;
    host.expect_peer_joined().await?;

    guest.drop_abruptly();
    wait_for_reconnecting(&server).await?;

    let mut stranger = TestWsClient::connect(&server.ws_url()).await?;
    stranger.join_room(room.as_str(), "stranger-1").await?;
    assert_eq!(host.expect_peer_joined().await?, stranger.connection_id());

    let mut guest = TestWsClient::connect(&server.ws_url()).await?;
    guest.join_room(room.as_str(), "guest-1").await?;

    let mut late = TestWsClient::connect(&server.ws_url()).await?;
    assert_eq!(
        late.try_join_room(room.as_str(), "late-1").await?,
        Err(common::protocol::ErrorCode::RoomFull)
    );
    Ok(())
}

/// A socket that stops answering pings is treated as closed, so the member's
/// slot enters the grace period and the same identity can take it back.
#[tokio::test]
async fn test_silent_channel_enters_grace_period() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn_with(&[
        ("RS_PING_INTERVAL_SECONDS", "1"),
        ("RS_IDLE_TIMEOUT_SECONDS", "2"),
    ])
    .await?;

    let mut host = TestWsClient::connect(&server.ws_url()).await?;
    let mut guest = TestWsClient::connect(&server.ws_url()).await?;

    let room = host.create_room("host-1").await?;
    guest.join_room(room.as_str(), "guest-1").await?;
    host.expect_peer_joined().await?;

    // The guest stops reading, so its pongs stop; the host keeps reading
    let mut entered_grace = false;
    for _ in 0..40 {
        host.expect_silence(Duration::from_millis(100)).await?;
        if server.stats().await?.reconnecting == 1 {
            entered_grace = true;
            break;
        }
    }
    assert!(entered_grace, "silent guest was never detected");

    let mut returning = TestWsClient::connect(&server.ws_url()).await?;
    returning.join_room(room.as_str(), "guest-1").await?;
    assert_eq!(host.expect_peer_joined().await?, returning.connection_id());

    drop(guest);
    Ok(())
}
