//! Plain HTTP endpoint tests.

use common::protocol::IceServerList;
use room_test_utils::TestRoomServer;

#[tokio::test]
async fn test_ice_servers_endpoint_returns_configured_servers() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn_with(&[
        ("RS_STUN_URLS", "stun:a.example.org:3478,stun:b.example.org:3478"),
        ("RS_TURN_URLS", "turn:relay.example.org:3478"),
        ("RS_TURN_USERNAME", "relay-user"),
        ("RS_TURN_CREDENTIAL", "relay-pass"),
        ("RS_ICE_SERVERS_TTL_SECONDS", "600"),
    ])
    .await?;

    let response = reqwest::get(format!("{}/ice-servers", server.url())).await?;
    assert_eq!(response.status(), 200);

    let list: IceServerList = response.json().await?;
    assert_eq!(list.ttl_seconds, 600);

    let turn = list
        .ice_servers
        .iter()
        .find(|s| s.urls.iter().any(|u| u.starts_with("turn:")))
        .ok_or_else(|| anyhow::anyhow!("TURN entry missing"))?;
    assert_eq!(turn.username.as_deref(), Some("relay-user"));
    assert_eq!(turn.credential.as_deref(), Some("relay-pass"));
    Ok(())
}

#[tokio::test]
async fn test_unknown_route_returns_404() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;

    let response = reqwest::get(format!("{}/v1/nonexistent", server.url())).await?;
    assert_eq!(response.status(), 404);
    Ok(())
}
