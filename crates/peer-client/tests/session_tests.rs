//! Session integration tests.
//!
//! Two session actors talk to a real room service over WebSocket. Media is
//! a loopback fake: descriptions are placeholders and path state changes
//! are injected by the test.

use async_trait::async_trait;
use common::protocol::IceServer;
use common::types::DurableIdentity;
use peer_client::media::{
    IceCandidate, LinkEvent, LinkId, MediaEvent, MediaKind, MediaSession, MediaSessionFactory,
    PathState, SdpKind, SessionDescription, TrackChange,
};
use peer_client::{spawn_session, ClientError, Config, MediaError, SessionHandle, SessionPhase, SessionStatus};
use room_test_utils::TestRoomServer;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

struct LoopbackSession {
    link: LinkId,
}

#[async_trait]
impl MediaSession for LoopbackSession {
    async fn create_offer(&mut self, _ice_restart: bool) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("v=0 {} offer", self.link),
        })
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("v=0 {} answer", self.link),
        })
    }

    async fn set_local_description(&mut self, _: &SessionDescription) -> Result<(), MediaError> {
        Ok(())
    }

    async fn set_remote_description(&mut self, _: &SessionDescription) -> Result<(), MediaError> {
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    async fn add_ice_candidate(&mut self, _: &IceCandidate) -> Result<(), MediaError> {
        Ok(())
    }

    async fn set_source(&mut self, _: MediaKind, _: Option<&str>) -> Result<TrackChange, MediaError> {
        Ok(TrackChange::Unchanged)
    }

    async fn close(&mut self) {}
}

/// Hands out loopback sessions and keeps their event senders so the test
/// can drive path state.
#[derive(Clone, Default)]
struct LoopbackFactory {
    links: Arc<Mutex<Vec<(LinkId, mpsc::UnboundedSender<LinkEvent>)>>>,
}

impl LoopbackFactory {
    fn set_path(&self, path: PathState) {
        let links = self.links.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for (link, events) in links.iter() {
            let _ = events.send(LinkEvent {
                link: *link,
                event: MediaEvent::PathState(path),
            });
        }
    }
}

#[async_trait]
impl MediaSessionFactory for LoopbackFactory {
    async fn create(
        &self,
        link: LinkId,
        _ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        self.links
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((link, events));
        Ok(Box::new(LoopbackSession { link }))
    }
}

struct Participant {
    handle: SessionHandle,
    media: LoopbackFactory,
}

impl Participant {
    fn start(server: &TestRoomServer, identity: &str, token: &CancellationToken) -> Result<Self, anyhow::Error> {
        let config = Config::new(server.ws_url(), DurableIdentity::new(identity)?);
        let media = LoopbackFactory::default();
        let (handle, _task) = spawn_session(config, Arc::new(media.clone()), token.child_token())?;
        Ok(Self { handle, media })
    }

    async fn wait_for(
        &self,
        pred: impl Fn(&SessionStatus) -> bool,
    ) -> Result<SessionStatus, anyhow::Error> {
        let mut rx = self.handle.status();
        let status = tokio::time::timeout(WAIT, rx.wait_for(|s| pred(s))).await??;
        Ok(status.clone())
    }
}

async fn connected_pair(
    server: &TestRoomServer,
    token: &CancellationToken,
) -> Result<(Participant, Participant), anyhow::Error> {
    let host = Participant::start(server, "host-1", token)?;
    let guest = Participant::start(server, "guest-1", token)?;

    let room = host.handle.create_room().await?;
    guest.handle.join_room(&room.as_str().to_lowercase()).await?;

    host.wait_for(|s| s.peer_present).await?;
    guest.wait_for(|s| s.peer_present).await?;
    Ok((host, guest))
}

#[tokio::test]
async fn test_two_sessions_negotiate_through_service() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn_with_codes(&[], &["K3M9PQXT"]).await?;
    let token = CancellationToken::new();
    let (host, guest) = connected_pair(&server, &token).await?;

    for p in [&host, &guest] {
        p.media.set_path(PathState::Connected);
        let status = p.wait_for(|s| s.link == Some(PathState::Connected)).await?;
        assert_eq!(status.phase, SessionPhase::Connected);
        assert_eq!(status.room.map(|r| r.as_str().to_string()).as_deref(), Some("K3M9PQXT"));
        assert!(status.error.is_none());
    }

    token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_application_sync_between_sessions() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let token = CancellationToken::new();
    let (host, guest) = connected_pair(&server, &token).await?;

    let mut inbox = guest.handle.subscribe_sync();
    host.handle.send_sync(json!({"cursor": [3, 4]})).await?;

    let message = tokio::time::timeout(WAIT, inbox.recv()).await??;
    assert_eq!(message.payload, json!({"cursor": [3, 4]}));

    token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_hang_up_is_seen_by_peer_immediately() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let token = CancellationToken::new();
    let (host, guest) = connected_pair(&server, &token).await?;

    guest.handle.hang_up().await?;
    guest.wait_for(|s| s.phase == SessionPhase::Lobby).await?;

    // Explicit leave skips the grace period
    let status = host.wait_for(|s| !s.peer_present).await?;
    assert_eq!(status.phase, SessionPhase::Connected);

    token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_unknown_room_code_is_reported() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let token = CancellationToken::new();
    let guest = Participant::start(&server, "guest-1", &token)?;

    let result = guest.handle.join_room("ZZZZZZZZ").await;
    assert_eq!(result, Err(ClientError::RoomNotFound));

    let status = guest.wait_for(|s| s.error.is_some()).await?;
    assert_eq!(status.phase, SessionPhase::Lobby);

    token.cancel();
    Ok(())
}

#[tokio::test]
async fn test_service_down_fails_create() -> Result<(), anyhow::Error> {
    let server = TestRoomServer::spawn().await?;
    let token = CancellationToken::new();
    let host = Participant::start(&server, "host-1", &token)?;

    server.shutdown();
    drop(server);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let result = host.handle.create_room().await;
    assert!(matches!(result, Err(ClientError::Channel(_))));

    token.cancel();
    Ok(())
}
