//! In-memory media sessions and signaling channels for tests.
//!
//! `MockMediaSession` records every call and can be told to fail one
//! operation. `MockConnector` hands out channels whose server side is a
//! [`MockRemote`] the test drives directly.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::channel::{ChannelConnector, SignalingChannel};
use crate::errors::{ClientError, MediaError};
use crate::media::{
    IceCandidate, LinkEvent, LinkId, MediaEvent, MediaKind, MediaSession, MediaSessionFactory,
    PathState, SdpKind, SessionDescription, TrackChange,
};
use async_trait::async_trait;
use common::protocol::{ClientMessage, IceServer, ServerMessage};
use common::types::ConnectionId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    Rollback,
    AddCandidate(String),
    SetSource(MediaKind, Option<String>),
    Close,
}

#[derive(Debug, Default)]
struct MockMediaState {
    calls: Vec<MediaCall>,
    fail: HashSet<&'static str>,
    next_change: Option<TrackChange>,
    offers: u32,
}

/// Recording media session. Clones share state.
#[derive(Debug, Clone)]
pub struct MockMediaSession {
    link: LinkId,
    state: Arc<Mutex<MockMediaState>>,
}

impl MockMediaSession {
    #[must_use]
    pub fn new(link: LinkId) -> Self {
        Self {
            link,
            state: Arc::default(),
        }
    }

    #[must_use]
    pub fn link(&self) -> LinkId {
        self.link
    }

    #[must_use]
    pub fn calls(&self) -> Vec<MediaCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Offers created so far, counting ICE restarts.
    #[must_use]
    pub fn offers(&self) -> u32 {
        self.state.lock().unwrap().offers
    }

    /// Make the next call to `op` (e.g. `"create_offer"`) fail.
    pub fn fail_next(&self, op: &'static str) {
        self.state.lock().unwrap().fail.insert(op);
    }

    /// Result of the next `set_source`.
    pub fn set_next_change(&self, change: TrackChange) {
        self.state.lock().unwrap().next_change = Some(change);
    }

    fn record(&self, op: &'static str, call: MediaCall) -> Result<(), MediaError> {
        let mut state = self.state.lock().unwrap();
        if state.fail.remove(op) {
            return Err(MediaError::Backend(format!("{op} failed (scripted)")));
        }
        state.calls.push(call);
        Ok(())
    }
}

#[async_trait]
impl MediaSession for MockMediaSession {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        self.record("create_offer", MediaCall::CreateOffer { ice_restart })?;
        let mut state = self.state.lock().unwrap();
        state.offers += 1;
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: format!("{}-offer-{}", self.link, state.offers),
        })
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        self.record("create_answer", MediaCall::CreateAnswer)?;
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: format!("{}-answer", self.link),
        })
    }

    async fn set_local_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.record("set_local_description", MediaCall::SetLocal(description.kind))
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(
            "set_remote_description",
            MediaCall::SetRemote(description.kind),
        )
    }

    async fn rollback(&mut self) -> Result<(), MediaError> {
        self.record("rollback", MediaCall::Rollback)
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.record(
            "add_ice_candidate",
            MediaCall::AddCandidate(candidate.candidate.clone()),
        )
    }

    async fn set_source(
        &mut self,
        kind: MediaKind,
        source: Option<&str>,
    ) -> Result<TrackChange, MediaError> {
        self.record(
            "set_source",
            MediaCall::SetSource(kind, source.map(str::to_string)),
        )?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .next_change
            .take()
            .unwrap_or(TrackChange::Unchanged))
    }

    async fn close(&mut self) {
        let _ = self.record("close", MediaCall::Close);
    }
}

#[derive(Default)]
struct FactoryState {
    sessions: Vec<MockMediaSession>,
    events: Vec<(LinkId, mpsc::UnboundedSender<LinkEvent>)>,
    ice_servers: Vec<Vec<IceServer>>,
    fail_next: bool,
}

/// Factory producing [`MockMediaSession`]s. Clones share state.
#[derive(Clone, Default)]
pub struct MockMediaFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockMediaFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions created so far, oldest first.
    #[must_use]
    pub fn sessions(&self) -> Vec<MockMediaSession> {
        self.state.lock().unwrap().sessions.clone()
    }

    /// Most recently created session.
    #[must_use]
    pub fn latest(&self) -> Option<MockMediaSession> {
        self.state.lock().unwrap().sessions.last().cloned()
    }

    /// ICE server lists handed to each created session.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<Vec<IceServer>> {
        self.state.lock().unwrap().ice_servers.clone()
    }

    pub fn fail_next_create(&self) {
        self.state.lock().unwrap().fail_next = true;
    }

    /// Emit an event as if the session for `link` observed it.
    pub fn emit(&self, link: LinkId, event: MediaEvent) {
        let state = self.state.lock().unwrap();
        if let Some((_, tx)) = state.events.iter().find(|(id, _)| *id == link) {
            let _ = tx.send(LinkEvent { link, event });
        }
    }

    /// Emit a path state change on the most recent session.
    pub fn emit_path(&self, path: PathState) {
        if let Some(session) = self.latest() {
            self.emit(session.link(), MediaEvent::PathState(path));
        }
    }
}

#[async_trait]
impl MediaSessionFactory for MockMediaFactory {
    async fn create(
        &self,
        link: LinkId,
        ice_servers: Vec<IceServer>,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Box<dyn MediaSession>, MediaError> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next) {
            return Err(MediaError::Backend("create failed (scripted)".to_string()));
        }
        let session = MockMediaSession::new(link);
        state.sessions.push(session.clone());
        state.events.push((link, events));
        state.ice_servers.push(ice_servers);
        Ok(Box::new(session))
    }
}

/// Server side of a mock signaling channel.
pub struct MockRemote {
    to_client: Option<mpsc::UnboundedSender<ServerMessage>>,
    from_client: mpsc::UnboundedReceiver<ClientMessage>,
}

impl MockRemote {
    pub fn send(&self, message: ServerMessage) {
        if let Some(tx) = &self.to_client {
            let _ = tx.send(message);
        }
    }

    /// Next message from the client, failing the test after five seconds.
    pub async fn recv(&mut self) -> ClientMessage {
        tokio::time::timeout(Duration::from_secs(5), self.from_client.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("client channel closed")
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        self.from_client.try_recv().ok()
    }

    /// Drop the channel as a network failure would.
    pub fn disconnect(&mut self) {
        self.to_client = None;
    }
}

struct MockChannel {
    connection_id: ConnectionId,
    from_server: mpsc::UnboundedReceiver<ServerMessage>,
    to_server: mpsc::UnboundedSender<ClientMessage>,
}

#[async_trait]
impl SignalingChannel for MockChannel {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        self.to_server
            .send(message.clone())
            .map_err(|_| ClientError::Channel("mock remote gone".to_string()))
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        self.from_server.recv().await
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}

/// Connector handing out in-memory channels.
#[derive(Clone)]
pub struct MockConnector {
    remotes: mpsc::UnboundedSender<MockRemote>,
    failures: Arc<Mutex<u32>>,
}

impl MockConnector {
    /// Returns the connector and a stream of the remotes it creates.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MockRemote>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes: tx,
                failures: Arc::default(),
            },
            rx,
        )
    }

    /// Make the next `count` connection attempts fail.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock().unwrap() = count;
    }
}

#[async_trait]
impl ChannelConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn SignalingChannel>, ClientError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ClientError::Channel("connection refused (scripted)".to_string()));
            }
        }

        let connection_id = ConnectionId::new();
        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();

        let _ = self.remotes.send(MockRemote {
            to_client: Some(to_client),
            from_client,
        });

        Ok(Box::new(MockChannel {
            connection_id,
            from_server,
            to_server,
        }))
    }
}
