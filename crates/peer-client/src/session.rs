//! Session actor: one per tab.
//!
//! The actor owns the signaling channel, the current [`PeerLink`], every
//! timer and the published [`SessionStatus`]. UI commands, channel messages,
//! media events and deadlines are branches of one `select!` loop, so no
//! state is shared and nothing needs a lock.
//!
//! # Recovery
//!
//! - Path trouble on the link is handled by the link's `RecoveryState`
//!   (disconnected check, bounded ICE restarts).
//! - Losing the channel while in a room discards the link, reconnects with
//!   backoff and re-issues `join-room` with the same identity and code. The
//!   peer counts as present again only after a new `peer-joined` or offer.
//! - A spent channel budget or a rejected rejoin is terminal: the session
//!   returns to the lobby with an error.

use crate::channel::{ChannelConnector, SignalingChannel, WsConnector};
use crate::config::Config;
use crate::errors::ClientError;
use crate::ice_servers::{spawn_ice_server_fetcher, IceServerReceiver};
use crate::link::{OfferReason, PeerLink};
use crate::media::{
    LinkEvent, LinkId, LocalMedia, MediaEvent, MediaKind, MediaSessionFactory, PathState,
    SignalData,
};
use crate::negotiation::Role;
use crate::resilience::{ChannelRetry, RecoveryAction};
use common::protocol::{ClientMessage, ServerMessage};
use common::types::{ConnectionId, RoomCode};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Command mailbox depth.
const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Buffered application-sync messages per subscriber.
const SYNC_CHANNEL_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Not in a room.
    Lobby,
    /// Creating, joining or rejoining a room.
    Joining,
    /// In a room with a working channel.
    Connected,
}

/// What the UI renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub room: Option<RoomCode>,
    pub peer_present: bool,
    pub link: Option<PathState>,
    pub error: Option<String>,
}

impl SessionStatus {
    fn lobby() -> Self {
        Self {
            phase: SessionPhase::Lobby,
            room: None,
            peer_present: false,
            link: None,
            error: None,
        }
    }
}

/// An application payload broadcast by the peer.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub from: ConnectionId,
    pub payload: Value,
}

enum SessionCommand {
    CreateRoom {
        respond_to: oneshot::Sender<Result<RoomCode, ClientError>>,
    },
    JoinRoom {
        code: String,
        respond_to: oneshot::Sender<Result<RoomCode, ClientError>>,
    },
    HangUp {
        respond_to: oneshot::Sender<()>,
    },
    SetMedia {
        kind: MediaKind,
        source: Option<String>,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    SendSync {
        payload: Value,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
}

/// Handle to a session actor.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    status: watch::Receiver<SessionStatus>,
    sync: broadcast::Sender<SyncMessage>,
    cancel_token: CancellationToken,
}

impl SessionHandle {
    /// Create a room; resolves with its code.
    ///
    /// # Errors
    ///
    /// `AtCapacity`, `Channel` if the service is unreachable,
    /// `RequestTimeout`, or `SessionClosed`.
    pub async fn create_room(&self) -> Result<RoomCode, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::CreateRoom { respond_to: tx })
            .await?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// Join a room by code (case and surrounding spaces are ignored).
    ///
    /// # Errors
    ///
    /// `RoomNotFound`, `RoomFull`, `Channel`, `RequestTimeout`, or
    /// `SessionClosed`.
    pub async fn join_room(&self, code: &str) -> Result<RoomCode, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::JoinRoom {
            code: code.to_string(),
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// Leave the room immediately; the peer is told at once.
    ///
    /// # Errors
    ///
    /// `SessionClosed` if the actor is gone.
    pub async fn hang_up(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::HangUp { respond_to: tx }).await?;
        rx.await.map_err(|_| ClientError::SessionClosed)
    }

    /// Select (or with `None`, drop) the local source for `kind`.
    ///
    /// # Errors
    ///
    /// `Media` if the backend rejects the change.
    pub async fn set_media(&self, kind: MediaKind, source: Option<String>) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::SetMedia {
            kind,
            source,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    /// Broadcast an application payload to the rest of the room.
    ///
    /// # Errors
    ///
    /// `Channel` when not in a room with a working channel.
    pub async fn send_sync(&self, payload: Value) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send(SessionCommand::SendSync {
            payload,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| ClientError::SessionClosed)?
    }

    #[must_use]
    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    #[must_use]
    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncMessage> {
        self.sync.subscribe()
    }

    /// Stop the actor. The room slot is kept for the grace period.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn send(&self, command: SessionCommand) -> Result<(), ClientError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| ClientError::SessionClosed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Create,
    Join,
    Rejoin,
}

impl RequestKind {
    const fn as_str(self) -> &'static str {
        match self {
            RequestKind::Create => "create",
            RequestKind::Join => "join",
            RequestKind::Rejoin => "rejoin",
        }
    }
}

struct PendingRequest {
    request_id: u64,
    kind: RequestKind,
    deadline: Instant,
    respond_to: Option<oneshot::Sender<Result<RoomCode, ClientError>>>,
}

impl PendingRequest {
    fn respond(self, result: Result<RoomCode, ClientError>) {
        if let Some(tx) = self.respond_to {
            let _ = tx.send(result);
        }
    }
}

/// Start a session against a room service: WebSocket signaling plus the
/// background ICE server fetch.
///
/// # Errors
///
/// Returns `ClientError::Config` if the HTTP client cannot be built.
pub fn spawn_session(
    config: Config,
    media: Arc<dyn MediaSessionFactory>,
    cancel_token: CancellationToken,
) -> Result<(SessionHandle, JoinHandle<()>), ClientError> {
    let (_fetcher, ice_servers) =
        spawn_ice_server_fetcher(config.ice_servers_url.clone(), cancel_token.child_token())
            .map_err(|e| ClientError::Config(e.to_string()))?;
    let connector = Arc::new(
        WsConnector::new(config.signaling_url.clone())
            .with_idle_timeout(config.channel_idle_timeout),
    );
    Ok(SessionActor::spawn(
        config,
        connector,
        media,
        ice_servers,
        cancel_token,
    ))
}

pub struct SessionActor {
    config: Config,
    connector: Arc<dyn ChannelConnector>,
    media: Arc<dyn MediaSessionFactory>,
    ice_servers: IceServerReceiver,
    receiver: mpsc::Receiver<SessionCommand>,
    cancel_token: CancellationToken,
    status: watch::Sender<SessionStatus>,
    sync: broadcast::Sender<SyncMessage>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,

    channel: Option<Box<dyn SignalingChannel>>,
    room: Option<RoomCode>,
    pending: Option<PendingRequest>,
    link: Option<PeerLink>,
    local_media: LocalMedia,
    retry: ChannelRetry,
    reconnect_at: Option<Instant>,
    error: Option<String>,
    next_link_id: u64,
    next_request_id: u64,
}

impl SessionActor {
    /// Spawn a session actor.
    ///
    /// Nothing is connected until the first create or join.
    #[must_use]
    pub fn spawn(
        config: Config,
        connector: Arc<dyn ChannelConnector>,
        media: Arc<dyn MediaSessionFactory>,
        ice_servers: IceServerReceiver,
        cancel_token: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let (status_tx, status_rx) = watch::channel(SessionStatus::lobby());
        let (sync_tx, _) = broadcast::channel(SYNC_CHANNEL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let retry = ChannelRetry::new(config.channel_retry_attempts);
        let actor = Self {
            config,
            connector,
            media,
            ice_servers,
            receiver,
            cancel_token: cancel_token.clone(),
            status: status_tx,
            sync: sync_tx.clone(),
            events_tx,
            events_rx,
            channel: None,
            room: None,
            pending: None,
            link: None,
            local_media: LocalMedia::default(),
            retry,
            reconnect_at: None,
            error: None,
            next_link_id: 0,
            next_request_id: 0,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            status: status_rx,
            sync: sync_tx,
            cancel_token,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "pc.session")]
    async fn run(mut self) {
        info!(target: "pc.session", "Session started");

        loop {
            let check_at = self
                .link
                .as_ref()
                .and_then(|link| link.recovery().pending_check());
            let request_deadline = self.pending.as_ref().map(|p| p.deadline);
            let reconnect_at = self.reconnect_at;

            tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => break,

                message = recv_from(&mut self.channel) => match message {
                    Some(message) => self.handle_server_message(message).await,
                    None => self.handle_channel_lost().await,
                },

                Some(event) = self.events_rx.recv() => self.handle_link_event(event).await,

                command = self.receiver.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },

                () = sleep_until(check_at) => self.handle_check_due().await,

                () = sleep_until(request_deadline) => self.handle_request_timeout().await,

                () = sleep_until(reconnect_at) => self.handle_reconnect().await,
            }

            self.publish_status();
        }

        self.discard_link().await;
        if let Some(pending) = self.pending.take() {
            pending.respond(Err(ClientError::SessionClosed));
        }
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
        }
        info!(target: "pc.session", "Session stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::CreateRoom { respond_to } => {
                self.start_request(RequestKind::Create, None, respond_to).await;
            }
            SessionCommand::JoinRoom { code, respond_to } => {
                self.start_request(RequestKind::Join, Some(code), respond_to)
                    .await;
            }
            SessionCommand::HangUp { respond_to } => {
                self.hang_up().await;
                let _ = respond_to.send(());
            }
            SessionCommand::SetMedia {
                kind,
                source,
                respond_to,
            } => {
                let result = self.set_media(kind, source).await;
                let _ = respond_to.send(result);
            }
            SessionCommand::SendSync {
                payload,
                respond_to,
            } => {
                let result = self.send_sync(payload).await;
                let _ = respond_to.send(result);
            }
        }
    }

    async fn start_request(
        &mut self,
        kind: RequestKind,
        code: Option<String>,
        respond_to: oneshot::Sender<Result<RoomCode, ClientError>>,
    ) {
        if self
            .pending
            .as_ref()
            .is_some_and(|p| p.kind != RequestKind::Rejoin)
        {
            let _ = respond_to.send(Err(ClientError::RequestRejected {
                code: "busy".to_string(),
                message: "Another request is in progress".to_string(),
            }));
            return;
        }

        // Any previous room or reconnect attempt is abandoned
        self.discard_link().await;
        self.room = None;
        self.reconnect_at = None;
        self.pending = None;
        self.retry.reset();

        if let Err(e) = self.ensure_channel().await {
            warn!(target: "pc.session", error = %e, "Could not reach the room service");
            self.error = Some(e.user_message());
            let _ = respond_to.send(Err(e));
            return;
        }

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let identity = self.config.identity.as_str().to_string();
        let message = match code {
            None => ClientMessage::CreateRoom {
                request_id,
                identity,
            },
            Some(room_id) => ClientMessage::JoinRoom {
                request_id,
                room_id,
                identity,
            },
        };

        if let Err(e) = self.send(&message).await {
            self.error = Some(e.user_message());
            let _ = respond_to.send(Err(e));
            return;
        }

        debug!(target: "pc.session", request_id, kind = kind.as_str(), "Request sent");
        self.error = None;
        self.pending = Some(PendingRequest {
            request_id,
            kind,
            deadline: Instant::now() + self.config.request_timeout,
            respond_to: Some(respond_to),
        });
    }

    async fn hang_up(&mut self) {
        if self.room.is_some() {
            info!(target: "pc.session", room = ?self.room, "Leaving room");
            if self.channel.is_some() {
                let _ = self.send(&ClientMessage::LeaveRoom).await;
            }
        }
        self.discard_link().await;
        if let Some(pending) = self.pending.take() {
            pending.respond(Err(ClientError::SessionClosed));
        }
        self.room = None;
        self.reconnect_at = None;
        self.retry.reset();
        self.error = None;
    }

    async fn set_media(&mut self, kind: MediaKind, source: Option<String>) -> Result<(), ClientError> {
        self.local_media.set(kind, source.clone());

        let Some(link) = self.link.as_mut() else {
            return Ok(());
        };
        let peer = link.peer();
        if let Some(offer) = link.set_source(kind, source.as_deref()).await? {
            relay_signal(&mut self.channel, peer, offer).await;
        }
        Ok(())
    }

    async fn send_sync(&mut self, payload: Value) -> Result<(), ClientError> {
        if self.room.is_none() || self.reconnect_at.is_some() {
            return Err(ClientError::Channel("not in a room".to_string()));
        }
        self.send(&ClientMessage::ApplicationSync { payload }).await
    }

    // ------------------------------------------------------------------
    // Server messages
    // ------------------------------------------------------------------

    async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { .. } => {}
            ServerMessage::RoomCreated {
                request_id,
                room_id,
            }
            | ServerMessage::RoomJoined {
                request_id,
                room_id,
            } => self.handle_request_accepted(request_id, room_id),
            ServerMessage::RequestFailed {
                request_id,
                code,
                message,
            } => {
                let error = ClientError::from_request_failed(code, message);
                self.handle_request_failed(request_id, error);
            }
            ServerMessage::PeerJoined { connection_id } => {
                self.handle_peer_joined(connection_id).await;
            }
            ServerMessage::PeerLeft { connection_id } => {
                if self.link.as_ref().is_some_and(|l| l.peer() == connection_id) {
                    info!(target: "pc.session", peer = %connection_id, "Peer left");
                    self.discard_link().await;
                }
            }
            ServerMessage::Signal { from, data } => self.handle_signal(from, data).await,
            ServerMessage::ApplicationSync { from, payload } => {
                // No subscribers is fine
                let _ = self.sync.send(SyncMessage { from, payload });
            }
        }
    }

    fn take_pending(&mut self, request_id: u64) -> Option<PendingRequest> {
        if self.pending.as_ref().is_some_and(|p| p.request_id == request_id) {
            self.pending.take()
        } else {
            debug!(target: "pc.session", request_id, "Response for unknown request ignored");
            None
        }
    }

    fn handle_request_accepted(&mut self, request_id: u64, room_id: RoomCode) {
        let Some(pending) = self.take_pending(request_id) else {
            return;
        };

        info!(
            target: "pc.session",
            room = %room_id,
            kind = pending.kind.as_str(),
            "In room"
        );
        self.room = Some(room_id.clone());
        self.retry.reset();
        self.error = None;
        pending.respond(Ok(room_id));
    }

    fn handle_request_failed(&mut self, request_id: u64, error: ClientError) {
        let Some(pending) = self.take_pending(request_id) else {
            return;
        };

        warn!(
            target: "pc.session",
            error = %error,
            kind = pending.kind.as_str(),
            "Request rejected"
        );

        if pending.kind == RequestKind::Rejoin {
            self.recovery_exhausted(format!("rejoin rejected: {error}"));
        } else {
            self.room = None;
            self.error = Some(error.user_message());
        }
        pending.respond(Err(error));
    }

    async fn handle_peer_joined(&mut self, peer: ConnectionId) {
        if self.room.is_none() {
            return;
        }
        if self.link.as_ref().is_some_and(|l| l.peer() == peer) {
            return;
        }

        info!(target: "pc.session", peer = %peer, "Peer joined, offering");
        if !self.open_link(peer, Role::Impolite).await {
            return;
        }
        let Some(link) = self.link.as_mut() else {
            return;
        };

        match link.offer(OfferReason::Initial).await {
            Ok(Some(offer)) => relay_signal(&mut self.channel, peer, offer).await,
            Ok(None) => {}
            Err(e) => {
                warn!(target: "pc.session", error = %e, "Initial offer failed");
                let action = link.on_negotiation_failure(&e.to_string());
                self.apply_recovery(action).await;
            }
        }
    }

    async fn handle_signal(&mut self, from: ConnectionId, data: Value) {
        if self.room.is_none() {
            return;
        }

        let data: SignalData = match serde_json::from_value(data) {
            Ok(data) => data,
            Err(e) => {
                debug!(target: "pc.session", error = %e, "Ignoring malformed signal");
                return;
            }
        };

        let for_current_link = self.link.as_ref().is_some_and(|l| l.peer() == from);
        if !for_current_link {
            if !matches!(data, SignalData::Offer { .. }) {
                debug!(
                    target: "pc.session",
                    from = %from,
                    kind = data.kind(),
                    "Signal for unknown peer dropped"
                );
                return;
            }
            info!(target: "pc.session", peer = %from, "Offer from new peer, answering");
            if !self.open_link(from, Role::Polite).await {
                return;
            }
        }

        let Some(link) = self.link.as_mut() else {
            return;
        };

        match link.handle_signal(data).await {
            Ok(outgoing) => {
                for signal in outgoing {
                    relay_signal(&mut self.channel, from, signal).await;
                }
            }
            Err(e) => {
                warn!(target: "pc.session", link = %link.id(), error = %e, "Negotiation step failed");
                let action = link.on_negotiation_failure(&e.to_string());
                self.apply_recovery(action).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Link lifecycle and recovery
    // ------------------------------------------------------------------

    /// Replace the current link with a fresh one. Returns false if the media
    /// backend could not create a session.
    async fn open_link(&mut self, peer: ConnectionId, role: Role) -> bool {
        self.discard_link().await;

        self.next_link_id += 1;
        let id = LinkId(self.next_link_id);

        let session = match self
            .media
            .create(id, self.ice_servers.current(), self.events_tx.clone())
            .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(target: "pc.session", link = %id, error = %e, "Media session creation failed");
                self.error = Some(ClientError::from(e).user_message());
                return false;
            }
        };

        let mut link = PeerLink::new(
            id,
            peer,
            role,
            session,
            self.config.max_restart_attempts,
            self.config.disconnect_check_delay,
        );
        for (kind, source) in self.local_media.sources() {
            if let Err(e) = link.add_local_source(kind, source).await {
                warn!(target: "pc.session", link = %id, error = %e, "Local source not attached");
            }
        }

        debug!(target: "pc.session", link = %id, role = role.as_str(), "Link opened");
        self.link = Some(link);
        true
    }

    async fn discard_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            debug!(target: "pc.session", link = %link.id(), "Link discarded");
            link.close().await;
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        if link.id() != event.link {
            debug!(target: "pc.session", link = %event.link, "Event for discarded link dropped");
            return;
        }

        match event.event {
            MediaEvent::LocalCandidate(candidate) => {
                let peer = link.peer();
                relay_signal(&mut self.channel, peer, SignalData::Candidate(candidate)).await;
            }
            MediaEvent::PathState(state) => {
                info!(target: "pc.session", link = %link.id(), state = state.as_str(), "Path state changed");
                let action = link.on_path_state(state, Instant::now());
                self.apply_recovery(action).await;
            }
        }
    }

    async fn handle_check_due(&mut self) {
        let Some(link) = self.link.as_mut() else {
            return;
        };
        let action = link.on_check_due();
        self.apply_recovery(action).await;
    }

    async fn apply_recovery(&mut self, mut action: RecoveryAction) {
        loop {
            let Some(link) = self.link.as_mut() else {
                return;
            };

            match action {
                RecoveryAction::None => return,
                RecoveryAction::ScheduleCheck(deadline) => {
                    debug!(
                        target: "pc.session",
                        link = %link.id(),
                        in_ms = deadline.saturating_duration_since(Instant::now()).as_millis(),
                        "Disconnected check armed"
                    );
                    return;
                }
                RecoveryAction::GiveUp { error } => {
                    warn!(target: "pc.session", link = %link.id(), error = %error, "Giving up on link");
                    return;
                }
                RecoveryAction::Restart { attempt } => {
                    info!(target: "pc.session", link = %link.id(), attempt, "Restarting ICE");
                    let peer = link.peer();
                    match link.offer(OfferReason::IceRestart).await {
                        Ok(Some(offer)) => {
                            relay_signal(&mut self.channel, peer, offer).await;
                            return;
                        }
                        Ok(None) => return,
                        Err(e) => {
                            warn!(target: "pc.session", error = %e, "Restart offer failed");
                            action = link.on_negotiation_failure(&e.to_string());
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Channel lifecycle
    // ------------------------------------------------------------------

    async fn ensure_channel(&mut self) -> Result<(), ClientError> {
        if self.channel.is_none() {
            let channel = self.connector.connect().await?;
            info!(
                target: "pc.session",
                connection_id = %channel.connection_id(),
                "Signaling channel opened"
            );
            self.channel = Some(channel);
        }
        Ok(())
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        match self.channel.as_mut() {
            Some(channel) => channel.send(message).await,
            None => Err(ClientError::ChannelLost),
        }
    }

    async fn handle_channel_lost(&mut self) {
        self.channel = None;
        let rejoining = self
            .pending
            .as_ref()
            .is_some_and(|p| p.kind == RequestKind::Rejoin);

        if let Some(pending) = self.pending.take() {
            pending.respond(Err(ClientError::ChannelLost));
        }

        if self.room.is_none() && !rejoining {
            info!(target: "pc.session", "Signaling channel closed");
            return;
        }

        warn!(target: "pc.session", room = ?self.room, "Signaling channel lost, reconnecting");

        // Negotiation starts over once the peer is back
        self.discard_link().await;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        match self.retry.next_delay() {
            Some(delay) => {
                debug!(
                    target: "pc.session",
                    attempt = self.retry.attempts(),
                    delay_ms = delay.as_millis(),
                    "Reconnect scheduled"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => self.recovery_exhausted(format!(
                "signaling channel not restored after {} attempts",
                self.retry.attempts()
            )),
        }
    }

    async fn handle_reconnect(&mut self) {
        self.reconnect_at = None;
        let Some(room) = self.room.clone() else {
            return;
        };

        if let Err(e) = self.ensure_channel().await {
            warn!(target: "pc.session", error = %e, "Reconnect failed");
            self.schedule_reconnect();
            return;
        }

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let message = ClientMessage::JoinRoom {
            request_id,
            room_id: room.as_str().to_string(),
            identity: self.config.identity.as_str().to_string(),
        };

        if let Err(e) = self.send(&message).await {
            warn!(target: "pc.session", error = %e, "Rejoin could not be sent");
            self.channel = None;
            self.schedule_reconnect();
            return;
        }

        info!(target: "pc.session", room = %room, "Rejoining room");
        self.pending = Some(PendingRequest {
            request_id,
            kind: RequestKind::Rejoin,
            deadline: Instant::now() + self.config.request_timeout,
            respond_to: None,
        });
    }

    async fn handle_request_timeout(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        warn!(
            target: "pc.session",
            request_id = pending.request_id,
            kind = pending.kind.as_str(),
            "Request timed out"
        );

        if pending.kind == RequestKind::Rejoin {
            // Treat a silent service like a dead channel
            if let Some(mut channel) = self.channel.take() {
                channel.close().await;
            }
            self.schedule_reconnect();
        } else {
            self.error = Some(ClientError::RequestTimeout.user_message());
        }
        pending.respond(Err(ClientError::RequestTimeout));
    }

    fn recovery_exhausted(&mut self, reason: String) {
        let error = ClientError::RecoveryExhausted(reason);
        warn!(target: "pc.session", error = %error, "Returning to lobby");
        self.room = None;
        self.reconnect_at = None;
        self.error = Some(error.to_string());
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    fn publish_status(&self) {
        let joining = self.reconnect_at.is_some() || self.pending.is_some();
        let phase = match (&self.room, joining) {
            (Some(_), false) if self.channel.is_some() => SessionPhase::Connected,
            (Some(_), _) | (None, true) => SessionPhase::Joining,
            (None, false) => SessionPhase::Lobby,
        };

        let link_error = self
            .link
            .as_ref()
            .and_then(|l| l.recovery().last_error())
            .map(str::to_string);

        let next = SessionStatus {
            phase,
            room: self.room.clone(),
            peer_present: self.link.is_some(),
            link: self.link.as_ref().map(PeerLink::path),
            error: link_error.or_else(|| self.error.clone()),
        };

        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn recv_from(channel: &mut Option<Box<dyn SignalingChannel>>) -> Option<ServerMessage> {
    match channel {
        Some(channel) => channel.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn relay_signal(
    channel: &mut Option<Box<dyn SignalingChannel>>,
    to: ConnectionId,
    signal: SignalData,
) {
    let Some(channel) = channel.as_mut() else {
        debug!(target: "pc.session", kind = signal.kind(), "No channel, signal dropped");
        return;
    };
    let kind = signal.kind();
    let data = match serde_json::to_value(&signal) {
        Ok(data) => data,
        Err(e) => {
            warn!(target: "pc.session", error = %e, "Signal encoding failed");
            return;
        }
    };
    // A broken channel shows up as channel loss on the next read
    if let Err(e) = channel.send(&ClientMessage::Signal { to, data }).await {
        warn!(target: "pc.session", kind, error = %e, "Signal send failed");
    }
}
