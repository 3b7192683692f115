//! `RegistryActor`: the single owner of all room state.
//!
//! Every state transition (create, join, leave, disconnect, grace expiry,
//! relay) runs to completion inside this actor's loop, so the capacity
//! check and the insertion it guards can never interleave with another
//! request. Grace timers live in the same loop; an expiry is just another
//! event.
//!
//! Nothing in here awaits a socket. Outbound frames are queued on each
//! connection's mailbox with `try_send`.

use crate::errors::RoomError;
use crate::observability::metrics as prom;

use super::connection::ConnectionHandle;
use super::grace::{GraceExpiry, GraceTracker};
use super::messages::{RegistryMessage, RegistryStats};
use super::metrics::{
    ActorType, MailboxMonitor, RegistryGauges, REGISTRY_MAILBOX_CAPACITY,
};
use super::relay::{self, RelayRejection};
use super::room_table::{Departure, RandomCodes, RoomCodeSource, RoomSnapshot, RoomTable};

use common::protocol::ServerMessage;
use common::types::{ConnectionId, DurableIdentity, RoomCode};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Registry tunables.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    pub max_rooms: usize,
    pub grace_period: Duration,
}

impl From<&crate::config::Config> for RegistrySettings {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            max_rooms: config.max_rooms,
            grace_period: config.disconnect_grace_period(),
        }
    }
}

/// Handle to the `RegistryActor`.
#[derive(Clone, Debug)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl RegistryHandle {
    async fn send(&self, message: RegistryMessage) -> Result<(), RoomError> {
        self.sender
            .send(message)
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;
        self.mailbox.record_enqueue();
        Ok(())
    }

    async fn request<T>(
        &self,
        message: RegistryMessage,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, RoomError> {
        self.send(message).await?;
        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Register a freshly opened channel.
    pub async fn register(&self, connection: ConnectionHandle) -> Result<(), RoomError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryMessage::Register {
                connection,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    /// Create a room. The response frame is written to the caller by the
    /// registry.
    pub async fn create_room(
        &self,
        request_id: u64,
        connection_id: ConnectionId,
        identity: DurableIdentity,
    ) -> Result<RoomCode, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryMessage::CreateRoom {
                request_id,
                connection_id,
                identity,
                respond_to: tx,
            },
            rx,
        )
        .await?
    }

    /// Join a room. The response frame is written to the caller by the
    /// registry.
    pub async fn join_room(
        &self,
        request_id: u64,
        connection_id: ConnectionId,
        room_id: String,
        identity: DurableIdentity,
    ) -> Result<RoomCode, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryMessage::JoinRoom {
                request_id,
                connection_id,
                room_id,
                identity,
                respond_to: tx,
            },
            rx,
        )
        .await?
    }

    pub async fn leave_room(&self, connection_id: ConnectionId) -> Result<(), RoomError> {
        self.send(RegistryMessage::LeaveRoom { connection_id }).await
    }

    pub async fn relay(
        &self,
        from: ConnectionId,
        to: ConnectionId,
        data: Value,
    ) -> Result<(), RoomError> {
        self.send(RegistryMessage::Relay { from, to, data }).await
    }

    pub async fn application_sync(
        &self,
        from: ConnectionId,
        payload: Value,
    ) -> Result<(), RoomError> {
        self.send(RegistryMessage::ApplicationSync { from, payload })
            .await
    }

    /// Report a closed channel. Starts the grace period if the connection
    /// was in a room.
    pub async fn connection_closed(&self, connection_id: ConnectionId) -> Result<(), RoomError> {
        self.send(RegistryMessage::ConnectionClosed { connection_id })
            .await
    }

    pub async fn stats(&self) -> Result<RegistryStats, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.request(RegistryMessage::GetStats { respond_to: tx }, rx)
            .await
    }

    pub async fn room(&self, room_id: RoomCode) -> Result<Option<RoomSnapshot>, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.request(
            RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            },
            rx,
        )
        .await
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token for per-connection actors; cancelled together with the registry.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// The `RegistryActor` implementation.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    table: RoomTable,
    grace: GraceTracker,
    connections: HashMap<ConnectionId, ConnectionHandle>,
    mailbox: Arc<MailboxMonitor>,
    gauges: Arc<RegistryGauges>,
}

impl RegistryActor {
    /// Spawn the registry with random room codes.
    pub fn spawn(
        settings: RegistrySettings,
        gauges: Arc<RegistryGauges>,
        cancel_token: CancellationToken,
    ) -> (RegistryHandle, JoinHandle<()>) {
        Self::spawn_with_codes(settings, Box::new(RandomCodes::new()), gauges, cancel_token)
    }

    /// Spawn the registry drawing codes from `codes`.
    pub fn spawn_with_codes(
        settings: RegistrySettings,
        codes: Box<dyn RoomCodeSource>,
        gauges: Arc<RegistryGauges>,
        cancel_token: CancellationToken,
    ) -> (RegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_MAILBOX_CAPACITY);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Registry, "registry"));

        let actor = Self {
            receiver,
            cancel_token: cancel_token.clone(),
            table: RoomTable::new(settings.max_rooms, codes),
            grace: GraceTracker::new(settings.grace_period),
            connections: HashMap::new(),
            mailbox: Arc::clone(&mailbox),
            gauges,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RegistryHandle {
            sender,
            cancel_token,
            mailbox,
        };
        (handle, task_handle)
    }

    #[instrument(skip_all, name = "rs.actor.registry")]
    async fn run(mut self) {
        info!(
            target: "rs.actor.registry",
            grace_period_secs = self.grace.period().as_secs(),
            "RegistryActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "rs.actor.registry", "RegistryActor received cancellation signal");
                    break;
                }

                expiry = self.grace.next_expired() => {
                    self.handle_expiry(expiry);
                    self.publish_gauges();
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        debug!(target: "rs.actor.registry", "RegistryActor channel closed, exiting");
                        break;
                    };
                    self.mailbox.record_dequeue();
                    self.handle_message(message);
                    self.publish_gauges();
                }
            }
        }

        info!(
            target: "rs.actor.registry",
            rooms = self.table.room_count(),
            connections = self.connections.len(),
            pending_timers = self.grace.len(),
            messages_processed = self.mailbox.messages_processed(),
            "RegistryActor stopped"
        );
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Register {
                connection,
                respond_to,
            } => {
                self.connections
                    .insert(connection.connection_id(), connection);
                let _ = respond_to.send(());
            }

            RegistryMessage::CreateRoom {
                request_id,
                connection_id,
                identity,
                respond_to,
            } => {
                let result = self.handle_create(request_id, connection_id, identity);
                let _ = respond_to.send(result);
            }

            RegistryMessage::JoinRoom {
                request_id,
                connection_id,
                room_id,
                identity,
                respond_to,
            } => {
                let result = self.handle_join(request_id, connection_id, &room_id, identity);
                let _ = respond_to.send(result);
            }

            RegistryMessage::LeaveRoom { connection_id } => self.handle_leave(connection_id),

            RegistryMessage::Relay { from, to, data } => self.handle_relay(from, to, data),

            RegistryMessage::ApplicationSync { from, payload } => {
                self.handle_application_sync(from, payload);
            }

            RegistryMessage::ConnectionClosed { connection_id } => {
                self.handle_connection_closed(connection_id);
            }

            RegistryMessage::GetStats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.table.snapshot(&room_id));
            }
        }
    }

    fn handle_create(
        &mut self,
        request_id: u64,
        connection_id: ConnectionId,
        identity: DurableIdentity,
    ) -> Result<RoomCode, RoomError> {
        let result = self
            .ensure_registered(&connection_id)
            .and_then(|()| self.table.create_room(connection_id, identity.clone()));

        match result {
            Ok(outcome) => {
                self.grace.cancel(&identity);
                self.deliver(
                    &connection_id,
                    ServerMessage::RoomCreated {
                        request_id,
                        room_id: outcome.room_id.clone(),
                    },
                );
                self.apply_departures(outcome.departures);

                prom::record_room_created();
                info!(
                    target: "rs.actor.registry",
                    room_id = %outcome.room_id,
                    connection_id = %connection_id,
                    rooms = self.table.room_count(),
                    "Room created"
                );
                Ok(outcome.room_id)
            }
            Err(e) => {
                warn!(
                    target: "rs.actor.registry",
                    connection_id = %connection_id,
                    error = %e,
                    "Room creation rejected"
                );
                self.reject(request_id, &connection_id, &e);
                Err(e)
            }
        }
    }

    fn handle_join(
        &mut self,
        request_id: u64,
        connection_id: ConnectionId,
        raw_room_id: &str,
        identity: DurableIdentity,
    ) -> Result<RoomCode, RoomError> {
        let result = self
            .ensure_registered(&connection_id)
            .and_then(|()| self.table.join_room(connection_id, raw_room_id, identity.clone()));

        match result {
            Ok(outcome) => {
                self.grace.cancel(&identity);
                self.deliver(
                    &connection_id,
                    ServerMessage::RoomJoined {
                        request_id,
                        room_id: outcome.room_id.clone(),
                    },
                );
                self.apply_departures(outcome.departures);
                for member in &outcome.notify {
                    self.deliver(member, ServerMessage::PeerJoined { connection_id });
                }

                prom::record_room_join(if outcome.reconnected {
                    "rejoined"
                } else {
                    "joined"
                });
                info!(
                    target: "rs.actor.registry",
                    room_id = %outcome.room_id,
                    connection_id = %connection_id,
                    reconnected = outcome.reconnected,
                    replaced = outcome.replaced.len(),
                    "Room joined"
                );
                Ok(outcome.room_id)
            }
            Err(e) => {
                prom::record_room_join(e.error_code().as_str());
                info!(
                    target: "rs.actor.registry",
                    connection_id = %connection_id,
                    error = %e,
                    "Join rejected"
                );
                self.reject(request_id, &connection_id, &e);
                Err(e)
            }
        }
    }

    fn handle_leave(&mut self, connection_id: ConnectionId) {
        if let Some(departure) = self.table.leave(&connection_id) {
            info!(
                target: "rs.actor.registry",
                connection_id = %connection_id,
                "Member left room"
            );
            self.apply_departures(vec![departure]);
        }
    }

    fn handle_connection_closed(&mut self, connection_id: ConnectionId) {
        self.connections.remove(&connection_id);

        match self.table.mark_reconnecting(&connection_id) {
            Some((identity, room_id)) => {
                info!(
                    target: "rs.actor.registry",
                    connection_id = %connection_id,
                    room_id = %room_id,
                    grace_period_secs = self.grace.period().as_secs(),
                    "Member disconnected, holding slot"
                );
                self.grace.arm(identity, room_id);
            }
            None => {
                debug!(
                    target: "rs.actor.registry",
                    connection_id = %connection_id,
                    "Connection closed outside any room"
                );
            }
        }
    }

    fn handle_expiry(&mut self, expiry: GraceExpiry) {
        let departures = self.table.expire(&expiry.identity, &expiry.room_id);

        for departure in &departures {
            let outcome = match departure {
                Departure::RoomDeleted { .. } => "room_deleted",
                Departure::PeerLeft { .. } => "peer_left",
            };
            prom::record_grace_expiration(outcome);
        }

        info!(
            target: "rs.actor.registry",
            room_id = %expiry.room_id,
            evicted = departures.len(),
            "Grace period expired"
        );
        self.apply_departures(departures);
    }

    fn handle_relay(&mut self, from: ConnectionId, to: ConnectionId, data: Value) {
        match relay::authorize_signal(&self.table, &from, &to) {
            Err(rejection) => self.reject_relay(&from, Some(&to), rejection),
            Ok(route) if !route.target_live => {
                debug!(
                    target: "rs.actor.registry",
                    room_id = %route.room_id,
                    from = %from,
                    to = %to,
                    "Relay target is reconnecting, signal dropped"
                );
            }
            Ok(_) => {
                if self.deliver(&to, ServerMessage::Signal { from, data }) {
                    prom::record_signal_relayed("signal");
                }
            }
        }
    }

    fn handle_application_sync(&mut self, from: ConnectionId, payload: Value) {
        match relay::sync_targets(&self.table, &from) {
            Err(rejection) => self.reject_relay(&from, None, rejection),
            Ok((_, targets)) => {
                for target in &targets {
                    let message = ServerMessage::ApplicationSync {
                        from,
                        payload: payload.clone(),
                    };
                    if self.deliver(target, message) {
                        prom::record_signal_relayed("application_sync");
                    }
                }
            }
        }
    }

    fn reject_relay(&self, from: &ConnectionId, to: Option<&ConnectionId>, rejection: RelayRejection) {
        warn!(
            target: "rs.actor.registry",
            from = %from,
            to = ?to.map(ToString::to_string),
            reason = rejection.as_str(),
            error = %RoomError::UnauthorizedTarget,
            "Relay request dropped"
        );
        prom::record_signal_rejected(rejection.as_str());
    }

    /// Notify remaining members about departures.
    fn apply_departures(&self, departures: Vec<Departure>) {
        for departure in departures {
            match departure {
                Departure::RoomDeleted { room_id } => {
                    info!(
                        target: "rs.actor.registry",
                        room_id = %room_id,
                        rooms = self.table.room_count(),
                        "Room deleted"
                    );
                }
                Departure::PeerLeft {
                    room_id,
                    departed,
                    notify,
                } => {
                    debug!(
                        target: "rs.actor.registry",
                        room_id = %room_id,
                        departed = %departed,
                        "Notifying peer-left"
                    );
                    for member in &notify {
                        self.deliver(member, ServerMessage::PeerLeft {
                            connection_id: departed,
                        });
                    }
                }
            }
        }
    }

    fn reject(&self, request_id: u64, connection_id: &ConnectionId, error: &RoomError) {
        self.deliver(
            connection_id,
            ServerMessage::RequestFailed {
                request_id,
                code: error.error_code(),
                message: error.client_message(),
            },
        );
    }

    /// Queue a frame for a live connection. Returns whether it was queued.
    fn deliver(&self, connection_id: &ConnectionId, message: ServerMessage) -> bool {
        match self.connections.get(connection_id) {
            Some(connection) => connection.try_send(message),
            None => {
                debug!(
                    target: "rs.actor.registry",
                    connection_id = %connection_id,
                    message_type = message.kind(),
                    "No live connection, message dropped"
                );
                false
            }
        }
    }

    fn ensure_registered(&self, connection_id: &ConnectionId) -> Result<(), RoomError> {
        if self.connections.contains_key(connection_id) {
            Ok(())
        } else {
            Err(RoomError::Internal(format!(
                "connection {connection_id} is not registered"
            )))
        }
    }

    fn stats(&self) -> RegistryStats {
        RegistryStats {
            rooms: self.table.room_count(),
            connections: self.connections.len(),
            reconnecting: self.table.reconnecting_count(),
            pending_timers: self.grace.len(),
        }
    }

    fn publish_gauges(&self) {
        let stats = self.stats();
        self.gauges
            .update(stats.rooms, stats.connections, stats.reconnecting);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::ConnectionMessage;
    use crate::actors::room_table::{FixedCodes, MemberState};
    use common::protocol::ErrorCode;
    use serde_json::json;
    use tokio::time::{advance, timeout};

    const GRACE: Duration = Duration::from_secs(30);

    fn code(s: &str) -> RoomCode {
        RoomCode::parse(s).unwrap()
    }

    fn identity(s: &str) -> DurableIdentity {
        DurableIdentity::new(s).unwrap()
    }

    fn spawn_registry(max_rooms: usize, codes: &[&str]) -> RegistryHandle {
        let (handle, _task) = RegistryActor::spawn_with_codes(
            RegistrySettings {
                max_rooms,
                grace_period: GRACE,
            },
            Box::new(FixedCodes::new(codes.iter().map(|c| code(c)))),
            RegistryGauges::new(),
            CancellationToken::new(),
        );
        handle
    }

    struct Client {
        id: ConnectionId,
        rx: mpsc::Receiver<ConnectionMessage>,
    }

    impl Client {
        async fn connect(registry: &RegistryHandle) -> Self {
            let id = ConnectionId::new();
            let (handle, rx) = ConnectionHandle::for_test(id);
            registry.register(handle).await.unwrap();
            Self { id, rx }
        }

        async fn next(&mut self) -> ServerMessage {
            match timeout(Duration::from_secs(1), self.rx.recv()).await {
                Ok(Some(ConnectionMessage::Deliver(msg))) => msg,
                other => unreachable!("expected a frame, got {other:?}"),
            }
        }

        /// Nothing is queued right now.
        fn assert_idle(&mut self) {
            assert!(
                self.rx.try_recv().is_err(),
                "unexpected frame queued for {}",
                self.id
            );
        }
    }

    /// Creator `a` (identity alice) and joiner `b` (identity bob) in K3M9PQXT.
    async fn paired_room(registry: &RegistryHandle) -> (Client, Client) {
        let mut a = Client::connect(registry).await;
        let mut b = Client::connect(registry).await;

        registry.create_room(1, a.id, identity("alice")).await.unwrap();
        assert!(matches!(a.next().await, ServerMessage::RoomCreated { request_id: 1, .. }));

        registry
            .join_room(1, b.id, "K3M9PQXT".to_string(), identity("bob"))
            .await
            .unwrap();
        assert!(matches!(b.next().await, ServerMessage::RoomJoined { request_id: 1, .. }));
        assert_eq!(a.next().await, ServerMessage::PeerJoined { connection_id: b.id });

        (a, b)
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_then_join_notifies_creator() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (mut a, mut b) = paired_room(&registry).await;

        a.assert_idle();
        b.assert_idle();

        let snapshot = registry.room(code("K3M9PQXT")).await.unwrap().unwrap();
        assert_eq!(snapshot.effective_members, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_join_is_room_full() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (mut a, mut b) = paired_room(&registry).await;
        let mut c = Client::connect(&registry).await;

        let result = registry
            .join_room(7, c.id, "K3M9PQXT".to_string(), identity("carol"))
            .await;
        assert!(matches!(result, Err(RoomError::RoomFull(_))));
        assert_eq!(
            c.next().await,
            ServerMessage::RequestFailed {
                request_id: 7,
                code: ErrorCode::RoomFull,
                message: "Room is full".to_string(),
            }
        );
        a.assert_idle();
        b.assert_idle();
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_unknown_room_is_not_found() {
        let registry = spawn_registry(500, &[]);
        let mut c = Client::connect(&registry).await;

        let result = registry
            .join_room(3, c.id, "ZZZZZZZZ".to_string(), identity("carol"))
            .await;
        assert!(matches!(result, Err(RoomError::RoomNotFound(_))));
        assert!(matches!(
            c.next().await,
            ServerMessage::RequestFailed {
                code: ErrorCode::RoomNotFound,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_at_capacity() {
        let registry = spawn_registry(1, &["K3M9PQXT"]);
        let a = Client::connect(&registry).await;
        let mut c = Client::connect(&registry).await;
        registry.create_room(1, a.id, identity("alice")).await.unwrap();

        let result = registry.create_room(2, c.id, identity("carol")).await;
        assert!(matches!(result, Err(RoomError::AtCapacity { max_rooms: 1 })));
        assert!(matches!(
            c.next().await,
            ServerMessage::RequestFailed {
                code: ErrorCode::AtCapacity,
                ..
            }
        ));
        assert_eq!(registry.stats().await.unwrap().rooms, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_within_grace_sends_no_peer_left() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (mut a, b) = paired_room(&registry).await;

        registry.connection_closed(b.id).await.unwrap();
        assert_eq!(registry.stats().await.unwrap().pending_timers, 1);

        advance(Duration::from_secs(10)).await;

        let mut b2 = Client::connect(&registry).await;
        registry
            .join_room(2, b2.id, "K3M9PQXT".to_string(), identity("bob"))
            .await
            .unwrap();
        assert!(matches!(b2.next().await, ServerMessage::RoomJoined { .. }));

        // A learns about the new connection, never about a departure
        assert_eq!(a.next().await, ServerMessage::PeerJoined { connection_id: b2.id });

        advance(Duration::from_secs(60)).await;
        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.pending_timers, 0);
        assert_eq!(stats.reconnecting, 0);
        a.assert_idle();

        let snapshot = registry.room(code("K3M9PQXT")).await.unwrap().unwrap();
        assert_eq!(snapshot.members.len(), 2);
        assert!(snapshot.members.contains(&(b2.id, MemberState::Active)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_sends_exactly_one_peer_left() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (mut a, b) = paired_room(&registry).await;

        registry.connection_closed(b.id).await.unwrap();
        a.assert_idle();

        advance(Duration::from_secs(31)).await;
        assert_eq!(a.next().await, ServerMessage::PeerLeft { connection_id: b.id });

        advance(Duration::from_secs(60)).await;
        registry.stats().await.unwrap();
        a.assert_idle();

        // Last member leaving deletes the room
        registry.leave_room(a.id).await.unwrap();
        assert!(registry.room(code("K3M9PQXT")).await.unwrap().is_none());
        assert_eq!(registry.stats().await.unwrap().rooms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_after_expiry_is_a_fresh_join() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (mut a, b) = paired_room(&registry).await;

        registry.connection_closed(b.id).await.unwrap();
        advance(Duration::from_secs(31)).await;
        assert_eq!(a.next().await, ServerMessage::PeerLeft { connection_id: b.id });

        // Room has space, so bob gets back in as an ordinary member
        let mut b2 = Client::connect(&registry).await;
        registry
            .join_room(4, b2.id, "K3M9PQXT".to_string(), identity("bob"))
            .await
            .unwrap();
        assert!(matches!(b2.next().await, ServerMessage::RoomJoined { .. }));
        assert_eq!(a.next().await, ServerMessage::PeerJoined { connection_id: b2.id });
    }

    #[tokio::test(start_paused = true)]
    async fn test_sole_member_expiry_deletes_room() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let a = Client::connect(&registry).await;
        registry.create_room(1, a.id, identity("alice")).await.unwrap();

        registry.connection_closed(a.id).await.unwrap();
        assert!(registry.room(code("K3M9PQXT")).await.unwrap().is_some());

        advance(Duration::from_secs(31)).await;
        assert!(registry.room(code("K3M9PQXT")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_disconnects_rearm_single_timer() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (mut a, b) = paired_room(&registry).await;

        registry.connection_closed(b.id).await.unwrap();
        advance(Duration::from_secs(20)).await;

        let mut b2 = Client::connect(&registry).await;
        registry
            .join_room(2, b2.id, "K3M9PQXT".to_string(), identity("bob"))
            .await
            .unwrap();
        b2.next().await;
        a.next().await;
        registry.connection_closed(b2.id).await.unwrap();

        // 31s after the first disconnect: the first timer must not fire
        advance(Duration::from_secs(11)).await;
        registry.stats().await.unwrap();
        a.assert_idle();

        advance(Duration::from_secs(20)).await;
        assert_eq!(a.next().await, ServerMessage::PeerLeft { connection_id: b2.id });
        advance(Duration::from_secs(60)).await;
        registry.stats().await.unwrap();
        a.assert_idle();
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_bypass_lets_reconnecting_identity_into_full_room() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (_a, b) = paired_room(&registry).await;
        registry.connection_closed(b.id).await.unwrap();

        // A third party takes the freed live slot
        let mut c = Client::connect(&registry).await;
        registry
            .join_room(5, c.id, "K3M9PQXT".to_string(), identity("carol"))
            .await
            .unwrap();
        c.next().await;

        // Bob still gets back in
        let mut b2 = Client::connect(&registry).await;
        registry
            .join_room(6, b2.id, "K3M9PQXT".to_string(), identity("bob"))
            .await
            .unwrap();
        assert!(matches!(b2.next().await, ServerMessage::RoomJoined { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_relayed_within_room() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (mut a, mut b) = paired_room(&registry).await;

        let offer = json!({"type": "offer", "sdp": "v=0"});
        registry.relay(a.id, b.id, offer.clone()).await.unwrap();

        assert_eq!(
            b.next().await,
            ServerMessage::Signal {
                from: a.id,
                data: offer
            }
        );
        a.assert_idle();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cross_room_signal_dropped_silently() {
        let registry = spawn_registry(500, &["K3M9PQXT", "ABCDEFGH"]);
        let (mut a, mut b) = paired_room(&registry).await;
        let mut c = Client::connect(&registry).await;
        registry.create_room(1, c.id, identity("carol")).await.unwrap();
        c.next().await;

        registry.relay(c.id, a.id, json!({"type": "offer"})).await.unwrap();
        registry.stats().await.unwrap();

        a.assert_idle();
        b.assert_idle();
        c.assert_idle();
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_sync_reaches_other_member_only() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (mut a, mut b) = paired_room(&registry).await;

        registry
            .application_sync(a.id, json!({"board": [1, 2]}))
            .await
            .unwrap();

        assert_eq!(
            b.next().await,
            ServerMessage::ApplicationSync {
                from: a.id,
                payload: json!({"board": [1, 2]})
            }
        );
        a.assert_idle();
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_leave_notifies_immediately() {
        let registry = spawn_registry(500, &["K3M9PQXT"]);
        let (mut a, b) = paired_room(&registry).await;

        registry.leave_room(b.id).await.unwrap();
        assert_eq!(a.next().await, ServerMessage::PeerLeft { connection_id: b.id });
        assert_eq!(registry.stats().await.unwrap().pending_timers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_outside_room_arms_nothing() {
        let registry = spawn_registry(500, &[]);
        let c = Client::connect(&registry).await;

        registry.connection_closed(c.id).await.unwrap();
        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.pending_timers, 0);
        assert_eq!(stats.connections, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_connection_is_rejected() {
        let registry = spawn_registry(500, &[]);
        let result = registry
            .create_room(1, ConnectionId::new(), identity("ghost"))
            .await;
        assert!(matches!(result, Err(RoomError::Internal(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_actor() {
        let token = CancellationToken::new();
        let (handle, task) = RegistryActor::spawn(
            RegistrySettings {
                max_rooms: 10,
                grace_period: GRACE,
            },
            RegistryGauges::new(),
            token.clone(),
        );

        handle.cancel();
        task.await.unwrap();
        assert!(token.is_cancelled());
        assert!(handle.stats().await.is_err());
    }
}
