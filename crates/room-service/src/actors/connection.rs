//! `ConnectionActor`: owns the write half of one signaling channel.
//!
//! The registry never writes to a socket directly. It pushes
//! [`ServerMessage`]s into the connection's bounded mailbox with
//! [`ConnectionHandle::try_send`]; a slow client fills its own mailbox and
//! loses messages instead of stalling the registry.
//!
//! # Lifecycle
//!
//! 1. Spawned by the WebSocket handler right after upgrade
//! 2. Runs until the socket write fails, `Close` is received, or the
//!    service-wide token is cancelled; pings the client every
//!    `ping_interval` meanwhile
//! 3. On cancellation a close frame is sent before exiting

use super::messages::ConnectionMessage;
use super::metrics::{ActorType, MailboxMonitor, CONNECTION_MAILBOX_CAPACITY};

use axum::extract::ws::{close_code, CloseFrame, Message};
use common::protocol::ServerMessage;
use common::types::ConnectionId;
use futures_util::{Sink, SinkExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Handle to a `ConnectionActor`.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    sender: mpsc::Sender<ConnectionMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl ConnectionHandle {
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Queue a frame for the client without waiting.
    ///
    /// Returns `false` if the mailbox is full or the actor has exited; the
    /// drop is counted.
    pub fn try_send(&self, message: ServerMessage) -> bool {
        match self.sender.try_send(ConnectionMessage::Deliver(message)) {
            Ok(()) => {
                self.mailbox.record_enqueue();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.mailbox.record_drop();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    target: "rs.actor.connection",
                    connection_id = %self.connection_id,
                    "Mailbox closed, message discarded"
                );
                false
            }
        }
    }

    /// Ask the actor to close the channel.
    pub fn close(&self, reason: &'static str) {
        let _ = self.sender.try_send(ConnectionMessage::Close { reason });
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// A handle whose mailbox is read directly by the test.
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn for_test(connection_id: ConnectionId) -> (Self, mpsc::Receiver<ConnectionMessage>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_MAILBOX_CAPACITY);
        let handle = Self {
            connection_id,
            sender,
            cancel_token: CancellationToken::new(),
            mailbox: Arc::new(MailboxMonitor::new(
                ActorType::Connection,
                connection_id.to_string(),
            )),
        };
        (handle, receiver)
    }
}

/// Writes frames from its mailbox to one WebSocket sink.
pub struct ConnectionActor<S> {
    connection_id: ConnectionId,
    sink: S,
    receiver: mpsc::Receiver<ConnectionMessage>,
    ping_interval: Duration,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl<S> ConnectionActor<S>
where
    S: Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
{
    /// Spawn a connection actor writing to `sink`.
    ///
    /// `ping_interval` must be non-zero.
    pub fn spawn(
        connection_id: ConnectionId,
        sink: S,
        ping_interval: Duration,
        cancel_token: CancellationToken,
    ) -> (ConnectionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(CONNECTION_MAILBOX_CAPACITY);
        let mailbox = Arc::new(MailboxMonitor::new(
            ActorType::Connection,
            connection_id.to_string(),
        ));

        let actor = Self {
            connection_id,
            sink,
            receiver,
            ping_interval,
            cancel_token: cancel_token.clone(),
            mailbox: Arc::clone(&mailbox),
        };
        let task_handle = tokio::spawn(actor.run());

        let handle = ConnectionHandle {
            connection_id,
            sender,
            cancel_token,
            mailbox,
        };
        (handle, task_handle)
    }

    #[instrument(skip_all, name = "rs.actor.connection", fields(connection_id = %self.connection_id))]
    async fn run(mut self) {
        debug!(target: "rs.actor.connection", "ConnectionActor started");

        let mut keepalive =
            tokio::time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    self.close_socket("server shutting down").await;
                    break;
                }

                _ = keepalive.tick() => {
                    if let Err(e) = self.sink.send(Message::Ping(Vec::new())).await {
                        debug!(target: "rs.actor.connection", error = %e, "Ping failed");
                        break;
                    }
                }

                msg = self.receiver.recv() => {
                    let Some(message) = msg else {
                        break;
                    };
                    self.mailbox.record_dequeue();

                    match message {
                        ConnectionMessage::Deliver(message) => {
                            if !self.write(&message).await {
                                break;
                            }
                        }
                        ConnectionMessage::Close { reason } => {
                            self.close_socket(reason).await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rs.actor.connection",
            connection_id = %self.connection_id,
            messages_processed = self.mailbox.messages_processed(),
            messages_dropped = self.mailbox.messages_dropped(),
            "ConnectionActor stopped"
        );
    }

    /// Encode and write one frame. Returns `false` if the socket is gone.
    async fn write(&mut self, message: &ServerMessage) -> bool {
        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(
                    target: "rs.actor.connection",
                    connection_id = %self.connection_id,
                    message_type = message.kind(),
                    error = %e,
                    "Failed to encode outbound message"
                );
                return true;
            }
        };

        if let Err(e) = self.sink.send(Message::Text(text)).await {
            debug!(
                target: "rs.actor.connection",
                connection_id = %self.connection_id,
                error = %e,
                "Socket write failed"
            );
            return false;
        }
        true
    }

    async fn close_socket(&mut self, reason: &'static str) {
        let frame = CloseFrame {
            code: close_code::AWAY,
            reason: reason.into(),
        };
        let _ = self.sink.send(Message::Close(Some(frame))).await;
        let _ = self.sink.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use futures_util::sink;

    const PING: Duration = Duration::from_secs(10);

    /// Sink that forwards frames into an unbounded channel.
    fn channel_sink() -> (
        impl Sink<Message, Error = axum::Error> + Unpin + Send + 'static,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = sink::unfold(tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(axum::Error::new)?;
            Ok::<_, axum::Error>(tx)
        });
        (Box::pin(sink), rx)
    }

    #[tokio::test]
    async fn test_delivers_encoded_frames() {
        let (sink, mut frames) = channel_sink();
        let id = ConnectionId::new();
        let (handle, _task) = ConnectionActor::spawn(id, sink, PING, CancellationToken::new());

        assert!(handle.try_send(ServerMessage::Welcome { connection_id: id }));

        let frame = tokio::time::timeout(Duration::from_secs(1), frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            frame,
            Message::Text(ref text)
                if ServerMessage::decode(text).unwrap() == ServerMessage::Welcome { connection_id: id }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_sends_close_frame() {
        let (sink, mut frames) = channel_sink();
        let token = CancellationToken::new();
        let (_handle, task) = ConnectionActor::spawn(ConnectionId::new(), sink, PING, token.clone());

        token.cancel();
        task.await.unwrap();

        let frame = frames.recv().await.unwrap();
        assert!(matches!(frame, Message::Close(Some(f)) if f.code == close_code::AWAY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pings_client_on_interval() {
        let (sink, mut frames) = channel_sink();
        let (_handle, _task) =
            ConnectionActor::spawn(ConnectionId::new(), sink, PING, CancellationToken::new());

        let started = Instant::now();
        let frame = frames.recv().await.unwrap();
        assert!(matches!(frame, Message::Ping(_)));
        assert_eq!(started.elapsed(), PING);

        let frame = frames.recv().await.unwrap();
        assert!(matches!(frame, Message::Ping(_)));
        assert_eq!(started.elapsed(), PING * 2);
    }

    #[tokio::test]
    async fn test_full_mailbox_drops() {
        let (handle, _rx) = ConnectionHandle::for_test(ConnectionId::new());

        for _ in 0..CONNECTION_MAILBOX_CAPACITY {
            assert!(handle.try_send(ServerMessage::PeerLeft {
                connection_id: ConnectionId::new()
            }));
        }
        assert!(!handle.try_send(ServerMessage::PeerLeft {
            connection_id: ConnectionId::new()
        }));
        assert_eq!(handle.mailbox.messages_dropped(), 1);
    }

    #[tokio::test]
    async fn test_send_after_exit_fails() {
        let (handle, rx) = ConnectionHandle::for_test(ConnectionId::new());
        drop(rx);
        assert!(!handle.try_send(ServerMessage::PeerLeft {
            connection_id: ConnectionId::new()
        }));
    }
}
