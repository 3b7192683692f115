//! Signaling channel to the room service.
//!
//! [`ChannelConnector`] opens a channel and waits for the `welcome` frame,
//! so a connected [`SignalingChannel`] always knows its connection id. The
//! session actor owns at most one channel at a time and treats
//! `recv() == None` as channel loss. A WebSocket channel that receives no
//! frame at all (the service pings regularly) for its idle timeout also
//! reports loss, so a dead network path is noticed without a close.

use crate::errors::ClientError;
use async_trait::async_trait;
use common::protocol::{ClientMessage, ServerMessage};
use common::types::ConnectionId;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, instrument};

/// How long to wait for the socket and the `welcome` frame.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait SignalingChannel: Send {
    /// Server-assigned id of this channel.
    fn connection_id(&self) -> ConnectionId;

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError>;

    /// Next server message. `None` means the channel is gone.
    ///
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Option<ServerMessage>;

    async fn close(&mut self);
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SignalingChannel>, ClientError>;
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector for a `/ws` endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    idle_timeout: Duration,
}

impl WsConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// How long a channel may go without any inbound frame.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    #[instrument(skip_all, name = "pc.channel.connect", fields(url = %self.url))]
    async fn connect(&self) -> Result<Box<dyn SignalingChannel>, ClientError> {
        let channel = tokio::time::timeout(CONNECT_TIMEOUT, handshake(&self.url, self.idle_timeout))
            .await
            .map_err(|_| ClientError::Channel("connect timed out".to_string()))??;

        debug!(
            target: "pc.channel",
            connection_id = %channel.connection_id,
            "Signaling channel connected"
        );
        Ok(Box::new(channel))
    }
}

async fn handshake(url: &str, idle_timeout: Duration) -> Result<WsChannel, ClientError> {
    let (socket, _) = connect_async(url)
        .await
        .map_err(|e| ClientError::Channel(format!("connect failed: {e}")))?;

    let mut channel = WsChannel {
        socket,
        connection_id: ConnectionId::new(),
        idle_timeout,
        last_frame: Instant::now(),
    };

    match channel.recv().await {
        Some(ServerMessage::Welcome { connection_id }) => {
            channel.connection_id = connection_id;
            Ok(channel)
        }
        Some(other) => Err(ClientError::Channel(format!(
            "expected welcome, got {}",
            other.kind()
        ))),
        None => Err(ClientError::ChannelLost),
    }
}

struct WsChannel {
    socket: Socket,
    connection_id: ConnectionId,
    idle_timeout: Duration,
    /// Kept across cancelled `recv` calls so the deadline does not slide.
    last_frame: Instant,
}

#[async_trait]
impl SignalingChannel for WsChannel {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ClientError> {
        let text = message
            .encode()
            .map_err(|e| ClientError::Channel(e.to_string()))?;
        self.socket
            .send(Message::Text(text))
            .await
            .map_err(|e| ClientError::Channel(format!("send failed: {e}")))
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            let deadline = self.last_frame + self.idle_timeout;
            let Ok(frame) = tokio::time::timeout_at(deadline, self.socket.next()).await else {
                info!(
                    target: "pc.channel",
                    connection_id = %self.connection_id,
                    idle_timeout_ms = self.idle_timeout.as_millis(),
                    "No frames from room service, treating channel as lost"
                );
                return None;
            };
            self.last_frame = Instant::now();

            match frame? {
                Ok(Message::Text(text)) => match ServerMessage::decode(&text) {
                    Ok(message) => return Some(message),
                    Err(e) => {
                        debug!(target: "pc.channel", error = %e, "Ignoring malformed frame");
                    }
                },
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => {
                    debug!(target: "pc.channel", error = %e, "Socket read failed");
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.socket.close(None).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// A one-shot service that sends `welcome`, then pings every
    /// `ping_every` or stays silent when `None`.
    async fn quiet_service(ping_every: Option<Duration>) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            let welcome = ServerMessage::Welcome {
                connection_id: ConnectionId::new(),
            };
            socket
                .send(Message::Text(welcome.encode().unwrap()))
                .await
                .unwrap();

            match ping_every {
                Some(period) => loop {
                    tokio::time::sleep(period).await;
                    if socket.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                },
                None => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(socket);
                }
            }
        });
        (url, task)
    }

    #[tokio::test]
    async fn test_silent_channel_reports_loss() {
        let (url, service) = quiet_service(None).await;
        let connector = WsConnector::new(url).with_idle_timeout(Duration::from_millis(300));
        let mut channel = connector.connect().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), channel.recv()).await;
        assert!(matches!(result, Ok(None)));
        service.abort();
    }

    #[tokio::test]
    async fn test_pings_keep_channel_alive() {
        let (url, service) = quiet_service(Some(Duration::from_millis(100))).await;
        let connector = WsConnector::new(url).with_idle_timeout(Duration::from_millis(300));
        let mut channel = connector.connect().await.unwrap();

        // Still waiting for a message well past the idle timeout
        let result = tokio::time::timeout(Duration::from_secs(1), channel.recv()).await;
        assert!(result.is_err());
        service.abort();
    }
}
