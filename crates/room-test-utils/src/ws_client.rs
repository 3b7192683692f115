//! Minimal signaling client for driving the room service from tests.

use common::protocol::{ClientMessage, ErrorCode, ServerMessage};
use common::types::{ConnectionId, RoomCode};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long `recv` waits before failing the test.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connected signaling channel.
///
/// `connect` consumes the `welcome` frame, so `connection_id()` is always
/// known.
pub struct TestWsClient {
    socket: Socket,
    connection_id: ConnectionId,
    next_request_id: u64,
}

impl TestWsClient {
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to {}: {}", url, e))?;

        let mut client = Self {
            socket,
            connection_id: ConnectionId::new(),
            next_request_id: 1,
        };

        match client.recv().await? {
            ServerMessage::Welcome { connection_id } => client.connection_id = connection_id,
            other => anyhow::bail!("Expected welcome, got {:?}", other),
        }
        Ok(client)
    }

    /// Connection id assigned by the server.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), anyhow::Error> {
        let text = message.encode()?;
        self.send_raw(text).await
    }

    /// Send an arbitrary text frame, valid or not.
    pub async fn send_raw(&mut self, text: impl Into<String>) -> Result<(), anyhow::Error> {
        self.socket
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| anyhow::anyhow!("Send failed: {}", e))
    }

    /// Next server message, failing after [`DEFAULT_RECV_TIMEOUT`].
    pub async fn recv(&mut self) -> Result<ServerMessage, anyhow::Error> {
        self.recv_timeout(DEFAULT_RECV_TIMEOUT)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Timed out waiting for a server message"))
    }

    /// Next server message, or `None` if nothing arrives within `timeout`.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ServerMessage>, anyhow::Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.socket.next()).await {
                Err(_) => return Ok(None),
                Ok(frame) => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => return Ok(Some(ServerMessage::decode(&text)?)),
                Some(Ok(Message::Close(frame))) => {
                    anyhow::bail!("Channel closed by server: {:?}", frame)
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => anyhow::bail!("Receive failed: {}", e),
                None => anyhow::bail!("Channel ended"),
            }
        }
    }

    /// Assert that nothing arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<(), anyhow::Error> {
        match self.recv_timeout(window).await? {
            None => Ok(()),
            Some(message) => anyhow::bail!("Expected no message, got {:?}", message),
        }
    }

    /// Wait until the server closes the channel.
    pub async fn expect_closed(&mut self) -> Result<(), anyhow::Error> {
        let result = tokio::time::timeout(DEFAULT_RECV_TIMEOUT, async {
            loop {
                match self.socket.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        result.map_err(|_| anyhow::anyhow!("Channel was not closed"))
    }

    fn request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }

    /// Create a room and return its code.
    pub async fn create_room(&mut self, identity: &str) -> Result<RoomCode, anyhow::Error> {
        let request_id = self.request_id();
        self.send(&ClientMessage::CreateRoom {
            request_id,
            identity: identity.to_string(),
        })
        .await?;

        match self.recv().await? {
            ServerMessage::RoomCreated {
                request_id: got,
                room_id,
            } if got == request_id => Ok(room_id),
            other => anyhow::bail!("Expected room-created, got {:?}", other),
        }
    }

    /// Join a room and return its normalized code.
    pub async fn join_room(
        &mut self,
        room_id: &str,
        identity: &str,
    ) -> Result<RoomCode, anyhow::Error> {
        match self.try_join_room(room_id, identity).await? {
            Ok(room) => Ok(room),
            Err(code) => anyhow::bail!("Join rejected with {:?}", code),
        }
    }

    /// Join a room, returning the rejection code instead of failing.
    pub async fn try_join_room(
        &mut self,
        room_id: &str,
        identity: &str,
    ) -> Result<Result<RoomCode, ErrorCode>, anyhow::Error> {
        let request_id = self.request_id();
        self.send(&ClientMessage::JoinRoom {
            request_id,
            room_id: room_id.to_string(),
            identity: identity.to_string(),
        })
        .await?;

        match self.recv().await? {
            ServerMessage::RoomJoined {
                request_id: got,
                room_id,
            } if got == request_id => Ok(Ok(room_id)),
            ServerMessage::RequestFailed {
                request_id: got,
                code,
                ..
            } if got == request_id => Ok(Err(code)),
            other => anyhow::bail!("Expected join outcome, got {:?}", other),
        }
    }

    pub async fn leave_room(&mut self) -> Result<(), anyhow::Error> {
        self.send(&ClientMessage::LeaveRoom).await
    }

    pub async fn signal(&mut self, to: ConnectionId, data: Value) -> Result<(), anyhow::Error> {
        self.send(&ClientMessage::Signal { to, data }).await
    }

    pub async fn application_sync(&mut self, payload: Value) -> Result<(), anyhow::Error> {
        self.send(&ClientMessage::ApplicationSync { payload }).await
    }

    /// Expect `peer-joined` and return the peer's connection id.
    pub async fn expect_peer_joined(&mut self) -> Result<ConnectionId, anyhow::Error> {
        match self.recv().await? {
            ServerMessage::PeerJoined { connection_id } => Ok(connection_id),
            other => anyhow::bail!("Expected peer-joined, got {:?}", other),
        }
    }

    /// Expect `peer-left` and return the departed connection id.
    pub async fn expect_peer_left(&mut self) -> Result<ConnectionId, anyhow::Error> {
        match self.recv().await? {
            ServerMessage::PeerLeft { connection_id } => Ok(connection_id),
            other => anyhow::bail!("Expected peer-left, got {:?}", other),
        }
    }

    /// Expect a relayed `signal` and return `(from, data)`.
    pub async fn expect_signal(&mut self) -> Result<(ConnectionId, Value), anyhow::Error> {
        match self.recv().await? {
            ServerMessage::Signal { from, data } => Ok((from, data)),
            other => anyhow::bail!("Expected signal, got {:?}", other),
        }
    }

    /// Close the channel cleanly.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.socket
            .close(None)
            .await
            .map_err(|e| anyhow::anyhow!("Close failed: {}", e))
    }

    /// Drop the TCP connection without a close handshake, as a network
    /// failure would.
    pub fn drop_abruptly(self) {
        drop(self.socket);
    }
}
