//! WebSocket signaling endpoint (`GET /ws`).
//!
//! Each upgraded socket is split: the write half goes to a
//! [`ConnectionActor`], the read half stays here and feeds decoded requests
//! to the registry in arrival order. When the read half ends for any reason
//! the registry is told the channel closed, which starts the member's grace
//! period if it was in a room.
//!
//! A socket that goes quiet without closing (a client that lost its network)
//! is detected by the read deadline: the connection actor pings every
//! `ping_interval`, and a channel with no inbound frame for `idle_timeout`
//! is treated as closed.

use crate::actors::{ConnectionActor, ConnectionHandle};
use crate::errors::RoomError;
use crate::observability::metrics as prom;
use crate::routes::AppState;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use common::protocol::{ClientMessage, ServerMessage};
use common::types::{ConnectionId, DurableIdentity};
use futures_util::StreamExt;
use std::time::Instant;
use tokio::time::Instant as Deadline;
use tracing::{debug, info, instrument, warn};

/// Upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let connection_id = ConnectionId::new();
    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, connection_id, state))
}

#[instrument(skip_all, name = "rs.ws", fields(connection_id = %connection_id))]
async fn handle_socket(socket: WebSocket, connection_id: ConnectionId, state: AppState) {
    let (sink, mut stream) = socket.split();
    let shutdown = state.registry.child_token();
    let (connection, writer) = ConnectionActor::spawn(connection_id, sink, state.ping_interval, shutdown.clone());

    // Welcome is queued before registering so it is always the first frame
    connection.try_send(ServerMessage::Welcome { connection_id });

    if let Err(e) = state.registry.register(connection.clone()).await {
        warn!(target: "rs.ws", error = %e, "Registry unavailable, closing channel");
        connection.cancel();
        let _ = writer.await;
        return;
    }

    info!(target: "rs.ws", "Signaling channel opened");

    let idle = tokio::time::sleep(state.idle_timeout);
    tokio::pin!(idle);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,

            () = &mut idle => {
                info!(
                    target: "rs.ws",
                    idle_timeout_secs = state.idle_timeout.as_secs(),
                    "Channel idle, treating as closed"
                );
                break;
            }

            frame = stream.next() => {
                if matches!(frame, Some(Ok(_))) {
                    idle.as_mut().reset(Deadline::now() + state.idle_timeout);
                }
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = dispatch(&state, &connection, &text).await {
                            warn!(target: "rs.ws", error = %e, "Registry unavailable, closing channel");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        debug!(target: "rs.ws", "Ignoring binary frame");
                    }
                    // Pings are answered by the socket itself; pongs only refresh the deadline
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(target: "rs.ws", error = %e, "Socket read failed");
                        break;
                    }
                }
            }
        }
    }

    let _ = state.registry.connection_closed(connection_id).await;
    close_writer(&connection);
    let _ = writer.await;

    info!(target: "rs.ws", "Signaling channel closed");
}

fn close_writer(connection: &ConnectionHandle) {
    if !connection.is_cancelled() {
        connection.close("channel closed");
    }
}

/// Decode one text frame and hand it to the registry.
///
/// Malformed frames are logged and ignored. Only a dead registry is an
/// error.
async fn dispatch(
    state: &AppState,
    connection: &ConnectionHandle,
    text: &str,
) -> Result<(), RoomError> {
    let connection_id = connection.connection_id();
    let message = match ClientMessage::decode(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(
                target: "rs.ws",
                error = %e,
                frame_len = text.len(),
                "Ignoring malformed frame"
            );
            return Ok(());
        }
    };

    let kind = message.kind();
    let started = Instant::now();

    match message {
        // The registry writes create/join outcomes to the client itself, and
        // a dead registry cancels `shutdown`, so the results are not needed here
        ClientMessage::CreateRoom {
            request_id,
            identity,
        } => {
            let Some(identity) = validate_identity(connection, request_id, identity) else {
                return Ok(());
            };
            let _ = state
                .registry
                .create_room(request_id, connection_id, identity)
                .await;
        }
        ClientMessage::JoinRoom {
            request_id,
            room_id,
            identity,
        } => {
            let Some(identity) = validate_identity(connection, request_id, identity) else {
                return Ok(());
            };
            let _ = state
                .registry
                .join_room(request_id, connection_id, room_id, identity)
                .await;
        }
        ClientMessage::LeaveRoom => state.registry.leave_room(connection_id).await?,
        ClientMessage::Signal { to, data } => {
            state.registry.relay(connection_id, to, data).await?;
        }
        ClientMessage::ApplicationSync { payload } => {
            state.registry.application_sync(connection_id, payload).await?;
        }
    }

    prom::record_message_latency(kind, started.elapsed());
    Ok(())
}

/// Parse the wire identity, answering `invalid-request` under the caller's
/// `request_id` when it is rejected.
fn validate_identity(
    connection: &ConnectionHandle,
    request_id: u64,
    raw: String,
) -> Option<DurableIdentity> {
    match DurableIdentity::new(raw) {
        Ok(identity) => Some(identity),
        Err(e) => {
            debug!(target: "rs.ws", request_id, error = %e, "Rejecting request with invalid identity");
            let error = RoomError::InvalidRequest(e.to_string());
            connection.try_send(ServerMessage::RequestFailed {
                request_id,
                code: error.error_code(),
                message: error.client_message(),
            });
            None
        }
    }
}
