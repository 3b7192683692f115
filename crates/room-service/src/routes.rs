//! HTTP routes for the room service.

use crate::actors::RegistryHandle;
use crate::ws;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use common::protocol::IceServerList;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout for plain HTTP routes. Upgraded sockets are not subject
/// to it.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: RegistryHandle,

    /// Served verbatim by `GET /ice-servers`.
    pub ice_servers: Arc<IceServerList>,

    /// Largest accepted WebSocket frame.
    pub max_message_bytes: usize,

    /// Keepalive ping period for each channel.
    pub ping_interval: Duration,

    /// Read deadline; any inbound frame pushes it out.
    pub idle_timeout: Duration,
}

/// Build the public router:
/// - `GET /ws`: signaling channel
/// - `GET /ice-servers`: STUN/TURN descriptors for the media layer
pub fn build_routes(state: AppState) -> Router {
    let http_routes = Router::new()
        .route("/ice-servers", get(ice_servers_handler))
        .layer(TimeoutLayer::new(HTTP_TIMEOUT))
        .with_state(state.clone());

    Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .merge(http_routes)
        .layer(TraceLayer::new_for_http())
}

async fn ice_servers_handler(State(state): State<AppState>) -> Json<IceServerList> {
    Json(state.ice_servers.as_ref().clone())
}
