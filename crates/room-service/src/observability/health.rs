//! Liveness and readiness probes.
//!
//! `GET /health` answers 200 as long as the process can serve HTTP.
//! `GET /ready` answers 200 with a small room summary only while the
//! service is accepting channels and the registry actor responds; otherwise
//! 503 with the reason. `/metrics` is merged onto this router in `main.rs`.

use crate::actors::RegistryHandle;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Longest a readiness probe waits on the registry mailbox.
const REGISTRY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Probe state shared between `main` and the health router.
#[derive(Debug)]
pub struct HealthState {
    accepting: AtomicBool,
    registry: RegistryHandle,
}

impl HealthState {
    /// Not accepting until [`HealthState::set_accepting`] is called.
    #[must_use]
    pub fn new(registry: RegistryHandle) -> Self {
        Self {
            accepting: AtomicBool::new(false),
            registry,
        }
    }

    /// Listener bound; start taking channels.
    pub fn set_accepting(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    /// Shutdown started; load balancers should stop sending new channels.
    pub fn set_draining(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

/// Router serving `/health` and `/ready`.
pub fn health_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/ready", get(readiness))
        .with_state(state)
}

fn unavailable(reason: &str) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "status": reason })),
    )
        .into_response()
}

async fn readiness(State(state): State<Arc<HealthState>>) -> Response {
    if !state.is_accepting() {
        return unavailable("not_accepting");
    }

    match tokio::time::timeout(REGISTRY_PROBE_TIMEOUT, state.registry.stats()).await {
        Ok(Ok(stats)) => Json(json!({
            "status": "ready",
            "rooms": stats.rooms,
            "connections": stats.connections,
            "reconnecting": stats.reconnecting,
        }))
        .into_response(),
        Ok(Err(e)) => {
            warn!(target: "rs.health", error = %e, "Registry unavailable");
            unavailable("registry_unavailable")
        }
        Err(_) => {
            warn!(target: "rs.health", "Registry probe timed out");
            unavailable("registry_unresponsive")
        }
    }
}
