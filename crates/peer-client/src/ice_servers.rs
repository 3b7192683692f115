//! Background fetch of the ICE server list.
//!
//! Sessions read the current list through an [`IceServerReceiver`]. Until
//! the first successful fetch (or forever, if the endpoint never answers)
//! the list holds STUN-only defaults, so starting a session never waits on
//! this task.
//!
//! # Behaviour
//!
//! - Exponential backoff on failures (1s, 2s, 4s, ..., max 30s)
//! - Refresh at half the advertised TTL, clamped between one second and
//!   one hour
//! - Stops when every receiver is dropped or the token is cancelled
//!
//! TURN credentials in the list are never logged.

use common::protocol::{IceServer, IceServerList};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Public STUN server used until the service's list arrives.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Default HTTP request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const INITIAL_BACKOFF_MS: u64 = 1000;

const MAX_BACKOFF_MS: u64 = 30_000;

/// Bounds on the refresh interval derived from the TTL.
const MIN_REFRESH: Duration = Duration::from_secs(1);
const MAX_REFRESH: Duration = Duration::from_secs(3600);

#[derive(Error, Debug, Clone)]
pub enum IceServerError {
    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Invalid ICE server response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// STUN-only fallback list.
#[must_use]
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer::stun(DEFAULT_STUN_URL)]
}

/// Read side of the ICE server list.
#[derive(Clone, Debug)]
pub struct IceServerReceiver(watch::Receiver<Vec<IceServer>>);

impl IceServerReceiver {
    /// Current list (cloned so the sender is never blocked).
    #[must_use]
    pub fn current(&self) -> Vec<IceServer> {
        self.0.borrow().clone()
    }

    /// Wait for the list to change.
    ///
    /// # Errors
    ///
    /// Returns an error once the fetch task has stopped.
    pub async fn changed(&mut self) -> Result<(), watch::error::RecvError> {
        self.0.changed().await
    }

    /// A receiver that always yields `servers`, with no fetch task.
    #[must_use]
    pub fn fixed(servers: Vec<IceServer>) -> Self {
        let (_tx, rx) = watch::channel(servers);
        Self(rx)
    }
}

/// Spawn the fetch task for `url` (the service's `/ice-servers`).
///
/// Returns immediately; the receiver starts out with
/// [`default_ice_servers`].
///
/// # Errors
///
/// Returns `IceServerError::Configuration` if the HTTP client cannot be
/// built.
pub fn spawn_ice_server_fetcher(
    url: String,
    cancel_token: CancellationToken,
) -> Result<(JoinHandle<()>, IceServerReceiver), IceServerError> {
    let http_client = reqwest::Client::builder()
        .timeout(DEFAULT_HTTP_TIMEOUT)
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .build()
        .map_err(|e| IceServerError::Configuration(format!("Failed to build HTTP client: {e}")))?;

    let (sender, receiver) = watch::channel(default_ice_servers());

    let handle = tokio::spawn(async move {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(target: "pc.ice_servers", "Fetcher cancelled");
            }
            () = refresh_loop(url, http_client, sender) => {}
        }
    });

    Ok((handle, IceServerReceiver(receiver)))
}

#[instrument(skip_all, name = "pc.ice_servers")]
async fn refresh_loop(url: String, http_client: reqwest::Client, sender: watch::Sender<Vec<IceServer>>) {
    let mut backoff = INITIAL_BACKOFF_MS;
    let mut first = true;

    loop {
        match fetch(&url, &http_client).await {
            Ok(list) => {
                let server_count = list.ice_servers.len();
                let refresh = refresh_interval(list.ttl_seconds);

                if sender.send(list.ice_servers).is_err() {
                    debug!(target: "pc.ice_servers", "All receivers dropped, stopping");
                    return;
                }

                if first {
                    info!(
                        target: "pc.ice_servers",
                        server_count,
                        refresh_secs = refresh.as_secs(),
                        "ICE server list acquired"
                    );
                    first = false;
                } else {
                    debug!(target: "pc.ice_servers", server_count, "ICE server list refreshed");
                }

                backoff = INITIAL_BACKOFF_MS;
                tokio::time::sleep(refresh).await;
            }
            Err(e) => {
                warn!(
                    target: "pc.ice_servers",
                    error = %e,
                    backoff_ms = backoff,
                    "ICE server fetch failed, will retry"
                );
                if sender.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

fn refresh_interval(ttl_seconds: u64) -> Duration {
    Duration::from_secs(ttl_seconds / 2).clamp(MIN_REFRESH, MAX_REFRESH)
}

async fn fetch(url: &str, http_client: &reqwest::Client) -> Result<IceServerList, IceServerError> {
    let response = http_client
        .get(url)
        .send()
        .await
        .map_err(|e| IceServerError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(IceServerError::Http(format!("Unexpected status: {status}")));
    }

    let list: IceServerList = response
        .json()
        .await
        .map_err(|e| IceServerError::InvalidResponse(e.to_string()))?;

    if list.ice_servers.is_empty() {
        return Err(IceServerError::InvalidResponse(
            "empty server list".to_string(),
        ));
    }
    Ok(list)
}
