//! Test server harness for E2E testing
//!
//! Provides `TestRoomServer` for spawning real room service instances in tests.

use common::types::RoomCode;
use room_service::actors::room_table::FixedCodes;
use room_service::actors::{RegistryHandle, RegistryStats};
use room_service::app::App;
use room_service::config::Config;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Test harness for spawning the room service in E2E tests
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_ice_servers() -> Result<(), anyhow::Error> {
///     let server = TestRoomServer::spawn().await?;
///     let response = reqwest::get(format!("{}/ice-servers", server.url())).await?;
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestRoomServer {
    addr: SocketAddr,
    config: Config,
    registry: RegistryHandle,
    cancel_token: CancellationToken,
    server_handle: JoinHandle<()>,
}

impl TestRoomServer {
    /// Spawn a server with default configuration.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(&[]).await
    }

    /// Spawn a server with `RS_*` overrides, e.g.
    /// `[("RS_DISCONNECT_GRACE_PERIOD_SECONDS", "1")]`.
    pub async fn spawn_with(vars: &[(&str, &str)]) -> Result<Self, anyhow::Error> {
        let config = test_config(vars)?;
        let cancel_token = CancellationToken::new();
        let app = App::build(&config, cancel_token.child_token());
        Self::serve(config, app, cancel_token).await
    }

    /// Spawn a server whose rooms get the given codes in order.
    pub async fn spawn_with_codes(
        vars: &[(&str, &str)],
        codes: &[&str],
    ) -> Result<Self, anyhow::Error> {
        let config = test_config(vars)?;
        let codes = codes
            .iter()
            .map(|c| RoomCode::parse(c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid fixed room code: {}", e))?;

        let cancel_token = CancellationToken::new();
        let app = App::build_with_codes(
            &config,
            Box::new(FixedCodes::new(codes)),
            cancel_token.child_token(),
        );
        Self::serve(config, app, cancel_token).await
    }

    async fn serve(
        config: Config,
        app: App,
        cancel_token: CancellationToken,
    ) -> Result<Self, anyhow::Error> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let App {
            router, registry, ..
        } = app;

        let shutdown = cancel_token.clone();
        let server_handle = tokio::spawn(async move {
            let server = axum_serve(listener, router, shutdown);
            if let Err(e) = server.await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            config,
            registry,
            cancel_token,
            server_handle,
        })
    }

    /// Base HTTP URL, e.g. `http://127.0.0.1:41234`.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Signaling channel URL, e.g. `ws://127.0.0.1:41234/ws`.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registry counters, for asserting on server-side state.
    pub async fn stats(&self) -> Result<RegistryStats, anyhow::Error> {
        self.registry
            .stats()
            .await
            .map_err(|e| anyhow::anyhow!("Registry stats failed: {}", e))
    }

    /// Stop the server and close every signaling channel, as a restart would.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for TestRoomServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.server_handle.abort();
    }
}

fn test_config(vars: &[(&str, &str)]) -> Result<Config, anyhow::Error> {
    let mut map: HashMap<String, String> = HashMap::new();
    map.insert("RS_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string());
    map.insert(
        "RS_STUN_URLS".to_string(),
        "stun:stun.test.invalid:3478".to_string(),
    );
    for (key, value) in vars {
        map.insert((*key).to_string(), (*value).to_string());
    }
    Config::from_vars(&map).map_err(|e| anyhow::anyhow!("Invalid test config: {}", e))
}

async fn axum_serve(
    listener: tokio::net::TcpListener,
    router: axum::Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
