//! Room Service
//!
//! Rendezvous and signaling server for two-party peer sessions.
//!
//! # Servers
//!
//! - Public server: `GET /ws` signaling channel and `GET /ice-servers`
//!   (default: 0.0.0.0:8080)
//! - Health server: `/health`, `/ready`, `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Spawn the registry actor and build the public router
//! 4. Bind both listeners (fail fast on bind errors)
//! 5. Mark ready and wait for a shutdown signal
//!
//! # Shutdown
//!
//! Readiness drops first, then the root token is cancelled: the registry
//! stops, every connection actor sends a close frame, and both servers stop
//! accepting.

#![warn(clippy::pedantic)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use room_service::app::App;
use room_service::config::Config;
use room_service::observability::{health_router, init_metrics_recorder, HealthState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "room_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Room Service");

    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        max_rooms = config.max_rooms,
        disconnect_grace_period_seconds = config.disconnect_grace_period_seconds,
        max_message_bytes = config.max_message_bytes,
        turn_enabled = !config.turn_urls.is_empty(),
        "Configuration loaded successfully"
    );

    // Must happen before any metric is recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to initialize metrics");
        e
    })?;

    let shutdown_token = CancellationToken::new();

    let App {
        router,
        registry,
        registry_task,
        gauges,
    } = App::build(&config, shutdown_token.child_token());
    info!("Registry actor started");

    let health_state = Arc::new(HealthState::new(registry));

    // Health server (liveness, readiness, Prometheus /metrics)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    // Public server
    let public_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid bind address");
        format!("Invalid bind address: {e}")
    })?;

    let public_listener = tokio::net::TcpListener::bind(public_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %public_addr, "Failed to bind public server");
            format!("Failed to bind public server to {public_addr}: {e}")
        })?;

    let health_shutdown = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    let public_shutdown = shutdown_token.child_token();
    let public_task = tokio::spawn(async move {
        info!(addr = %public_addr, "Public server starting");
        let server = axum::serve(public_listener, router).with_graceful_shutdown(async move {
            public_shutdown.cancelled().await;
            info!("Public server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Public server failed");
        }
    });

    health_state.set_accepting();
    info!("Room Service running - press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received, initiating graceful shutdown...");

    // Stop receiving new traffic before tearing anything down
    health_state.set_draining();

    shutdown_token.cancel();

    let drain = Duration::from_secs(config.shutdown_timeout_seconds);
    let drained = tokio::time::timeout(drain, async {
        let _ = registry_task.await;
        let _ = public_task.await;
        let _ = health_task.await;
    })
    .await;

    if drained.is_err() {
        warn!(
            timeout_secs = drain.as_secs(),
            "Shutdown timed out with tasks still running"
        );
    }

    let final_counts = gauges.snapshot();
    info!(
        rooms = final_counts.rooms,
        connections = final_counts.connections,
        "Room Service shutdown complete"
    );
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed; without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
