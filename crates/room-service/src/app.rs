//! Wiring of the registry and the public router, shared by the binary and
//! the test harness.

#[cfg(any(test, feature = "test-utils"))]
use crate::actors::room_table::RoomCodeSource;
use crate::actors::{RegistryActor, RegistryGauges, RegistryHandle, RegistrySettings};
use crate::config::Config;
use crate::routes::{build_routes, AppState};

use axum::Router;
use common::protocol::IceServerList;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running registry and the router that fronts it.
pub struct App {
    pub router: Router,
    pub registry: RegistryHandle,
    pub registry_task: JoinHandle<()>,
    pub gauges: Arc<RegistryGauges>,
}

impl App {
    /// Spawn the registry and build the public router.
    ///
    /// Cancelling `cancel_token` stops the registry and closes every
    /// signaling channel.
    #[must_use]
    pub fn build(config: &Config, cancel_token: CancellationToken) -> Self {
        let gauges = RegistryGauges::new();
        let (registry, registry_task) = RegistryActor::spawn(
            RegistrySettings::from(config),
            Arc::clone(&gauges),
            cancel_token,
        );
        Self::assemble(config, registry, registry_task, gauges)
    }

    /// Like [`App::build`] with a caller-chosen room code source.
    #[cfg(any(test, feature = "test-utils"))]
    #[must_use]
    pub fn build_with_codes(
        config: &Config,
        codes: Box<dyn RoomCodeSource>,
        cancel_token: CancellationToken,
    ) -> Self {
        let gauges = RegistryGauges::new();
        let (registry, registry_task) = RegistryActor::spawn_with_codes(
            RegistrySettings::from(config),
            codes,
            Arc::clone(&gauges),
            cancel_token,
        );
        Self::assemble(config, registry, registry_task, gauges)
    }

    fn assemble(
        config: &Config,
        registry: RegistryHandle,
        registry_task: JoinHandle<()>,
        gauges: Arc<RegistryGauges>,
    ) -> Self {
        let state = AppState {
            registry: registry.clone(),
            ice_servers: Arc::new(IceServerList {
                ice_servers: config.ice_servers(),
                ttl_seconds: config.ice_servers_ttl_seconds,
            }),
            max_message_bytes: config.max_message_bytes,
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
        };

        Self {
            router: build_routes(state),
            registry,
            registry_task,
            gauges,
        }
    }
}
