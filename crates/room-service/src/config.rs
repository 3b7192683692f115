//! Room service configuration.
//!
//! Configuration is loaded from environment variables. The TURN credential
//! is redacted in Debug output.

use common::protocol::IceServer;
use common::secret::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default signaling (WebSocket + ICE server endpoint) bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default ceiling on live rooms.
pub const DEFAULT_MAX_ROOMS: usize = 500;

/// Default reconnection grace period in seconds.
pub const DEFAULT_DISCONNECT_GRACE_PERIOD_SECONDS: u64 = 30;

/// Default maximum inbound WebSocket message size.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Default interval between server WebSocket pings.
pub const DEFAULT_PING_INTERVAL_SECONDS: u64 = 10;

/// Default time without any inbound frame before a channel counts as lost.
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 30;

/// Default STUN server list.
pub const DEFAULT_STUN_URLS: &str = "stun:stun.l.google.com:19302";

/// Default advertised lifetime of ICE server credentials.
pub const DEFAULT_ICE_SERVERS_TTL_SECONDS: u64 = 86_400;

/// Default time allowed for actors to drain on shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 10;

/// Room service configuration.
#[derive(Clone)]
pub struct Config {
    /// Signaling server bind address (default: "0.0.0.0:8080").
    pub bind_address: String,

    /// Health endpoint bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Maximum number of live rooms before `create-room` is refused.
    pub max_rooms: usize,

    /// How long a disconnected member's slot is held (default: 30).
    pub disconnect_grace_period_seconds: u64,

    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_bytes: usize,

    /// Interval between WebSocket pings sent to each client.
    pub ping_interval_seconds: u64,

    /// A channel with no inbound frame (pongs included) for this long is
    /// closed, which starts the member's grace period.
    pub idle_timeout_seconds: u64,

    /// STUN URLs handed to clients.
    pub stun_urls: Vec<String>,

    /// TURN URLs handed to clients (empty disables TURN).
    pub turn_urls: Vec<String>,

    /// TURN username.
    pub turn_username: Option<String>,

    /// TURN credential.
    /// Protected by `SecretString` to prevent accidental logging.
    pub turn_credential: Option<SecretString>,

    /// Advertised lifetime of the ICE server list.
    pub ice_servers_ttl_seconds: u64,

    /// Time allowed for actors to drain on shutdown.
    pub shutdown_timeout_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("max_rooms", &self.max_rooms)
            .field(
                "disconnect_grace_period_seconds",
                &self.disconnect_grace_period_seconds,
            )
            .field("max_message_bytes", &self.max_message_bytes)
            .field("ping_interval_seconds", &self.ping_interval_seconds)
            .field("idle_timeout_seconds", &self.idle_timeout_seconds)
            .field("stun_urls", &self.stun_urls)
            .field("turn_urls", &self.turn_urls)
            .field("turn_username", &self.turn_username)
            .field(
                "turn_credential",
                &self.turn_credential.as_ref().map(|_| "[REDACTED]"),
            )
            .field("ice_servers_ttl_seconds", &self.ice_servers_ttl_seconds)
            .field("shutdown_timeout_seconds", &self.shutdown_timeout_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let bind_address = vars
            .get("RS_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("RS_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let max_rooms = parse_var(vars, "RS_MAX_ROOMS", DEFAULT_MAX_ROOMS)?;
        if max_rooms == 0 {
            return Err(ConfigError::InvalidValue(
                "RS_MAX_ROOMS must be greater than zero".to_string(),
            ));
        }

        let disconnect_grace_period_seconds = parse_var(
            vars,
            "RS_DISCONNECT_GRACE_PERIOD_SECONDS",
            DEFAULT_DISCONNECT_GRACE_PERIOD_SECONDS,
        )?;
        if disconnect_grace_period_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "RS_DISCONNECT_GRACE_PERIOD_SECONDS must be greater than zero".to_string(),
            ));
        }

        let max_message_bytes =
            parse_var(vars, "RS_MAX_MESSAGE_BYTES", DEFAULT_MAX_MESSAGE_BYTES)?;

        let ping_interval_seconds = parse_var(
            vars,
            "RS_PING_INTERVAL_SECONDS",
            DEFAULT_PING_INTERVAL_SECONDS,
        )?;
        if ping_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "RS_PING_INTERVAL_SECONDS must be greater than zero".to_string(),
            ));
        }

        let idle_timeout_seconds =
            parse_var(vars, "RS_IDLE_TIMEOUT_SECONDS", DEFAULT_IDLE_TIMEOUT_SECONDS)?;
        if idle_timeout_seconds <= ping_interval_seconds {
            return Err(ConfigError::InvalidValue(
                "RS_IDLE_TIMEOUT_SECONDS must be greater than RS_PING_INTERVAL_SECONDS"
                    .to_string(),
            ));
        }

        let stun_urls = split_list(
            vars.get("RS_STUN_URLS")
                .map_or(DEFAULT_STUN_URLS, String::as_str),
        );
        let turn_urls = split_list(vars.get("RS_TURN_URLS").map_or("", String::as_str));

        let turn_username = vars.get("RS_TURN_USERNAME").cloned();
        let turn_credential = vars
            .get("RS_TURN_CREDENTIAL")
            .map(|v| SecretString::from(v.clone()));

        // TURN relays are useless without credentials
        if !turn_urls.is_empty() {
            if turn_username.is_none() {
                return Err(ConfigError::MissingEnvVar("RS_TURN_USERNAME".to_string()));
            }
            if turn_credential.is_none() {
                return Err(ConfigError::MissingEnvVar(
                    "RS_TURN_CREDENTIAL".to_string(),
                ));
            }
        }

        let ice_servers_ttl_seconds = parse_var(
            vars,
            "RS_ICE_SERVERS_TTL_SECONDS",
            DEFAULT_ICE_SERVERS_TTL_SECONDS,
        )?;

        let shutdown_timeout_seconds = parse_var(
            vars,
            "RS_SHUTDOWN_TIMEOUT_SECONDS",
            DEFAULT_SHUTDOWN_TIMEOUT_SECONDS,
        )?;

        Ok(Config {
            bind_address,
            health_bind_address,
            max_rooms,
            disconnect_grace_period_seconds,
            max_message_bytes,
            ping_interval_seconds,
            idle_timeout_seconds,
            stun_urls,
            turn_urls,
            turn_username,
            turn_credential,
            ice_servers_ttl_seconds,
            shutdown_timeout_seconds,
        })
    }

    /// Reconnection grace period as a `Duration`.
    #[must_use]
    pub fn disconnect_grace_period(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_period_seconds)
    }

    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// ICE servers advertised to clients: STUN first, then TURN.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();

        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                username: None,
                credential: None,
            });
        }

        if !self.turn_urls.is_empty() {
            servers.push(IceServer {
                urls: self.turn_urls.clone(),
                username: self.turn_username.clone(),
                credential: self
                    .turn_credential
                    .as_ref()
                    .map(|c| c.expose_secret().to_string()),
            });
        }

        servers
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}
