//! Peer client configuration.
//!
//! Configuration is loaded from environment variables. The durable identity
//! is redacted in Debug output.

use common::types::DurableIdentity;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default ICE restart ceiling per link.
pub const DEFAULT_MAX_RESTART_ATTEMPTS: u32 = 3;

/// Default delay before a `Disconnected` path is treated as broken.
pub const DEFAULT_DISCONNECT_CHECK_DELAY_MS: u64 = 1500;

/// Default number of signaling reconnect attempts after a channel loss.
pub const DEFAULT_CHANNEL_RETRY_ATTEMPTS: u32 = 5;

/// Default time to wait for a create/join acknowledgement.
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 10;

/// Default time without any frame from the room service before the channel
/// counts as lost. The service pings every 10 seconds.
pub const DEFAULT_CHANNEL_IDLE_TIMEOUT_SECONDS: u64 = 30;

/// Peer client configuration.
#[derive(Clone)]
pub struct Config {
    /// Signaling endpoint, e.g. `wss://rooms.example.org/ws`.
    pub signaling_url: String,

    /// ICE server list endpoint. Derived from `signaling_url` when unset.
    pub ice_servers_url: String,

    /// Identity presented on create/join; survives reconnects.
    pub identity: DurableIdentity,

    /// ICE restarts allowed before a link gives up.
    pub max_restart_attempts: u32,

    /// How long a path may stay `Disconnected` before a restart.
    pub disconnect_check_delay: Duration,

    /// Signaling reconnect attempts after a channel loss.
    pub channel_retry_attempts: u32,

    /// Create/join acknowledgement timeout.
    pub request_timeout: Duration,

    /// Silence on the signaling channel after which it is treated as lost.
    pub channel_idle_timeout: Duration,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("signaling_url", &self.signaling_url)
            .field("ice_servers_url", &self.ice_servers_url)
            .field("identity", &"[REDACTED]")
            .field("max_restart_attempts", &self.max_restart_attempts)
            .field("disconnect_check_delay", &self.disconnect_check_delay)
            .field("channel_retry_attempts", &self.channel_retry_attempts)
            .field("request_timeout", &self.request_timeout)
            .field("channel_idle_timeout", &self.channel_idle_timeout)
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
        let signaling_url = vars
            .get("PC_SIGNALING_URL")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnvVar("PC_SIGNALING_URL".to_string()))?;

        let ice_servers_url = match vars.get("PC_ICE_SERVERS_URL") {
            Some(url) => url.clone(),
            None => derive_ice_servers_url(&signaling_url)?,
        };

        let identity = match vars.get("PC_IDENTITY") {
            Some(raw) => DurableIdentity::new(raw.clone())
                .map_err(|e| ConfigError::InvalidValue(format!("PC_IDENTITY: {e}")))?,
            None => DurableIdentity::generate(),
        };

        let max_restart_attempts = parse_var(
            vars,
            "PC_MAX_RESTART_ATTEMPTS",
            DEFAULT_MAX_RESTART_ATTEMPTS,
        )?;

        let disconnect_check_delay_ms = parse_var(
            vars,
            "PC_DISCONNECT_CHECK_DELAY_MS",
            DEFAULT_DISCONNECT_CHECK_DELAY_MS,
        )?;

        let channel_retry_attempts = parse_var(
            vars,
            "PC_CHANNEL_RETRY_ATTEMPTS",
            DEFAULT_CHANNEL_RETRY_ATTEMPTS,
        )?;

        let request_timeout_seconds = parse_var(
            vars,
            "PC_REQUEST_TIMEOUT_SECONDS",
            DEFAULT_REQUEST_TIMEOUT_SECONDS,
        )?;
        if request_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "PC_REQUEST_TIMEOUT_SECONDS must be greater than zero".to_string(),
            ));
        }

        let channel_idle_timeout_seconds = parse_var(
            vars,
            "PC_CHANNEL_IDLE_TIMEOUT_SECONDS",
            DEFAULT_CHANNEL_IDLE_TIMEOUT_SECONDS,
        )?;
        if channel_idle_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "PC_CHANNEL_IDLE_TIMEOUT_SECONDS must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            signaling_url,
            ice_servers_url,
            identity,
            max_restart_attempts,
            disconnect_check_delay: Duration::from_millis(disconnect_check_delay_ms),
            channel_retry_attempts,
            request_timeout: Duration::from_secs(request_timeout_seconds),
            channel_idle_timeout: Duration::from_secs(channel_idle_timeout_seconds),
        })
    }

    /// Configuration with defaults for everything but the endpoint and
    /// identity.
    #[must_use]
    pub fn new(signaling_url: impl Into<String>, identity: DurableIdentity) -> Self {
        let signaling_url = signaling_url.into();
        let ice_servers_url =
            derive_ice_servers_url(&signaling_url).unwrap_or_else(|_| String::new());
        Self {
            signaling_url,
            ice_servers_url,
            identity,
            max_restart_attempts: DEFAULT_MAX_RESTART_ATTEMPTS,
            disconnect_check_delay: Duration::from_millis(DEFAULT_DISCONNECT_CHECK_DELAY_MS),
            channel_retry_attempts: DEFAULT_CHANNEL_RETRY_ATTEMPTS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
            channel_idle_timeout: Duration::from_secs(DEFAULT_CHANNEL_IDLE_TIMEOUT_SECONDS),
        }
    }
}

/// `ws://host/ws` -> `http://host/ice-servers` (and `wss` -> `https`).
fn derive_ice_servers_url(signaling_url: &str) -> Result<String, ConfigError> {
    let (scheme, rest) = if let Some(rest) = signaling_url.strip_prefix("wss://") {
        ("https://", rest)
    } else if let Some(rest) = signaling_url.strip_prefix("ws://") {
        ("http://", rest)
    } else {
        return Err(ConfigError::InvalidValue(format!(
            "PC_SIGNALING_URL must use ws:// or wss://, got {signaling_url}"
        )));
    };

    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(ConfigError::InvalidValue(
            "PC_SIGNALING_URL has no host".to_string(),
        ));
    }
    Ok(format!("{scheme}{authority}/ice-servers"))
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}: {raw:?}"))),
        None => Ok(default),
    }
}
