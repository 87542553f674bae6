//! Mesh client configuration.
//!
//! Configuration is loaded from environment variables. The TURN credential
//! is redacted in Debug output.

use common::secret::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default ICE servers (public STUN).
pub const DEFAULT_ICE_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Default quiescence window before a disconnected session closes.
pub const DEFAULT_DISCONNECT_GRACE_MS: u64 = 5_000;

/// Default bound for a session to reach transport connectivity.
pub const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 30_000;

/// Default time presence may stay degraded before all sessions close.
pub const DEFAULT_PRESENCE_DEGRADED_GRACE_MS: u64 = 15_000;

/// Default bound on a single relay insert.
pub const DEFAULT_RELAY_SEND_TIMEOUT_MS: u64 = 5_000;

/// Default bound on a single transport call.
pub const DEFAULT_TRANSPORT_OP_TIMEOUT_MS: u64 = 10_000;

/// Default housekeeping tick.
pub const DEFAULT_HOUSEKEEPING_INTERVAL_MS: u64 = 1_000;

/// Default cap on concurrent peer sessions.
pub const DEFAULT_MAX_PEERS: usize = 16;

/// Mesh client configuration.
#[derive(Clone)]
pub struct Config {
    /// ICE server URLs handed to every transport.
    pub ice_servers: Vec<String>,

    /// TURN username applied to every ICE server.
    pub turn_username: Option<String>,

    /// TURN credential.
    /// Protected by `SecretString` to prevent accidental logging.
    pub turn_credential: Option<SecretString>,

    /// How long a `Disconnected` session may wait for recovery.
    pub disconnect_grace: Duration,

    /// How long a session may take to reach transport connectivity.
    pub negotiation_timeout: Duration,

    /// How long presence may stay degraded before every session closes.
    pub presence_degraded_grace: Duration,

    /// Bound on one relay insert.
    pub relay_send_timeout: Duration,

    /// Bound on one transport call.
    pub transport_op_timeout: Duration,

    /// Housekeeping tick interval.
    pub housekeeping_interval: Duration,

    /// Maximum concurrent peer sessions.
    pub max_peers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| (*s).to_string()).collect(),
            turn_username: None,
            turn_credential: None,
            disconnect_grace: Duration::from_millis(DEFAULT_DISCONNECT_GRACE_MS),
            negotiation_timeout: Duration::from_millis(DEFAULT_NEGOTIATION_TIMEOUT_MS),
            presence_degraded_grace: Duration::from_millis(DEFAULT_PRESENCE_DEGRADED_GRACE_MS),
            relay_send_timeout: Duration::from_millis(DEFAULT_RELAY_SEND_TIMEOUT_MS),
            transport_op_timeout: Duration::from_millis(DEFAULT_TRANSPORT_OP_TIMEOUT_MS),
            housekeeping_interval: Duration::from_millis(DEFAULT_HOUSEKEEPING_INTERVAL_MS),
            max_peers: DEFAULT_MAX_PEERS,
        }
    }
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("ice_servers", &self.ice_servers)
            .field("turn_username", &self.turn_username)
            .field(
                "turn_credential",
                &self.turn_credential.as_ref().map(|_| "[REDACTED]"),
            )
            .field("disconnect_grace", &self.disconnect_grace)
            .field("negotiation_timeout", &self.negotiation_timeout)
            .field("presence_degraded_grace", &self.presence_degraded_grace)
            .field("relay_send_timeout", &self.relay_send_timeout)
            .field("transport_op_timeout", &self.transport_op_timeout)
            .field("housekeeping_interval", &self.housekeeping_interval)
            .field("max_peers", &self.max_peers)
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

/// Parse a positive millisecond duration, falling back to `default_ms`.
fn parse_duration_ms(
    vars: &HashMap<String, String>,
    name: &str,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(Duration::from_millis(default_ms));
    };

    let value: u64 = value_str.trim().parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{name} must be a valid positive integer, got '{value_str}': {e}"
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{name} must be greater than 0"
        )));
    }

    Ok(Duration::from_millis(value))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable or out-of-range values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparseable or out-of-range values.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let ice_servers = match vars.get("MESH_ICE_SERVERS") {
            Some(list) => {
                let servers: Vec<String> = list
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect();

                if servers.is_empty() {
                    return Err(ConfigError::InvalidValue(
                        "MESH_ICE_SERVERS must list at least one server".to_string(),
                    ));
                }
                servers
            }
            None => DEFAULT_ICE_SERVERS.iter().map(|s| (*s).to_string()).collect(),
        };

        let turn_username = vars
            .get("MESH_TURN_USERNAME")
            .filter(|s| !s.is_empty())
            .cloned();

        let turn_credential = vars
            .get("MESH_TURN_CREDENTIAL")
            .filter(|s| !s.is_empty())
            .map(|s| SecretString::from(s.clone()));

        if turn_credential.is_some() && turn_username.is_none() {
            return Err(ConfigError::InvalidValue(
                "MESH_TURN_CREDENTIAL requires MESH_TURN_USERNAME".to_string(),
            ));
        }

        let disconnect_grace =
            parse_duration_ms(vars, "MESH_DISCONNECT_GRACE_MS", DEFAULT_DISCONNECT_GRACE_MS)?;
        let negotiation_timeout = parse_duration_ms(
            vars,
            "MESH_NEGOTIATION_TIMEOUT_MS",
            DEFAULT_NEGOTIATION_TIMEOUT_MS,
        )?;
        let presence_degraded_grace = parse_duration_ms(
            vars,
            "MESH_PRESENCE_DEGRADED_GRACE_MS",
            DEFAULT_PRESENCE_DEGRADED_GRACE_MS,
        )?;
        let relay_send_timeout = parse_duration_ms(
            vars,
            "MESH_RELAY_SEND_TIMEOUT_MS",
            DEFAULT_RELAY_SEND_TIMEOUT_MS,
        )?;
        let transport_op_timeout = parse_duration_ms(
            vars,
            "MESH_TRANSPORT_OP_TIMEOUT_MS",
            DEFAULT_TRANSPORT_OP_TIMEOUT_MS,
        )?;
        let housekeeping_interval = parse_duration_ms(
            vars,
            "MESH_HOUSEKEEPING_INTERVAL_MS",
            DEFAULT_HOUSEKEEPING_INTERVAL_MS,
        )?;

        // Parse peer cap with validation
        let max_peers = if let Some(value_str) = vars.get("MESH_MAX_PEERS") {
            let value: usize = value_str.trim().parse().map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "MESH_MAX_PEERS must be a valid positive integer, got '{value_str}': {e}"
                ))
            })?;

            if value == 0 {
                return Err(ConfigError::InvalidValue(
                    "MESH_MAX_PEERS must be greater than 0".to_string(),
                ));
            }

            value
        } else {
            DEFAULT_MAX_PEERS
        };

        Ok(Config {
            ice_servers,
            turn_username,
            turn_credential,
            disconnect_grace,
            negotiation_timeout,
            presence_degraded_grace,
            relay_send_timeout,
            transport_op_timeout,
            housekeeping_interval,
            max_peers,
        })
    }
}
