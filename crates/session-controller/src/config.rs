//! Session Controller configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::follower::DEFAULT_DRIFT_TOLERANCE_MS;
use base64::{engine::general_purpose::STANDARD, Engine};
use common::secret::{ExposeSecret, SecretBox, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default session protocol bind address.
pub const DEFAULT_SYNC_BIND_ADDRESS: &str = "0.0.0.0:7420";

/// Default admin API / health / metrics bind address (loopback only).
pub const DEFAULT_ADMIN_BIND_ADDRESS: &str = "127.0.0.1:8081";

/// Default address hint embedded in join descriptors.
pub const DEFAULT_ADVERTISE_HOST: &str = "127.0.0.1";

/// Default advertised host name.
pub const DEFAULT_HOST_DISPLAY_NAME: &str = "FlowSync Host";

/// Default UDP port for session announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 7421;

/// Default announcement interval in milliseconds.
pub const DEFAULT_DISCOVERY_INTERVAL_MS: u64 = 5000;

/// Default caller-side expiry for discovered sessions in seconds.
pub const DEFAULT_DISCOVERY_EXPIRY_SECONDS: u64 = 15;

/// Default reconciliation window in milliseconds.
pub const DEFAULT_RECONCILIATION_WINDOW_MS: u64 = 150;

/// Default heartbeat timeout in seconds.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECONDS: u64 = 15;

/// Default host migration grace period in seconds.
pub const DEFAULT_MIGRATION_GRACE_SECONDS: u64 = 10;

/// Default clock probe interval in milliseconds.
pub const DEFAULT_CLOCK_PROBE_INTERVAL_MS: u64 = 5000;

/// Default number of clock samples retained per connection.
pub const DEFAULT_CLOCK_SAMPLE_WINDOW: usize = 8;

/// Default session token TTL in seconds.
pub const DEFAULT_TOKEN_TTL_SECONDS: u64 = 3600;

/// Default join descriptor TTL in seconds.
pub const DEFAULT_DESCRIPTOR_TTL_SECONDS: u64 = 300;

/// Default pairing PIN TTL in seconds.
pub const DEFAULT_PIN_TTL_SECONDS: u64 = 300;

/// Default participant limit per session.
pub const DEFAULT_MAX_PARTICIPANTS: usize = 50;

/// Default session limit per process.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// Minimum master secret length in bytes.
pub const MIN_MASTER_SECRET_LENGTH: usize = 32;

/// Session Controller configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Master secret for session key derivation (base64-encoded, >= 32 bytes decoded).
    pub master_secret: SecretString,

    /// Session protocol listener (default: "0.0.0.0:7420").
    pub sync_bind_address: String,

    /// Admin API, health and metrics listener (default: "127.0.0.1:8081").
    pub admin_bind_address: String,

    /// Host part of the address hints placed in join descriptors.
    pub advertise_host: String,

    /// Name announced for sessions created without one.
    pub host_display_name: String,

    /// Whether sessions are announced on the local network.
    pub discovery_enabled: bool,

    /// UDP port for announcements.
    pub discovery_port: u16,

    /// Announcement interval in milliseconds.
    pub discovery_interval_ms: u64,

    /// Seconds after which an unseen announcement is dropped by resolvers.
    pub discovery_expiry_seconds: u64,

    /// Reconciliation window in milliseconds.
    pub reconciliation_window_ms: u64,

    /// Whether host commands skip the reconciliation window.
    pub host_bypass_window: bool,

    /// Seconds without a heartbeat before a participant is considered gone.
    pub heartbeat_timeout_seconds: u64,

    /// Seconds to find a new host before the session closes.
    pub migration_grace_seconds: u64,

    /// Clock probe interval told to participants, in milliseconds.
    pub clock_probe_interval_ms: u64,

    /// Clock samples retained per connection.
    pub clock_sample_window: usize,

    /// Session token TTL in seconds.
    pub token_ttl_seconds: u64,

    /// Join descriptor TTL in seconds.
    pub descriptor_ttl_seconds: u64,

    /// Pairing PIN TTL in seconds.
    pub pin_ttl_seconds: u64,

    /// Participant limit per session.
    pub max_participants: usize,

    /// Session limit per process.
    pub max_sessions: usize,

    /// Drift an embedded engine may show before it is repositioned, in milliseconds.
    pub drift_tolerance_ms: u64,

    /// Whether new sessions are announced on the local network unless the
    /// creator says otherwise.
    pub sessions_public: bool,

    /// Whether chat is relayed in new sessions unless the creator says otherwise.
    pub chat_enabled: bool,

    /// Whether followers may append to the play queue.
    pub collaborative_queue: bool,

    /// Whether followers may vote to skip.
    pub voting_enabled: bool,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("master_secret", &"[REDACTED]")
            .field("sync_bind_address", &self.sync_bind_address)
            .field("admin_bind_address", &self.admin_bind_address)
            .field("advertise_host", &self.advertise_host)
            .field("host_display_name", &self.host_display_name)
            .field("discovery_enabled", &self.discovery_enabled)
            .field("discovery_port", &self.discovery_port)
            .field("discovery_interval_ms", &self.discovery_interval_ms)
            .field("discovery_expiry_seconds", &self.discovery_expiry_seconds)
            .field("reconciliation_window_ms", &self.reconciliation_window_ms)
            .field("host_bypass_window", &self.host_bypass_window)
            .field("heartbeat_timeout_seconds", &self.heartbeat_timeout_seconds)
            .field("migration_grace_seconds", &self.migration_grace_seconds)
            .field("clock_probe_interval_ms", &self.clock_probe_interval_ms)
            .field("clock_sample_window", &self.clock_sample_window)
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .field("descriptor_ttl_seconds", &self.descriptor_ttl_seconds)
            .field("pin_ttl_seconds", &self.pin_ttl_seconds)
            .field("max_participants", &self.max_participants)
            .field("max_sessions", &self.max_sessions)
            .field("drift_tolerance_ms", &self.drift_tolerance_ms)
            .field("sessions_public", &self.sessions_public)
            .field("chat_enabled", &self.chat_enabled)
            .field("collaborative_queue", &self.collaborative_queue)
            .field("voting_enabled", &self.voting_enabled)
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
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value is invalid.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let master_secret = SecretString::from(
            vars.get("SC_MASTER_SECRET")
                .ok_or_else(|| ConfigError::MissingEnvVar("SC_MASTER_SECRET".to_string()))?
                .clone(),
        );
        // Fail at load, not at first session
        decode_master_secret(&master_secret)?;

        let sync_bind_address = vars
            .get("SC_SYNC_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SYNC_BIND_ADDRESS.to_string());

        let admin_bind_address = vars
            .get("SC_ADMIN_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ADMIN_BIND_ADDRESS.to_string());

        let advertise_host = vars
            .get("SC_ADVERTISE_HOST")
            .cloned()
            .unwrap_or_else(|| DEFAULT_ADVERTISE_HOST.to_string());

        let host_display_name = vars
            .get("SC_HOST_DISPLAY_NAME")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HOST_DISPLAY_NAME.to_string());

        let discovery_enabled = parse_var(vars, "SC_DISCOVERY_ENABLED", true)?;
        let discovery_port = parse_var(vars, "SC_DISCOVERY_PORT", DEFAULT_DISCOVERY_PORT)?;
        let discovery_interval_ms =
            parse_var(vars, "SC_DISCOVERY_INTERVAL_MS", DEFAULT_DISCOVERY_INTERVAL_MS)?;
        let discovery_expiry_seconds = parse_var(
            vars,
            "SC_DISCOVERY_EXPIRY_SECONDS",
            DEFAULT_DISCOVERY_EXPIRY_SECONDS,
        )?;

        let reconciliation_window_ms = parse_var(
            vars,
            "SC_RECONCILIATION_WINDOW_MS",
            DEFAULT_RECONCILIATION_WINDOW_MS,
        )?;
        let host_bypass_window = parse_var(vars, "SC_HOST_BYPASS_WINDOW", true)?;
        let heartbeat_timeout_seconds = parse_var(
            vars,
            "SC_HEARTBEAT_TIMEOUT_SECONDS",
            DEFAULT_HEARTBEAT_TIMEOUT_SECONDS,
        )?;
        let migration_grace_seconds = parse_var(
            vars,
            "SC_MIGRATION_GRACE_SECONDS",
            DEFAULT_MIGRATION_GRACE_SECONDS,
        )?;
        let clock_probe_interval_ms = parse_var(
            vars,
            "SC_CLOCK_PROBE_INTERVAL_MS",
            DEFAULT_CLOCK_PROBE_INTERVAL_MS,
        )?;
        let clock_sample_window =
            parse_var(vars, "SC_CLOCK_SAMPLE_WINDOW", DEFAULT_CLOCK_SAMPLE_WINDOW)?;
        if clock_sample_window < 2 {
            return Err(ConfigError::InvalidValue(
                "SC_CLOCK_SAMPLE_WINDOW must be at least 2".to_string(),
            ));
        }

        let token_ttl_seconds = parse_var(vars, "SC_TOKEN_TTL_SECONDS", DEFAULT_TOKEN_TTL_SECONDS)?;
        let descriptor_ttl_seconds = parse_var(
            vars,
            "SC_DESCRIPTOR_TTL_SECONDS",
            DEFAULT_DESCRIPTOR_TTL_SECONDS,
        )?;
        let pin_ttl_seconds = parse_var(vars, "SC_PIN_TTL_SECONDS", DEFAULT_PIN_TTL_SECONDS)?;

        let max_participants = parse_var(vars, "SC_MAX_PARTICIPANTS", DEFAULT_MAX_PARTICIPANTS)?;
        let max_sessions = parse_var(vars, "SC_MAX_SESSIONS", DEFAULT_MAX_SESSIONS)?;
        if max_participants == 0 || max_sessions == 0 {
            return Err(ConfigError::InvalidValue(
                "SC_MAX_PARTICIPANTS and SC_MAX_SESSIONS must be positive".to_string(),
            ));
        }

        let drift_tolerance_ms =
            parse_var(vars, "SC_DRIFT_TOLERANCE_MS", DEFAULT_DRIFT_TOLERANCE_MS)?;
        let sessions_public = parse_var(vars, "SC_SESSIONS_PUBLIC", true)?;
        let chat_enabled = parse_var(vars, "SC_CHAT_ENABLED", true)?;
        let collaborative_queue = parse_var(vars, "SC_COLLABORATIVE_QUEUE", true)?;
        let voting_enabled = parse_var(vars, "SC_VOTING_ENABLED", true)?;

        Ok(Config {
            master_secret,
            sync_bind_address,
            admin_bind_address,
            advertise_host,
            host_display_name,
            discovery_enabled,
            discovery_port,
            discovery_interval_ms,
            discovery_expiry_seconds,
            reconciliation_window_ms,
            host_bypass_window,
            heartbeat_timeout_seconds,
            migration_grace_seconds,
            clock_probe_interval_ms,
            clock_sample_window,
            token_ttl_seconds,
            descriptor_ttl_seconds,
            pin_ttl_seconds,
            max_participants,
            max_sessions,
            drift_tolerance_ms,
            sessions_public,
            chat_enabled,
            collaborative_queue,
            voting_enabled,
        })
    }

    /// Decoded master secret bytes.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the secret is not base64 or too short.
    pub fn master_secret_bytes(&self) -> Result<SecretBox<Vec<u8>>, ConfigError> {
        decode_master_secret(&self.master_secret)
    }

    /// Per-session policy derived from this configuration.
    #[must_use]
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            reconciliation_window: Duration::from_millis(self.reconciliation_window_ms),
            host_bypass_window: self.host_bypass_window,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_seconds),
            migration_grace: Duration::from_secs(self.migration_grace_seconds),
            clock_probe_interval: Duration::from_millis(self.clock_probe_interval_ms),
            clock_sample_window: self.clock_sample_window,
            token_ttl: Duration::from_secs(self.token_ttl_seconds),
            pin_ttl: Duration::from_secs(self.pin_ttl_seconds),
            max_participants: self.max_participants,
            collaborative_queue: self.collaborative_queue,
            voting_enabled: self.voting_enabled,
            chat_enabled: self.chat_enabled,
            public: self.sessions_public,
            drift_tolerance_ms: self.drift_tolerance_ms,
        }
    }
}

/// Tunables handed to each session actor.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub reconciliation_window: Duration,
    pub host_bypass_window: bool,
    pub heartbeat_timeout: Duration,
    pub migration_grace: Duration,
    pub clock_probe_interval: Duration,
    pub clock_sample_window: usize,
    pub token_ttl: Duration,
    pub pin_ttl: Duration,
    pub max_participants: usize,
    /// Followers may append to the play queue.
    pub collaborative_queue: bool,
    /// Followers may vote to skip.
    pub voting_enabled: bool,
    /// Chat messages are relayed.
    pub chat_enabled: bool,
    /// The session is announced on the local network once active.
    pub public: bool,
    /// Drift the embedded engine may show before it is repositioned.
    pub drift_tolerance_ms: u64,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            reconciliation_window: Duration::from_millis(DEFAULT_RECONCILIATION_WINDOW_MS),
            host_bypass_window: true,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECONDS),
            migration_grace: Duration::from_secs(DEFAULT_MIGRATION_GRACE_SECONDS),
            clock_probe_interval: Duration::from_millis(DEFAULT_CLOCK_PROBE_INTERVAL_MS),
            clock_sample_window: DEFAULT_CLOCK_SAMPLE_WINDOW,
            token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECONDS),
            pin_ttl: Duration::from_secs(DEFAULT_PIN_TTL_SECONDS),
            max_participants: DEFAULT_MAX_PARTICIPANTS,
            collaborative_queue: true,
            voting_enabled: true,
            chat_enabled: true,
            public: true,
            drift_tolerance_ms: DEFAULT_DRIFT_TOLERANCE_MS,
        }
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key} has an invalid value"))),
        None => Ok(default),
    }
}

fn decode_master_secret(secret: &SecretString) -> Result<SecretBox<Vec<u8>>, ConfigError> {
    let bytes = STANDARD
        .decode(secret.expose_secret().trim())
        .map_err(|_| ConfigError::InvalidValue("SC_MASTER_SECRET is not valid base64".to_string()))?;

    if bytes.len() < MIN_MASTER_SECRET_LENGTH {
        return Err(ConfigError::InvalidValue(format!(
            "SC_MASTER_SECRET must decode to at least {MIN_MASTER_SECRET_LENGTH} bytes, got {}",
            bytes.len()
        )));
    }

    Ok(SecretBox::new(Box::new(bytes)))
}
