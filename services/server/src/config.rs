//! Server configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/helios/server.toml`.
//!
//! # Validation
//! - `parse_mode` must be one of `strict`, `permissive`, `passthrough`
//! - `session_recovery.secret` is required and must be at least 32 bytes
//!   when recovery is enabled
//! - TTLs and intervals must be nonzero

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/helios/server.toml";

/// Minimum signing-key entropy for session tokens (256 bits).
pub const MIN_SECRET_BYTES: usize = 32;

// ---------------------------------------------------------------------------
// Resolved config types
// ---------------------------------------------------------------------------

/// How unparseable inbound frames are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    /// Parse failures propagate; the transport closes.
    Strict,
    /// Text that parses as JSON is routed as JSON, other text as text,
    /// binary as binary.
    Permissive,
    /// Like permissive, without the JSON attempt.
    Passthrough,
}

/// Top-level server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Default per-request deadline for server-initiated RPC.
    pub request_timeout: Duration,
    pub parse_mode: ParseMode,
    pub session_recovery: SessionRecoveryConfig,
    pub health_check: HealthConfig,
}

#[derive(Debug, Clone)]
pub struct SessionRecoveryConfig {
    pub enabled: bool,
    /// Token signing key; required when recovery is enabled.
    pub secret: Option<String>,
    /// How long a disconnected session stays recoverable.
    pub ttl: Duration,
    /// Cadence of the expired-session sweep.
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    pub max_missed: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_owned(),
            request_timeout: Duration::from_millis(5000),
            parse_mode: ParseMode::Strict,
            session_recovery: SessionRecoveryConfig::default(),
            health_check: HealthConfig::default(),
        }
    }
}

impl Default for SessionRecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            secret: None,
            ttl: Duration::from_millis(300_000),
            sweep_interval: Duration::from_millis(60_000),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_millis(30_000),
            timeout: Duration::from_millis(10_000),
            max_missed: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("config parse: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("unknown parse_mode '{0}' (expected strict, permissive or passthrough)")]
    UnknownParseMode(String),
    #[error("session_recovery.secret is required when recovery is enabled")]
    MissingSecret,
    #[error("session_recovery.secret must be at least {MIN_SECRET_BYTES} bytes, got {0}")]
    SecretTooShort(usize),
    #[error("{0} must be nonzero")]
    ZeroDuration(&'static str),
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bind: Option<String>,
    request_timeout_ms: Option<u64>,
    parse_mode: Option<String>,
    session_recovery: Option<RawSessionRecovery>,
    health_check: Option<RawHealthCheck>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSessionRecovery {
    enabled: Option<bool>,
    secret: Option<String>,
    ttl_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHealthCheck {
    enabled: Option<bool>,
    interval_ms: Option<u64>,
    timeout_ms: Option<u64>,
    max_missed: Option<u32>,
}

// ---------------------------------------------------------------------------
// Loading and resolution
// ---------------------------------------------------------------------------

impl ServerConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawConfig = toml::from_str(&text)?;
        resolve(raw)
    }

    /// Validate an already-constructed config (used by the server builder).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("request_timeout_ms"));
        }
        if self.session_recovery.enabled {
            let secret = self
                .session_recovery
                .secret
                .as_deref()
                .ok_or(ConfigError::MissingSecret)?;
            if secret.len() < MIN_SECRET_BYTES {
                return Err(ConfigError::SecretTooShort(secret.len()));
            }
            if self.session_recovery.ttl.is_zero() {
                return Err(ConfigError::ZeroDuration("session_recovery.ttl_ms"));
            }
            if self.session_recovery.sweep_interval.is_zero() {
                return Err(ConfigError::ZeroDuration(
                    "session_recovery.sweep_interval_ms",
                ));
            }
        }
        if self.health_check.enabled {
            if self.health_check.interval.is_zero() {
                return Err(ConfigError::ZeroDuration("health_check.interval_ms"));
            }
            if self.health_check.timeout.is_zero() {
                return Err(ConfigError::ZeroDuration("health_check.timeout_ms"));
            }
        }
        Ok(())
    }
}

fn parse_mode(raw: &str) -> Result<ParseMode, ConfigError> {
    match raw {
        "strict" => Ok(ParseMode::Strict),
        "permissive" => Ok(ParseMode::Permissive),
        "passthrough" => Ok(ParseMode::Passthrough),
        other => Err(ConfigError::UnknownParseMode(other.to_owned())),
    }
}

fn resolve(raw: RawConfig) -> Result<ServerConfig, ConfigError> {
    let defaults = ServerConfig::default();
    let recovery_raw = raw.session_recovery.unwrap_or_default();
    let health_raw = raw.health_check.unwrap_or_default();

    let config = ServerConfig {
        bind: raw.bind.unwrap_or(defaults.bind),
        request_timeout: raw
            .request_timeout_ms
            .map_or(defaults.request_timeout, Duration::from_millis),
        parse_mode: match raw.parse_mode.as_deref() {
            Some(mode) => parse_mode(mode)?,
            None => defaults.parse_mode,
        },
        session_recovery: SessionRecoveryConfig {
            enabled: recovery_raw.enabled.unwrap_or(false),
            secret: recovery_raw.secret,
            ttl: recovery_raw
                .ttl_ms
                .map_or(defaults.session_recovery.ttl, Duration::from_millis),
            sweep_interval: recovery_raw.sweep_interval_ms.map_or(
                defaults.session_recovery.sweep_interval,
                Duration::from_millis,
            ),
        },
        health_check: HealthConfig {
            enabled: health_raw.enabled.unwrap_or(true),
            interval: health_raw
                .interval_ms
                .map_or(defaults.health_check.interval, Duration::from_millis),
            timeout: health_raw
                .timeout_ms
                .map_or(defaults.health_check.timeout, Duration::from_millis),
            max_missed: health_raw
                .max_missed
                .unwrap_or(defaults.health_check.max_missed),
        },
    };
    config.validate()?;
    Ok(config)
}
