//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: `SPACE_AUTH_`, nesting separator `__`)
//! 2. A TOML file, `./config.toml` unless a path is given
//! 3. Default values
//!
//! For example `SPACE_AUTH_TOKEN__SYMMETRIC_KEY` sets `token.symmetric_key`
//! and `SPACE_AUTH_LOCKOUT__MAX_ATTEMPTS` sets `lockout.max_attempts`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::attempts::AttemptConfig;
use crate::error::{Error, Result};
use crate::lockout::LockoutConfig;
use crate::maintenance::MaintenanceConfig;
use crate::password::PasswordConfig;
use crate::token::MIN_SYMMETRIC_KEY_LEN;

const ENV_PREFIX: &str = "SPACE_AUTH_";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

/// Upper bound for every `*_secs` setting (ten years)
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Reject zero and anything above [`MAX_DURATION_SECS`]
pub(crate) fn check_duration_secs(field: &str, secs: u64) -> std::result::Result<(), String> {
    if secs == 0 {
        return Err(format!("{} must be greater than 0", field));
    }
    if secs > MAX_DURATION_SECS {
        return Err(format!("{} must be at most {}", field, MAX_DURATION_SECS));
    }
    Ok(())
}

/// `secs` as a chrono duration, saturating at [`MAX_DURATION_SECS`]
pub(crate) fn bounded_seconds(secs: u64) -> chrono::Duration {
    // Fits in i64 after the clamp
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Database configuration (optional)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Token issuance
    #[serde(default)]
    pub token: TokenConfig,

    /// Account lockout thresholds
    #[serde(default)]
    pub lockout: LockoutConfig,

    /// Login attempt window, retention and rate limits
    #[serde(default)]
    pub attempts: AttemptConfig,

    /// Background sweep and cleanup
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Password hashing
    #[serde(default)]
    pub password: PasswordConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Log level or `EnvFilter` directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Environment (dev, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`
    ///
    /// Only enable behind a proxy that overwrites these headers. Otherwise
    /// any client can pick the address its failures are counted under.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum idle connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing database connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

/// Token issuance configuration
///
/// # Example (config.toml)
///
/// ```toml
/// [token]
/// symmetric_key = "0123456789abcdef0123456789abcdef"
/// access_token_duration_secs = 900
/// refresh_token_duration_secs = 86400
/// rotate_refresh_tokens = false
/// ```
#[derive(Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Shared secret the PASETO key is derived from (at least 32 characters)
    #[serde(default)]
    pub symmetric_key: String,

    /// Access token lifetime in seconds
    #[serde(default = "default_access_token_duration")]
    pub access_token_duration_secs: u64,

    /// Refresh token and session lifetime in seconds
    #[serde(default = "default_refresh_token_duration")]
    pub refresh_token_duration_secs: u64,

    /// Issue a new refresh token on every refresh and block the old session
    #[serde(default)]
    pub rotate_refresh_tokens: bool,
}

impl std::fmt::Debug for TokenConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenConfig")
            .field("symmetric_key", &"[REDACTED]")
            .field("access_token_duration_secs", &self.access_token_duration_secs)
            .field("refresh_token_duration_secs", &self.refresh_token_duration_secs)
            .field("rotate_refresh_tokens", &self.rotate_refresh_tokens)
            .finish()
    }
}

impl TokenConfig {
    /// Access token lifetime
    pub fn access_token_duration(&self) -> chrono::Duration {
        bounded_seconds(self.access_token_duration_secs)
    }

    /// Refresh token lifetime
    pub fn refresh_token_duration(&self) -> chrono::Duration {
        bounded_seconds(self.refresh_token_duration_secs)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.symmetric_key.len() < MIN_SYMMETRIC_KEY_LEN {
            return Err(format!(
                "token.symmetric_key must be at least {} characters",
                MIN_SYMMETRIC_KEY_LEN
            ));
        }
        check_duration_secs("token.access_token_duration_secs", self.access_token_duration_secs)?;
        check_duration_secs("token.refresh_token_duration_secs", self.refresh_token_duration_secs)
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            symmetric_key: String::new(),
            access_token_duration_secs: default_access_token_duration(),
            refresh_token_duration_secs: default_refresh_token_duration(),
            rotate_refresh_tokens: false,
        }
    }
}

// Default value functions
fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_environment() -> String {
    "dev".to_string()
}

fn default_max_connections() -> u32 {
    50
}

fn default_min_connections() -> u32 {
    5
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_access_token_duration() -> u64 {
    900
}

fn default_refresh_token_duration() -> u64 {
    86400
}

impl Config {
    /// Load configuration from `./config.toml` and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file
    ///
    /// The file is optional; a missing file leaves the defaults in place.
    /// Environment variables override both. The result is validated.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
        }

        let config: Config = Figment::new()
            // Start with defaults
            .merge(Serialized::defaults(Config::default()))
            // Load from config file (if exists)
            .merge(Toml::file(path))
            // Override with environment variables
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the components cannot run with
    pub fn validate(&self) -> Result<()> {
        let checks = [
            self.token.validate(),
            self.lockout.validate(),
            self.attempts.validate(),
            self.maintenance.validate(),
        ];

        for check in checks {
            check.map_err(|msg| Error::Config(Box::new(figment::Error::from(msg))))?;
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.service.timeout_secs)
    }

    /// Get the database URL if configured
    pub fn database_url(&self) -> Option<&str> {
        self.database.as_ref().map(|db| db.url.as_str())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "space-auth".to_string(),
                port: default_port(),
                log_level: default_log_level(),
                timeout_secs: default_timeout(),
                environment: default_environment(),
                trust_forwarded_headers: false,
            },
            database: None,
            token: TokenConfig::default(),
            lockout: LockoutConfig::default(),
            attempts: AttemptConfig::default(),
            maintenance: MaintenanceConfig::default(),
            password: PasswordConfig::default(),
        }
    }
}

#[cfg(test)]
pub(crate) const TEST_SYMMETRIC_KEY: &str = "test-symmetric-key-0123456789abcdef";
