//! Account lockout configuration

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::config::{bounded_seconds, check_duration_secs};

/// Account lockout configuration
///
/// # Example (config.toml)
///
/// ```toml
/// [lockout]
/// max_attempts = 5
/// lockout_duration_secs = 1800
/// warning_threshold = 3
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockoutConfig {
    /// Consecutive failed logins that lock the account
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Duration in seconds that an account remains locked
    #[serde(default = "default_lockout_duration_secs")]
    pub lockout_duration_secs: u64,

    /// Number of failures at which a warning notification is sent (0 = disabled)
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,
}

impl LockoutConfig {
    /// Validate the configuration, returning an error message if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("lockout.max_attempts must be greater than 0".to_string());
        }
        check_duration_secs("lockout.lockout_duration_secs", self.lockout_duration_secs)?;
        if self.warning_threshold > 0 && self.warning_threshold >= self.max_attempts {
            return Err("lockout.warning_threshold must be below max_attempts".to_string());
        }
        Ok(())
    }

    /// Lock duration
    pub fn lockout_duration(&self) -> Duration {
        bounded_seconds(self.lockout_duration_secs)
    }
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            lockout_duration_secs: default_lockout_duration_secs(),
            warning_threshold: default_warning_threshold(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_lockout_duration_secs() -> u64 {
    1800 // 30 minutes
}

fn default_warning_threshold() -> u32 {
    3
}
