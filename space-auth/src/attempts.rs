//! Login attempt tracking
//!
//! Every login that reaches the credential check is appended to the
//! attempt log. Recent failures are counted over a sliding window, once by
//! username and once by origin address, so rotating either one alone does
//! not escape the limit.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{bounded_seconds, check_duration_secs};
use crate::error::{Error, Result};
use crate::store::LoginAttemptStorage;

/// Attempt tracking configuration
///
/// # Example (config.toml)
///
/// ```toml
/// [attempts]
/// window_secs = 900
/// retention_secs = 2592000
/// max_failures_per_username = 10
/// max_failures_per_ip = 20
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptConfig {
    /// Sliding window in seconds over which failures are counted
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Attempts older than this many seconds are purged
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Failures per username inside the window before logins are refused (0 = off)
    #[serde(default = "default_max_failures_per_username")]
    pub max_failures_per_username: u32,

    /// Failures per origin address inside the window before logins are refused (0 = off)
    #[serde(default = "default_max_failures_per_ip")]
    pub max_failures_per_ip: u32,
}

impl AttemptConfig {
    /// Validate the configuration, returning an error message if invalid
    pub fn validate(&self) -> std::result::Result<(), String> {
        check_duration_secs("attempts.window_secs", self.window_secs)?;
        check_duration_secs("attempts.retention_secs", self.retention_secs)?;
        if self.retention_secs < self.window_secs {
            return Err("attempts.retention_secs must not be shorter than window_secs".to_string());
        }
        Ok(())
    }

    /// Counting window
    pub fn window(&self) -> Duration {
        bounded_seconds(self.window_secs)
    }

    /// Retention period
    pub fn retention(&self) -> Duration {
        bounded_seconds(self.retention_secs)
    }
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            retention_secs: default_retention_secs(),
            max_failures_per_username: default_max_failures_per_username(),
            max_failures_per_ip: default_max_failures_per_ip(),
        }
    }
}

fn default_window_secs() -> u64 {
    900 // 15 minutes
}

fn default_retention_secs() -> u64 {
    2_592_000 // 30 days
}

fn default_max_failures_per_username() -> u32 {
    10
}

fn default_max_failures_per_ip() -> u32 {
    20
}

/// A recorded login attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoginAttempt {
    /// Attempt id
    pub id: Uuid,
    /// Identifier as submitted, after normalization
    pub username: String,
    /// Origin address
    pub ip_address: IpAddr,
    /// Client user agent
    pub user_agent: Option<String>,
    /// Whether the credentials were accepted
    pub success: bool,
    /// When the attempt happened
    pub attempted_at: DateTime<Utc>,
}

/// Input for recording an attempt
#[derive(Debug, Clone)]
pub struct NewLoginAttempt {
    /// Identifier as submitted, after normalization
    pub username: String,
    /// Origin address
    pub ip_address: IpAddr,
    /// Client user agent
    pub user_agent: Option<String>,
    /// Whether the credentials were accepted
    pub success: bool,
    /// When the attempt happened
    pub attempted_at: DateTime<Utc>,
}

impl NewLoginAttempt {
    /// Assign an id, producing the stored row
    pub fn into_attempt(self) -> LoginAttempt {
        LoginAttempt {
            id: Uuid::new_v4(),
            username: self.username,
            ip_address: self.ip_address,
            user_agent: self.user_agent,
            success: self.success,
            attempted_at: self.attempted_at,
        }
    }
}

/// Dimension along which attempts are counted
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttemptKey {
    /// By submitted username
    Username(String),
    /// By origin address
    Ip(IpAddr),
}

impl AttemptKey {
    /// Whether `attempt` falls under this key
    pub fn matches(&self, attempt: &LoginAttempt) -> bool {
        match self {
            AttemptKey::Username(name) => attempt.username == *name,
            AttemptKey::Ip(ip) => attempt.ip_address == *ip,
        }
    }
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptKey::Username(name) => write!(f, "username:{}", name),
            AttemptKey::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

/// Records attempts and answers windowed failure counts
#[derive(Clone)]
pub struct LoginAttemptTracker {
    storage: Arc<dyn LoginAttemptStorage>,
    clock: Arc<dyn Clock>,
    config: AttemptConfig,
}

impl LoginAttemptTracker {
    /// Create a tracker
    pub fn new(
        storage: Arc<dyn LoginAttemptStorage>,
        clock: Arc<dyn Clock>,
        config: AttemptConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            config,
        }
    }

    /// Tracker configuration
    pub fn config(&self) -> &AttemptConfig {
        &self.config
    }

    /// Append an attempt to the log
    ///
    /// Best effort: a storage failure is logged and swallowed so that a
    /// broken attempt log never blocks a legitimate login. The lockout
    /// counter is maintained separately and does not depend on this row.
    pub async fn record_attempt(
        &self,
        username: &str,
        ip_address: IpAddr,
        user_agent: Option<&str>,
        success: bool,
    ) {
        let attempt = NewLoginAttempt {
            username: username.to_string(),
            ip_address,
            user_agent: user_agent.map(str::to_string),
            success,
            attempted_at: self.clock.now(),
        };

        if let Err(e) = self.storage.create_login_attempt(attempt).await {
            warn!(
                username = username,
                ip = %ip_address,
                success = success,
                error = %e,
                "Failed to record login attempt"
            );
        }
    }

    /// Failed attempts for `key` inside `[now - window, now]`
    pub async fn count_recent_failures(&self, key: &AttemptKey, window: Duration) -> Result<u64> {
        let now = self.clock.now();
        self.storage
            .count_recent_failed_login_attempts(key, now - window, now)
            .await
    }

    /// Refuse the login when either the username or the address is over its limit
    pub async fn check_rate_limit(&self, username: &str, ip_address: IpAddr) -> Result<()> {
        let window = self.config.window();
        let checks = [
            (
                AttemptKey::Username(username.to_string()),
                self.config.max_failures_per_username,
            ),
            (AttemptKey::Ip(ip_address), self.config.max_failures_per_ip),
        ];

        for (key, limit) in checks {
            if limit == 0 {
                continue;
            }
            let failures = self.count_recent_failures(&key, window).await?;
            if failures >= u64::from(limit) {
                debug!(key = %key, failures, limit, "Login attempt rate limit exceeded");
                return Err(Error::TooManyAttempts {
                    retry_after_secs: self.config.window_secs,
                });
            }
        }

        Ok(())
    }

    /// Attempts for `key` inside the configured window, newest first
    pub async fn recent_attempts(&self, key: &AttemptKey, limit: usize) -> Result<Vec<LoginAttempt>> {
        let since = self.clock.now() - self.config.window();
        self.storage.recent_login_attempts(key, since, limit).await
    }

    /// Delete attempts older than `retention`; returns rows deleted
    pub async fn cleanup(&self, retention: Duration) -> Result<u64> {
        let cutoff = self.clock.now() - retention;
        let deleted = self.storage.cleanup_old_login_attempts(cutoff).await?;
        if deleted > 0 {
            debug!(deleted, cutoff = %cutoff, "Purged old login attempts");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn tracker(config: AttemptConfig) -> (LoginAttemptTracker, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(MemoryStore::new());
        let tracker = LoginAttemptTracker::new(store.clone(), Arc::new(clock.clone()), config);
        (tracker, store, clock)
    }

    #[test]
    fn test_validate_defaults() {
        assert!(AttemptConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_window() {
        let config = AttemptConfig {
            window_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_window_upper_bound() {
        let config = AttemptConfig {
            window_secs: u64::MAX,
            retention_secs: u64::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_retention_shorter_than_window() {
        let config = AttemptConfig {
            window_secs: 600,
            retention_secs: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_counts_failures_per_dimension() {
        let (tracker, _, _) = tracker(AttemptConfig::default());
        let window = Duration::minutes(15);

        tracker.record_attempt("ada@example.com", ip(1), None, false).await;
        tracker.record_attempt("ada@example.com", ip(2), None, false).await;
        tracker.record_attempt("bob@example.com", ip(1), None, false).await;
        tracker.record_attempt("ada@example.com", ip(1), None, true).await;

        let by_user = tracker
            .count_recent_failures(&AttemptKey::Username("ada@example.com".into()), window)
            .await
            .expect("count");
        let by_ip = tracker
            .count_recent_failures(&AttemptKey::Ip(ip(1)), window)
            .await
            .expect("count");

        assert_eq!(by_user, 2);
        assert_eq!(by_ip, 2);
    }

    #[tokio::test]
    async fn test_window_slides() {
        let (tracker, _, clock) = tracker(AttemptConfig::default());
        let key = AttemptKey::Username("ada@example.com".into());
        let window = Duration::minutes(10);

        tracker.record_attempt("ada@example.com", ip(1), None, false).await;
        clock.advance(Duration::minutes(6));
        tracker.record_attempt("ada@example.com", ip(1), None, false).await;

        assert_eq!(tracker.count_recent_failures(&key, window).await.expect("count"), 2);

        // Window edge is inclusive
        clock.advance(Duration::minutes(4));
        assert_eq!(tracker.count_recent_failures(&key, window).await.expect("count"), 2);

        clock.advance(Duration::seconds(1));
        assert_eq!(tracker.count_recent_failures(&key, window).await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_by_ip_across_usernames() {
        let config = AttemptConfig {
            max_failures_per_username: 0,
            max_failures_per_ip: 3,
            ..Default::default()
        };
        let (tracker, _, _) = tracker(config);

        for name in ["a@x.io", "b@x.io", "c@x.io"] {
            assert!(tracker.check_rate_limit(name, ip(9)).await.is_ok());
            tracker.record_attempt(name, ip(9), None, false).await;
        }

        let result = tracker.check_rate_limit("d@x.io", ip(9)).await;
        assert!(matches!(result, Err(Error::TooManyAttempts { retry_after_secs: 900 })));

        // A different address is unaffected
        assert!(tracker.check_rate_limit("d@x.io", ip(10)).await.is_ok());
    }

    #[tokio::test]
    async fn test_rate_limit_by_username_across_ips() {
        let config = AttemptConfig {
            max_failures_per_username: 2,
            max_failures_per_ip: 0,
            ..Default::default()
        };
        let (tracker, _, _) = tracker(config);

        tracker.record_attempt("ada@example.com", ip(1), None, false).await;
        tracker.record_attempt("ada@example.com", ip(2), None, false).await;

        let result = tracker.check_rate_limit("ada@example.com", ip(3)).await;
        assert!(matches!(result, Err(Error::TooManyAttempts { .. })));
    }

    #[tokio::test]
    async fn test_recent_attempts_newest_first() {
        let (tracker, _, clock) = tracker(AttemptConfig::default());

        tracker.record_attempt("ada@example.com", ip(1), Some("curl/8"), false).await;
        clock.advance(Duration::seconds(5));
        tracker.record_attempt("ada@example.com", ip(1), Some("curl/8"), true).await;

        let attempts = tracker
            .recent_attempts(&AttemptKey::Username("ada@example.com".into()), 10)
            .await
            .expect("list");
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].success);
        assert!(!attempts[1].success);
        assert_eq!(attempts[0].user_agent.as_deref(), Some("curl/8"));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let (tracker, store, clock) = tracker(AttemptConfig::default());

        tracker.record_attempt("old@example.com", ip(1), None, false).await;
        tracker.record_attempt("old@example.com", ip(1), None, true).await;
        clock.advance(Duration::days(31));
        tracker.record_attempt("new@example.com", ip(2), None, false).await;

        let retention = Duration::days(30);
        assert_eq!(tracker.cleanup(retention).await.expect("cleanup"), 2);
        assert_eq!(store.attempt_count(), 1);

        assert_eq!(tracker.cleanup(retention).await.expect("cleanup"), 0);
        assert_eq!(store.attempt_count(), 1);
    }
}
