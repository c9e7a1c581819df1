//! Periodic maintenance
//!
//! Clears lapsed account locks and purges login attempts past retention,
//! on an interval and independent of request traffic. Both statements are
//! idempotent time predicates, so several instances may run this loop
//! against one database.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::attempts::LoginAttemptTracker;
use crate::config::check_duration_secs;
use crate::error::Result;
use crate::lockout::AccountLockManager;

/// Maintenance configuration
///
/// # Example (config.toml)
///
/// ```toml
/// [maintenance]
/// enabled = true
/// interval_secs = 300
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    /// Run the background loop
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between passes
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl MaintenanceConfig {
    /// Validate the configuration, returning an error message if invalid
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        check_duration_secs("maintenance.interval_secs", self.interval_secs)
    }

    /// Interval between passes
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    300
}

/// What one pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Accounts whose lapsed lock was cleared
    pub unlocked_accounts: u64,
    /// Login attempts deleted past retention
    pub purged_attempts: u64,
}

/// Sweep and cleanup runner
#[derive(Clone)]
pub struct Maintenance {
    locks: AccountLockManager,
    tracker: LoginAttemptTracker,
}

impl Maintenance {
    /// Create a runner over the lock manager and attempt tracker
    pub fn new(locks: AccountLockManager, tracker: LoginAttemptTracker) -> Self {
        Self { locks, tracker }
    }

    /// Run one pass
    ///
    /// Both steps are attempted; the first error is returned after the
    /// second step has run.
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        let unlocked = self.locks.sweep().await;
        let retention = self.tracker.config().retention();
        let purged = self.tracker.cleanup(retention).await;

        Ok(MaintenanceReport {
            unlocked_accounts: unlocked?,
            purged_attempts: purged?,
        })
    }

    /// Run passes every `interval` until `cancel` fires
    ///
    /// The first pass runs immediately. A failed pass is logged and the
    /// loop continues.
    pub fn spawn(self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_secs = interval.as_secs(), "Maintenance task started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(report) => debug!(
                                unlocked_accounts = report.unlocked_accounts,
                                purged_attempts = report.purged_attempts,
                                "Maintenance pass complete"
                            ),
                            Err(e) => error!(error = %e, "Maintenance pass failed"),
                        }
                    }
                }
            }

            info!("Maintenance task stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempts::AttemptConfig;
    use crate::clock::{Clock, ManualClock};
    use crate::lockout::LockoutConfig;
    use crate::store::{LoginAttemptStorage, MemoryStore, UserStorage};
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn setup() -> (Maintenance, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(MemoryStore::new());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let locks = AccountLockManager::new(store.clone(), shared.clone(), LockoutConfig::default());
        let tracker = LoginAttemptTracker::new(store.clone(), shared, AttemptConfig::default());
        (Maintenance::new(locks, tracker), store, clock)
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = MaintenanceConfig {
            enabled: true,
            interval_secs: 0,
        };
        assert!(config.validate().is_err());

        let disabled = MaintenanceConfig {
            enabled: false,
            interval_secs: 0,
        };
        assert!(disabled.validate().is_ok());

        let huge = MaintenanceConfig {
            enabled: true,
            interval_secs: u64::MAX,
        };
        assert!(huge.validate().is_err());
    }

    #[tokio::test]
    async fn test_run_once_sweeps_and_purges() {
        let (maintenance, store, clock) = setup();
        let user = store.insert_test_user("ada@example.com", "ada", "hash");
        store
            .update_user_lock_status(user.id, true, Some(clock.now() + chrono::Duration::minutes(1)))
            .await
            .unwrap();
        store
            .create_login_attempt(crate::attempts::NewLoginAttempt {
                username: "ada@example.com".into(),
                ip_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
                user_agent: None,
                success: false,
                attempted_at: clock.now(),
            })
            .await
            .unwrap();

        // Nothing has lapsed yet
        assert_eq!(maintenance.run_once().await.unwrap(), MaintenanceReport::default());

        clock.advance(chrono::Duration::days(31));
        let report = maintenance.run_once().await.unwrap();
        assert_eq!(report.unlocked_accounts, 1);
        assert_eq!(report.purged_attempts, 1);

        // Second pass is a no-op
        assert_eq!(maintenance.run_once().await.unwrap(), MaintenanceReport::default());
    }

    #[tokio::test]
    async fn test_spawned_loop_runs_immediately_and_stops_on_cancel() {
        let (maintenance, store, clock) = setup();
        let user = store.insert_test_user("ada@example.com", "ada", "hash");
        store
            .update_user_lock_status(user.id, true, Some(clock.now() - chrono::Duration::seconds(1)))
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let handle = maintenance.spawn(Duration::from_secs(3600), cancel.clone());

        let unlocked = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = store.get_user(user.id).await.unwrap().unwrap();
                if !current.lock.is_locked {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(unlocked.is_ok(), "first pass should run without waiting an interval");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits after cancellation")
            .expect("task did not panic");
    }
}
