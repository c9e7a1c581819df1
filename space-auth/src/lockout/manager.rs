//! Account lock state machine
//!
//! Lock state lives on the user row. The failure counter only moves through
//! the store's atomic increment, and the threshold is compared against the
//! value that increment returned, so concurrent failures can neither lose
//! an increment nor both miss the crossing.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::LockoutConfig;
use super::notification::{LockoutEvent, LockoutNotification, UnlockReason};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::UserStorage;
use crate::user::{LockState, LockedUser, User};

/// Outcome of recording a failure
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct LockoutStatus {
    /// Whether this failure locked the account
    pub locked: bool,
    /// Counter value after the increment
    pub attempt_count: u32,
    /// Maximum attempts allowed before lockout
    pub max_attempts: u32,
    /// Seconds remaining until lockout expires (0 if not locked)
    pub lockout_remaining_secs: u64,
}

/// Decides lock and unlock transitions for accounts
///
/// Construct once at startup and share; all state is in the store.
#[derive(Clone)]
pub struct AccountLockManager {
    users: Arc<dyn UserStorage>,
    clock: Arc<dyn Clock>,
    config: LockoutConfig,
    notifications: Vec<Arc<dyn LockoutNotification>>,
}

impl AccountLockManager {
    /// Create a lock manager
    pub fn new(users: Arc<dyn UserStorage>, clock: Arc<dyn Clock>, config: LockoutConfig) -> Self {
        Self {
            users,
            clock,
            config,
            notifications: Vec::new(),
        }
    }

    /// Register a notification handler for lockout events
    ///
    /// Multiple handlers can be registered. Events are dispatched
    /// via `tokio::spawn` (fire-and-forget).
    pub fn with_notification(mut self, handler: Arc<dyn LockoutNotification>) -> Self {
        self.notifications.push(handler);
        self
    }

    /// Lockout configuration
    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    /// Effective lock state of `user` now
    pub fn check(&self, user: &User) -> LockState {
        user.lock.state_at(self.clock.now())
    }

    /// Fail with `AccountLocked` when `user` is currently locked
    pub fn ensure_unlocked(&self, user: &User) -> Result<()> {
        let now = self.clock.now();
        let state = user.lock.state_at(now);
        if state.is_locked() {
            debug!(user_id = %user.id, "Login refused for locked account");
            return Err(Error::AccountLocked {
                retry_after_secs: state.remaining_secs(now),
            });
        }
        Ok(())
    }

    /// Record a failed password check
    ///
    /// Increments the counter and locks the account for the configured
    /// duration once the returned count reaches the threshold. A lock that
    /// has lapsed but not yet been swept is cleared first, so the count
    /// restarts exactly as it would after the sweep. Storage errors
    /// propagate; the increment is never skipped silently.
    pub async fn record_failure(&self, user: &User) -> Result<LockoutStatus> {
        let now = self.clock.now();
        if user.lock.is_stale_lock(now) && self.users.clear_expired_lock(user.id, now).await? {
            debug!(user_id = %user.id, "Cleared lapsed lock before counting failure");
        }

        let updated = self.users.increment_failed_login_attempts(user.id).await?;
        let count = updated.lock.failed_login_attempts.max(0) as u32;
        let max_attempts = self.config.max_attempts;

        debug!(
            user_id = %user.id,
            attempt_count = count,
            max_attempts = max_attempts,
            "Login failure recorded"
        );

        self.notify(LockoutEvent::FailedAttempt {
            user_id: user.id,
            username: user.username.clone(),
            attempt_count: count,
            max_attempts,
        });

        if self.config.warning_threshold > 0
            && count == self.config.warning_threshold
            && count < max_attempts
        {
            self.notify(LockoutEvent::ApproachingThreshold {
                user_id: user.id,
                username: user.username.clone(),
                attempt_count: count,
                remaining_attempts: max_attempts - count,
            });
        }

        if count >= max_attempts {
            let until = now + self.config.lockout_duration();
            self.users
                .update_user_lock_status(user.id, true, Some(until))
                .await?;

            warn!(
                user_id = %user.id,
                attempt_count = count,
                lockout_duration_secs = self.config.lockout_duration_secs,
                "Account locked due to repeated login failures"
            );

            self.notify(LockoutEvent::AccountLocked {
                user_id: user.id,
                username: user.username.clone(),
                attempt_count: count,
                lockout_duration_secs: self.config.lockout_duration_secs,
            });

            return Ok(LockoutStatus {
                locked: true,
                attempt_count: count,
                max_attempts,
                lockout_remaining_secs: self.config.lockout_duration_secs,
            });
        }

        Ok(LockoutStatus {
            locked: false,
            attempt_count: count,
            max_attempts,
            lockout_remaining_secs: 0,
        })
    }

    /// Record a successful login
    ///
    /// Resets the counter and clears any lock unconditionally.
    pub async fn record_success(&self, user: &User) -> Result<()> {
        let had_lock = user.lock.is_locked;
        self.users.reset_failed_login_attempts(user.id).await?;

        if had_lock {
            info!(user_id = %user.id, "Account unlocked via successful login");
            self.notify(LockoutEvent::AccountUnlocked {
                user_id: user.id,
                reason: UnlockReason::SuccessfulLogin,
            });
        }

        Ok(())
    }

    /// Manually unlock an account (admin action)
    ///
    /// Clears the lock and resets the counter immediately.
    pub async fn unlock(&self, user_id: Uuid) -> Result<User> {
        let user = self.users.reset_failed_login_attempts(user_id).await?;

        info!(user_id = %user_id, "Account manually unlocked (admin)");
        self.notify(LockoutEvent::AccountUnlocked {
            user_id,
            reason: UnlockReason::AdminAction,
        });

        Ok(user)
    }

    /// Lock an account until `until` regardless of its counter (admin action)
    pub async fn lock_until(&self, user_id: Uuid, until: DateTime<Utc>) -> Result<User> {
        let user = self
            .users
            .update_user_lock_status(user_id, true, Some(until))
            .await?;
        info!(user_id = %user_id, locked_until = %until, "Account locked by administrator");
        Ok(user)
    }

    /// Clear stored locks that have lapsed; returns accounts changed
    ///
    /// Readers already treat lapsed locks as unlocked; this keeps
    /// [`locked_users`](Self::locked_users) accurate.
    pub async fn sweep(&self) -> Result<u64> {
        let unlocked = self.users.unlock_expired_accounts(self.clock.now()).await?;
        if unlocked > 0 {
            info!(unlocked, "Cleared expired account locks");
        }
        Ok(unlocked)
    }

    /// Accounts locked right now
    pub async fn locked_users(&self) -> Result<Vec<LockedUser>> {
        self.users.get_locked_users(self.clock.now()).await
    }

    /// Dispatch a notification event to all registered handlers
    fn notify(&self, event: LockoutEvent) {
        for handler in &self.notifications {
            let handler = Arc::clone(handler);
            let event = event.clone();
            tokio::spawn(async move {
                handler.on_event(event).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration;
    use tokio::sync::mpsc;

    struct ChannelNotifier(mpsc::UnboundedSender<LockoutEvent>);

    #[async_trait]
    impl LockoutNotification for ChannelNotifier {
        async fn on_event(&self, event: LockoutEvent) {
            let _ = self.0.send(event);
        }
    }

    fn setup(config: LockoutConfig) -> (AccountLockManager, Arc<MemoryStore>, ManualClock, User) {
        let clock = ManualClock::new(Utc::now());
        let store = Arc::new(MemoryStore::new());
        let user = store.insert_test_user("ada@example.com", "ada", "not-a-real-hash");
        let manager = AccountLockManager::new(store.clone(), Arc::new(clock.clone()), config);
        (manager, store, clock, user)
    }

    fn config(max_attempts: u32) -> LockoutConfig {
        LockoutConfig {
            max_attempts,
            lockout_duration_secs: 600,
            warning_threshold: 0,
        }
    }

    async fn reload(store: &MemoryStore, id: Uuid) -> User {
        store.get_user(id).await.expect("get").expect("user exists")
    }

    #[tokio::test]
    async fn test_locks_at_threshold() {
        let (manager, store, clock, user) = setup(config(3));

        for expected in 1..3 {
            let status = manager.record_failure(&user).await.expect("failure");
            assert_eq!(status.attempt_count, expected);
            assert!(!status.locked);
        }

        let status = manager.record_failure(&user).await.expect("failure");
        assert!(status.locked);
        assert_eq!(status.lockout_remaining_secs, 600);

        let user = reload(&store, user.id).await;
        assert_eq!(
            manager.check(&user),
            LockState::Locked {
                until: clock.now() + Duration::seconds(600)
            }
        );
        assert!(matches!(
            manager.ensure_unlocked(&user),
            Err(Error::AccountLocked { retry_after_secs: 600 })
        ));
    }

    #[tokio::test]
    async fn test_lock_lapses_without_sweep() {
        let (manager, store, clock, user) = setup(config(1));
        manager.record_failure(&user).await.expect("failure");

        clock.advance(Duration::seconds(601));
        let user = reload(&store, user.id).await;

        // Stored flag is still set; the check must still read unlocked
        assert!(user.lock.is_locked);
        assert_eq!(manager.check(&user), LockState::Unlocked);
        assert!(manager.ensure_unlocked(&user).is_ok());
    }

    #[tokio::test]
    async fn test_failure_after_lapse_matches_swept_account() {
        let (manager, store, clock, user) = setup(config(3));
        let swept = store.insert_test_user("bob@example.com", "bob", "hash");
        for _ in 0..3 {
            manager.record_failure(&user).await.expect("failure");
            manager.record_failure(&swept).await.expect("failure");
        }

        clock.advance(Duration::seconds(601));
        assert!(store.clear_expired_lock(swept.id, clock.now()).await.expect("clear"));

        let unswept = reload(&store, user.id).await;
        let swept = reload(&store, swept.id).await;
        let a = manager.record_failure(&unswept).await.expect("failure");
        let b = manager.record_failure(&swept).await.expect("failure");

        assert_eq!(a, b);
        assert_eq!(a.attempt_count, 1);
        assert!(!a.locked);
        assert_eq!(manager.check(&reload(&store, unswept.id).await), LockState::Unlocked);
    }

    #[tokio::test]
    async fn test_clear_expired_lock_leaves_live_lock() {
        let (manager, store, clock, user) = setup(config(1));
        manager.record_failure(&user).await.expect("failure");

        assert!(!store.clear_expired_lock(user.id, clock.now()).await.expect("clear"));
        assert!(reload(&store, user.id).await.lock.is_locked);

        clock.advance(Duration::seconds(600));
        assert!(store.clear_expired_lock(user.id, clock.now()).await.expect("clear"));
        assert_eq!(reload(&store, user.id).await.lock, Default::default());
    }

    #[tokio::test]
    async fn test_success_resets_counter_and_lock() {
        let (manager, store, clock, user) = setup(config(2));
        manager.record_failure(&user).await.expect("failure");
        manager.record_failure(&user).await.expect("failure");
        clock.advance(Duration::minutes(11));

        let user = reload(&store, user.id).await;
        manager.record_success(&user).await.expect("success");

        let user = reload(&store, user.id).await;
        assert_eq!(user.lock.failed_login_attempts, 0);
        assert!(!user.lock.is_locked);
        assert!(user.lock.locked_until.is_none());
    }

    #[tokio::test]
    async fn test_sweep_clears_only_lapsed_locks() {
        let (manager, store, clock, user) = setup(config(1));
        let other = store.insert_test_user("bob@example.com", "bob", "hash");

        manager.record_failure(&user).await.expect("failure");
        clock.advance(Duration::minutes(5));
        manager.record_failure(&other).await.expect("failure");

        assert_eq!(manager.locked_users().await.expect("list").len(), 2);

        // First lock ends at t+10m, second at t+15m
        clock.advance(Duration::minutes(6));
        assert_eq!(manager.sweep().await.expect("sweep"), 1);
        assert_eq!(manager.sweep().await.expect("sweep"), 0);

        let locked = manager.locked_users().await.expect("list");
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].id, other.id);
    }

    #[tokio::test]
    async fn test_admin_unlock_is_immediate() {
        let (manager, store, _, user) = setup(config(1));
        manager.record_failure(&user).await.expect("failure");

        let unlocked = manager.unlock(user.id).await.expect("unlock");
        assert_eq!(manager.check(&unlocked), LockState::Unlocked);
        assert_eq!(reload(&store, user.id).await.lock.failed_login_attempts, 0);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_found() {
        let (manager, _, _, _) = setup(config(1));
        let result = manager.unlock(Uuid::new_v4()).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_not_lost() {
        let (manager, store, _, user) = setup(config(1000));
        let k = 64;

        let handles: Vec<_> = (0..k)
            .map(|_| {
                let manager = manager.clone();
                let user = user.clone();
                tokio::spawn(async move { manager.record_failure(&user).await })
            })
            .collect();

        let mut counts = Vec::new();
        for result in futures::future::join_all(handles).await {
            counts.push(result.expect("join").expect("failure").attempt_count);
        }

        assert_eq!(reload(&store, user.id).await.lock.failed_login_attempts, k);
        counts.sort_unstable();
        let expected: Vec<u32> = (1..=k as u32).collect();
        assert_eq!(counts, expected);
    }

    #[tokio::test]
    async fn test_notifications() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lockout = LockoutConfig {
            max_attempts: 3,
            lockout_duration_secs: 60,
            warning_threshold: 2,
        };
        let (manager, _, _, user) = setup(lockout);
        let manager = manager.with_notification(Arc::new(ChannelNotifier(tx)));

        for _ in 0..3 {
            manager.record_failure(&user).await.expect("failure");
        }

        let mut events = Vec::new();
        while events.len() < 5 {
            let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .expect("event in time")
                .expect("channel open");
            events.push(event);
        }

        assert!(events.iter().any(|e| matches!(
            e,
            LockoutEvent::ApproachingThreshold { remaining_attempts: 1, .. }
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            LockoutEvent::AccountLocked { attempt_count: 3, lockout_duration_secs: 60, .. }
        )));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, LockoutEvent::FailedAttempt { .. }))
                .count(),
            3
        );
    }
}
