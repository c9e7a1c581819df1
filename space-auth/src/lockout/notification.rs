//! Lockout notification hooks
//!
//! Provides a trait for receiving lockout lifecycle events (failed attempts,
//! threshold warnings, account locks and unlocks). Notifications are
//! dispatched via `tokio::spawn` so they never block login responses.

use async_trait::async_trait;
use uuid::Uuid;

/// Events emitted during the lockout lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LockoutEvent {
    /// A login attempt failed the password check
    FailedAttempt {
        /// Account that failed
        user_id: Uuid,
        /// Username of the account
        username: String,
        /// Counter value after the increment
        attempt_count: u32,
        /// Maximum attempts before lockout
        max_attempts: u32,
    },
    /// The warning threshold has been reached
    ApproachingThreshold {
        /// Account approaching lockout
        user_id: Uuid,
        /// Username of the account
        username: String,
        /// Current number of failed attempts
        attempt_count: u32,
        /// Remaining attempts before lockout
        remaining_attempts: u32,
    },
    /// Account has been locked due to too many failures
    AccountLocked {
        /// Account that was locked
        user_id: Uuid,
        /// Username of the account
        username: String,
        /// Number of failed attempts that triggered the lock
        attempt_count: u32,
        /// How long the account is locked (seconds)
        lockout_duration_secs: u64,
    },
    /// Account has been unlocked
    AccountUnlocked {
        /// Account that was unlocked
        user_id: Uuid,
        /// Why the account was unlocked
        reason: UnlockReason,
    },
}

/// Reason an account was unlocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnlockReason {
    /// A successful login after the lock lapsed cleared it
    SuccessfulLogin,
    /// An administrator manually unlocked the account
    AdminAction,
}

impl std::fmt::Display for UnlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SuccessfulLogin => write!(f, "successful_login"),
            Self::AdminAction => write!(f, "admin_action"),
        }
    }
}

/// Trait for receiving lockout lifecycle notifications
///
/// Handlers are invoked inside `tokio::spawn` and must handle their own
/// errors (log and continue).
///
/// # Example
///
/// ```rust,ignore
/// use space_auth::lockout::{LockoutEvent, LockoutNotification};
///
/// struct EmailNotifier { /* ... */ }
///
/// #[async_trait]
/// impl LockoutNotification for EmailNotifier {
///     async fn on_event(&self, event: LockoutEvent) {
///         if let LockoutEvent::AccountLocked { user_id, .. } = event {
///             // send_lockout_email(user_id).await;
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait LockoutNotification: Send + Sync + 'static {
    /// Called when a lockout lifecycle event occurs
    async fn on_event(&self, event: LockoutEvent);
}
