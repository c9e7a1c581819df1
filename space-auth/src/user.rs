//! User records as seen by the authentication subsystem

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Brute-force defense state embedded on a user record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountLockState {
    /// Consecutive failed logins since the last success or reset
    pub failed_login_attempts: i32,
    /// Stored lock flag; only meaningful together with `locked_until`
    pub is_locked: bool,
    /// End of the lock
    pub locked_until: Option<DateTime<Utc>>,
}

/// Effective lock state at a given instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Login is allowed
    Unlocked,
    /// Login is refused until the given instant
    Locked {
        /// When the lock ends
        until: DateTime<Utc>,
    },
}

impl LockState {
    /// Whether login is refused
    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Locked { .. })
    }

    /// Whole seconds until the lock ends, rounded up (0 when unlocked)
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        match self {
            LockState::Unlocked => 0,
            LockState::Locked { until } => {
                let millis = (*until - now).num_milliseconds().max(0) as u64;
                millis.div_ceil(1000)
            }
        }
    }
}

impl AccountLockState {
    /// Derive the effective state; a lock whose end has passed counts as unlocked
    pub fn state_at(&self, now: DateTime<Utc>) -> LockState {
        match self.locked_until {
            Some(until) if self.is_locked && until > now => LockState::Locked { until },
            _ => LockState::Unlocked,
        }
    }

    /// Whether a stored lock has lapsed but not yet been cleared
    pub fn is_stale_lock(&self, now: DateTime<Utc>) -> bool {
        self.is_locked && !self.state_at(now).is_locked()
    }
}

/// Credential record
#[derive(Debug, Clone)]
pub struct User {
    /// User id
    pub id: Uuid,
    /// Tenant
    pub space_id: Uuid,
    /// Login identifier, stored lowercase
    pub email: String,
    /// Display handle
    pub username: String,
    /// Argon2 PHC string
    pub password_hash: String,
    /// Lock state
    pub lock: AccountLockState,
    /// When the account was created
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Public projection returned to clients
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            space_id: self.space_id,
        }
    }
}

/// User fields safe to return in a login response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    /// User id
    pub id: Uuid,
    /// Display handle
    pub username: String,
    /// Login identifier
    pub email: String,
    /// Tenant
    pub space_id: Uuid,
}

/// Row returned by the locked-account listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedUser {
    /// User id
    pub id: Uuid,
    /// Display handle
    pub username: String,
    /// Login identifier
    pub email: String,
    /// Failed attempts recorded on the account
    pub failed_login_attempts: i32,
    /// End of the lock
    pub locked_until: DateTime<Utc>,
}

/// Normalize a login identifier the way it is stored
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_lock_requires_future_locked_until() {
        let now = Utc::now();
        let state = AccountLockState {
            failed_login_attempts: 5,
            is_locked: true,
            locked_until: Some(now + Duration::minutes(10)),
        };
        assert_eq!(
            state.state_at(now),
            LockState::Locked {
                until: now + Duration::minutes(10)
            }
        );

        // Past expiry reads as unlocked even with the flag still set
        assert_eq!(state.state_at(now + Duration::minutes(10)), LockState::Unlocked);
        assert!(state.is_stale_lock(now + Duration::minutes(11)));
    }

    #[test]
    fn test_flag_without_timestamp_is_unlocked() {
        let state = AccountLockState {
            failed_login_attempts: 5,
            is_locked: true,
            locked_until: None,
        };
        assert_eq!(state.state_at(Utc::now()), LockState::Unlocked);
    }

    #[test]
    fn test_timestamp_without_flag_is_unlocked() {
        let now = Utc::now();
        let state = AccountLockState {
            failed_login_attempts: 0,
            is_locked: false,
            locked_until: Some(now + Duration::hours(1)),
        };
        assert_eq!(state.state_at(now), LockState::Unlocked);
    }

    #[test]
    fn test_remaining_secs_rounds_up() {
        let now = Utc::now();
        let state = LockState::Locked {
            until: now + Duration::milliseconds(1500),
        };
        assert_eq!(state.remaining_secs(now), 2);
        assert_eq!(LockState::Unlocked.remaining_secs(now), 0);
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Ada@Example.COM "), "ada@example.com");
    }
}
