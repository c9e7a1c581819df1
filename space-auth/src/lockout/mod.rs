//! Account lockout
//!
//! Brute-force protection at the account level: a counter of consecutive
//! failed password checks on the user row, a lock that is set once the
//! counter reaches the threshold, and a sweep that clears lapsed locks.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use space_auth::lockout::{AccountLockManager, LockoutConfig};
//!
//! let locks = AccountLockManager::new(stores.users.clone(), clock, lockout_config);
//!
//! locks.ensure_unlocked(&user)?; // 423 before any password work
//! if hasher.verify(password, &user.password_hash)? {
//!     locks.record_success(&user).await?;
//! } else {
//!     locks.record_failure(&user).await?;
//! }
//! ```

pub mod config;
pub mod manager;
pub mod notification;

pub use config::LockoutConfig;
pub use manager::{AccountLockManager, LockoutStatus};
pub use notification::{LockoutEvent, LockoutNotification, UnlockReason};

use async_trait::async_trait;

use crate::audit::{AuditAction, AuditLogger};

/// Notification handler that writes lock transitions to the audit log
///
/// Admin unlocks are skipped here because the admin path audits them
/// itself, with the acting administrator attached.
pub struct AuditLockoutNotification {
    audit_logger: AuditLogger,
}

impl AuditLockoutNotification {
    /// Create a new audit lockout notification handler
    pub fn new(audit_logger: AuditLogger) -> Self {
        Self { audit_logger }
    }
}

#[async_trait]
impl LockoutNotification for AuditLockoutNotification {
    async fn on_event(&self, event: LockoutEvent) {
        match event {
            LockoutEvent::AccountLocked {
                user_id,
                ref username,
                attempt_count,
                lockout_duration_secs,
            } => {
                self.audit_logger
                    .record(
                        None,
                        AuditAction::AccountLocked,
                        user_id,
                        serde_json::json!({
                            "username": username,
                            "attempt_count": attempt_count,
                            "lockout_duration_secs": lockout_duration_secs,
                        }),
                    )
                    .await;
            }
            LockoutEvent::AccountUnlocked { user_id, reason } if reason != UnlockReason::AdminAction => {
                self.audit_logger
                    .record(
                        None,
                        AuditAction::AccountUnlocked,
                        user_id,
                        serde_json::json!({ "reason": reason.to_string() }),
                    )
                    .await;
            }
            // Other events are not audit-worthy
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{AuditStorage, MemoryStore};
    use chrono::Utc;
    use std::sync::Arc;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_audit_notification_records_system_events() {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(store.clone(), Arc::new(ManualClock::new(Utc::now())));
        let handler = AuditLockoutNotification::new(logger);
        let user_id = Uuid::new_v4();

        handler
            .on_event(LockoutEvent::AccountLocked {
                user_id,
                username: "ada".into(),
                attempt_count: 5,
                lockout_duration_secs: 1800,
            })
            .await;
        handler
            .on_event(LockoutEvent::AccountUnlocked {
                user_id,
                reason: UnlockReason::AdminAction,
            })
            .await;
        handler
            .on_event(LockoutEvent::AccountUnlocked {
                user_id,
                reason: UnlockReason::SuccessfulLogin,
            })
            .await;

        let entries = store.recent_audit_logs(10).await.expect("audit");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.admin_user_id.is_none()));
        assert!(entries.iter().any(|e| e.action == AuditAction::AccountLocked
            && e.details["attempt_count"] == 5));
        assert!(entries.iter().any(|e| e.action == AuditAction::AccountUnlocked
            && e.details["reason"] == "successful_login"));
    }
}
