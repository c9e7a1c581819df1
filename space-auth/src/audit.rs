//! Admin audit log (write side)
//!
//! Security-relevant administrative actions and system lock transitions
//! are appended here. Writing never fails the caller: a storage error is
//! logged and the action proceeds.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::AuditStorage;

/// Kind of audited action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Admin locked an account for a chosen duration
    SuspendUser,
    /// Admin cleared a lock
    UnlockUser,
    /// Admin replaced a user's password
    ResetPassword,
    /// Admin blocked all sessions of a user
    RevokeSessions,
    /// Repeated failures locked an account
    AccountLocked,
    /// A lock was cleared without admin involvement
    AccountUnlocked,
}

impl AuditAction {
    /// Stable string form used in storage
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuspendUser => "suspend_user",
            Self::UnlockUser => "unlock_user",
            Self::ResetPassword => "reset_password",
            Self::RevokeSessions => "revoke_sessions",
            Self::AccountLocked => "account_locked",
            Self::AccountUnlocked => "account_unlocked",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suspend_user" => Ok(Self::SuspendUser),
            "unlock_user" => Ok(Self::UnlockUser),
            "reset_password" => Ok(Self::ResetPassword),
            "revoke_sessions" => Ok(Self::RevokeSessions),
            "account_locked" => Ok(Self::AccountLocked),
            "account_unlocked" => Ok(Self::AccountUnlocked),
            other => Err(format!("unknown audit action '{}'", other)),
        }
    }
}

/// One audit log row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry id
    pub id: Uuid,
    /// Acting administrator; `None` for system events
    pub admin_user_id: Option<Uuid>,
    /// What happened
    pub action: AuditAction,
    /// Kind of resource acted on
    pub resource_type: String,
    /// Resource acted on
    pub resource_id: Option<Uuid>,
    /// Action-specific detail
    pub details: serde_json::Value,
    /// When the entry was written
    pub created_at: DateTime<Utc>,
}

/// Audit logger
#[derive(Clone)]
pub struct AuditLogger {
    storage: Arc<dyn AuditStorage>,
    clock: Arc<dyn Clock>,
}

impl AuditLogger {
    /// Create a new audit logger
    pub fn new(storage: Arc<dyn AuditStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Append an entry about a user account
    pub async fn record(
        &self,
        admin_user_id: Option<Uuid>,
        action: AuditAction,
        user_id: Uuid,
        details: serde_json::Value,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            admin_user_id,
            action,
            resource_type: "user".to_string(),
            resource_id: Some(user_id),
            details,
            created_at: self.clock.now(),
        };
        self.log(entry).await;
    }

    /// Append a prepared entry
    pub async fn log(&self, entry: AuditEntry) {
        if let Err(e) = self.storage.create_audit_log(&entry).await {
            tracing::warn!(
                action = %entry.action,
                resource_id = ?entry.resource_id,
                error = %e,
                "Failed to write audit log entry"
            );
        }
    }
}
