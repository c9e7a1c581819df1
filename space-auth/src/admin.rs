//! Administrative account operations
//!
//! Each operation acts on one user account and writes an audit entry
//! naming the acting administrator. Authorization of the administrator
//! is the caller's responsibility.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLogger};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::lockout::AccountLockManager;
use crate::password::PasswordHasher;
use crate::service::AuthService;
use crate::store::Stores;
use crate::user::User;

/// Suspend, unlock, reset and revoke on behalf of an administrator
#[derive(Clone)]
pub struct AccountAdmin {
    stores: Stores,
    locks: AccountLockManager,
    hasher: PasswordHasher,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
}

impl AccountAdmin {
    /// Share the components of an [`AuthService`]
    pub fn new(service: &AuthService) -> Self {
        Self {
            stores: service.stores().clone(),
            locks: service.locks().clone(),
            hasher: service.hasher().clone(),
            audit: service.audit().clone(),
            clock: service.clock().clone(),
        }
    }

    /// Lock an account for `duration` and block all its sessions
    pub async fn suspend(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        reason: &str,
        duration: Duration,
    ) -> Result<User> {
        if duration <= Duration::zero() {
            return Err(Error::ValidationError(
                "suspension duration must be positive".to_string(),
            ));
        }

        let until = self
            .clock
            .now()
            .checked_add_signed(duration)
            .ok_or_else(|| Error::ValidationError("suspension duration is too long".to_string()))?;
        let user = self.locks.lock_until(user_id, until).await?;
        let revoked = self.stores.sessions.block_user_sessions(user_id).await?;

        info!(admin_id = %admin_id, user_id = %user_id, locked_until = %until, revoked, "User suspended");
        self.audit
            .record(
                Some(admin_id),
                AuditAction::SuspendUser,
                user_id,
                json!({
                    "reason": reason,
                    "duration_secs": duration.num_seconds(),
                    "locked_until": until,
                    "revoked_sessions": revoked,
                }),
            )
            .await;

        Ok(user)
    }

    /// Clear a lock and reset the failure counter
    pub async fn unlock(&self, admin_id: Uuid, user_id: Uuid) -> Result<User> {
        let previous_attempts = self.require_user(user_id).await?.lock.failed_login_attempts;
        let user = self.locks.unlock(user_id).await?;

        self.audit
            .record(
                Some(admin_id),
                AuditAction::UnlockUser,
                user_id,
                json!({ "previous_failed_attempts": previous_attempts }),
            )
            .await;

        Ok(user)
    }

    /// Replace a user's password and block all sessions; returns sessions blocked
    pub async fn reset_password(
        &self,
        admin_id: Uuid,
        user_id: Uuid,
        new_password: &str,
    ) -> Result<u64> {
        self.require_user(user_id).await?;

        let hasher = self.hasher.clone();
        let password = new_password.to_string();
        let hash = tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(|e| Error::Internal(format!("password hashing task failed: {}", e)))??;

        self.stores.users.update_password(user_id, &hash).await?;
        let revoked = self.stores.sessions.block_user_sessions(user_id).await?;

        info!(admin_id = %admin_id, user_id = %user_id, revoked, "Password reset by administrator");
        self.audit
            .record(
                Some(admin_id),
                AuditAction::ResetPassword,
                user_id,
                json!({ "revoked_sessions": revoked }),
            )
            .await;

        Ok(revoked)
    }

    /// Block every session of a user; returns sessions newly blocked
    pub async fn revoke_sessions(&self, admin_id: Uuid, user_id: Uuid) -> Result<u64> {
        self.require_user(user_id).await?;
        let revoked = self.stores.sessions.block_user_sessions(user_id).await?;

        info!(admin_id = %admin_id, user_id = %user_id, revoked, "Sessions revoked by administrator");
        self.audit
            .record(
                Some(admin_id),
                AuditAction::RevokeSessions,
                user_id,
                json!({ "revoked_sessions": revoked }),
            )
            .await;

        Ok(revoked)
    }

    async fn require_user(&self, user_id: Uuid) -> Result<User> {
        self.stores
            .users
            .get_user(user_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))
    }
}
