//! Persistence traits and backends
//!
//! Each concern gets its own trait so components depend only on what they
//! touch. Both backends implement all four:
//!
//! - [`MemoryStore`]: process-local, used by tests and single-node setups
//! - [`PgStore`] (`database` feature): PostgreSQL via sqlx
//!
//! Every operation that needs "now" takes it as an argument; backends
//! never read the wall clock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::attempts::{AttemptKey, LoginAttempt, NewLoginAttempt};
use crate::audit::AuditEntry;
use crate::error::Result;
use crate::session::{NewSession, Session};
use crate::user::{LockedUser, User};

pub mod memory;
#[cfg(feature = "database")]
pub mod pg;

pub use memory::MemoryStore;
#[cfg(feature = "database")]
pub use pg::PgStore;

/// Credential store
#[async_trait]
pub trait UserStorage: Send + Sync {
    /// Look up a user by normalized email
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Look up a user by id
    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    /// Atomically add one to the failure counter and return the updated row
    async fn increment_failed_login_attempts(&self, id: Uuid) -> Result<User>;

    /// Zero the failure counter and clear any lock
    async fn reset_failed_login_attempts(&self, id: Uuid) -> Result<User>;

    /// Set the lock flag and end time unconditionally
    async fn update_user_lock_status(
        &self,
        id: Uuid,
        is_locked: bool,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<User>;

    /// Clear locks whose end is at or before `now`; returns rows changed
    async fn unlock_expired_accounts(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Clear one account's lock and counter if the lock has lapsed at `now`
    ///
    /// Returns whether anything changed. A live lock or an unlocked account
    /// is left alone.
    async fn clear_expired_lock(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Accounts locked at `now`, soonest expiry first
    async fn get_locked_users(&self, now: DateTime<Utc>) -> Result<Vec<LockedUser>>;

    /// Replace the stored password hash
    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()>;
}

/// Session rows
#[async_trait]
pub trait SessionStorage: Send + Sync {
    /// Insert a session with `is_blocked = false` and `last_activity = now`
    async fn create_session(&self, new: NewSession, now: DateTime<Utc>) -> Result<Session>;

    /// Fetch a session; `Error::NotFound` when absent
    async fn get_session(&self, id: Uuid) -> Result<Session>;

    /// Mark a session blocked; blocking twice succeeds
    async fn block_session(&self, id: Uuid) -> Result<()>;

    /// Record activity on a session
    async fn touch_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// All sessions of a user, newest first
    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>>;

    /// Block every session of a user; returns rows changed
    async fn block_user_sessions(&self, user_id: Uuid) -> Result<u64>;

    /// Block `old_id` and insert `new` as one atomic step
    ///
    /// Only an unblocked `old_id` can be rotated; a session already blocked,
    /// including by a concurrent rotation, fails with
    /// `SessionInvalid(Blocked)` and nothing is inserted.
    async fn rotate_session(
        &self,
        old_id: Uuid,
        new: NewSession,
        now: DateTime<Utc>,
    ) -> Result<Session>;
}

/// Append-only login attempt log
#[async_trait]
pub trait LoginAttemptStorage: Send + Sync {
    /// Insert one attempt
    async fn create_login_attempt(&self, attempt: NewLoginAttempt) -> Result<LoginAttempt>;

    /// Failed attempts for `key` with `since <= attempted_at <= until`
    async fn count_recent_failed_login_attempts(
        &self,
        key: &AttemptKey,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64>;

    /// Attempts for `key` at or after `since`, newest first
    async fn recent_login_attempts(
        &self,
        key: &AttemptKey,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LoginAttempt>>;

    /// Delete attempts strictly older than `before`; returns rows deleted
    async fn cleanup_old_login_attempts(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Write side of the admin audit log
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Append an entry
    async fn create_audit_log(&self, entry: &AuditEntry) -> Result<()>;

    /// Most recent entries, newest first
    async fn recent_audit_logs(&self, limit: usize) -> Result<Vec<AuditEntry>>;
}

/// Handles to every storage concern, usually all pointing at one backend
#[derive(Clone)]
pub struct Stores {
    /// Credential store
    pub users: Arc<dyn UserStorage>,
    /// Session rows
    pub sessions: Arc<dyn SessionStorage>,
    /// Login attempt log
    pub attempts: Arc<dyn LoginAttemptStorage>,
    /// Audit log
    pub audit: Arc<dyn AuditStorage>,
}

impl Stores {
    /// Use a single backend for every concern
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: UserStorage + SessionStorage + LoginAttemptStorage + AuditStorage + 'static,
    {
        Self {
            users: backend.clone(),
            sessions: backend.clone(),
            attempts: backend.clone(),
            audit: backend,
        }
    }
}
