//! In-process storage backend
//!
//! Users and sessions live in [`DashMap`]s so that a failure-counter
//! increment happens under the entry's shard lock, which gives the same
//! no-lost-update guarantee as the SQL `UPDATE ... RETURNING`.
//! Append-only logs are plain vectors behind a mutex.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use uuid::Uuid;

use super::{AuditStorage, LoginAttemptStorage, SessionStorage, UserStorage};
use crate::attempts::{AttemptKey, LoginAttempt, NewLoginAttempt};
use crate::audit::AuditEntry;
use crate::error::{Error, Result, StorageError, StorageOperation};
use crate::session::{NewSession, Session, SessionRejection};
use crate::user::{AccountLockState, LockedUser, User};

/// In-memory implementation of every storage trait
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    sessions: DashMap<Uuid, Session>,
    // refresh token -> session id; always locked before `sessions`
    refresh_tokens: DashMap<String, Uuid>,
    attempts: Mutex<Vec<LoginAttempt>>,
    audit: Mutex<Vec<AuditEntry>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn user_not_found(id: Uuid) -> Error {
    Error::NotFound(format!("user {}", id))
}

fn session_not_found(id: Uuid) -> Error {
    Error::NotFound(format!("session {}", id))
}

fn duplicate_session(detail: &str) -> Error {
    StorageError::constraint(StorageOperation::Insert, detail).into()
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user record
    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Number of stored login attempts
    pub fn attempt_count(&self) -> usize {
        lock(&self.attempts).len()
    }

    /// Number of stored sessions, blocked or not
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn insert_test_user(&self, email: &str, username: &str, password_hash: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            space_id: Uuid::new_v4(),
            email: email.to_string(),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            lock: AccountLockState::default(),
            created_at: Utc::now(),
        };
        self.insert_user(user.clone());
        user
    }

    fn update_user<F>(&self, id: Uuid, mutate: F) -> Result<User>
    where
        F: FnOnce(&mut User),
    {
        let mut entry = self.users.get_mut(&id).ok_or_else(|| user_not_found(id))?;
        mutate(entry.value_mut());
        Ok(entry.value().clone())
    }

    fn insert_session(&self, new: NewSession, now: DateTime<Utc>) -> Result<Session> {
        let Entry::Vacant(token_slot) = self.refresh_tokens.entry(new.refresh_token.clone()) else {
            return Err(duplicate_session("refresh token already exists"));
        };
        let Entry::Vacant(session_slot) = self.sessions.entry(new.id) else {
            return Err(duplicate_session("session id already exists"));
        };

        let session = Session::from_new(new, now);
        token_slot.insert(session.id);
        session_slot.insert(session.clone());
        Ok(session)
    }
}

#[async_trait]
impl UserStorage for MemoryStore {
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.email == email)
            .map(|u| u.value().clone()))
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.value().clone()))
    }

    async fn increment_failed_login_attempts(&self, id: Uuid) -> Result<User> {
        self.update_user(id, |u| u.lock.failed_login_attempts += 1)
    }

    async fn reset_failed_login_attempts(&self, id: Uuid) -> Result<User> {
        self.update_user(id, |u| u.lock = AccountLockState::default())
    }

    async fn update_user_lock_status(
        &self,
        id: Uuid,
        is_locked: bool,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<User> {
        self.update_user(id, |u| {
            u.lock.is_locked = is_locked;
            u.lock.locked_until = locked_until;
        })
    }

    async fn unlock_expired_accounts(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut unlocked = 0;
        for mut user in self.users.iter_mut() {
            let lapsed = user.lock.is_locked && user.lock.locked_until.is_some_and(|t| t <= now);
            if lapsed {
                user.lock = AccountLockState::default();
                unlocked += 1;
            }
        }
        Ok(unlocked)
    }

    async fn clear_expired_lock(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut user = self.users.get_mut(&id).ok_or_else(|| user_not_found(id))?;
        if !user.lock.is_stale_lock(now) {
            return Ok(false);
        }
        user.lock = AccountLockState::default();
        Ok(true)
    }

    async fn get_locked_users(&self, now: DateTime<Utc>) -> Result<Vec<LockedUser>> {
        let mut locked: Vec<LockedUser> = self
            .users
            .iter()
            .filter_map(|u| match u.lock.locked_until {
                Some(until) if u.lock.is_locked && until > now => Some(LockedUser {
                    id: u.id,
                    username: u.username.clone(),
                    email: u.email.clone(),
                    failed_login_attempts: u.lock.failed_login_attempts,
                    locked_until: until,
                }),
                _ => None,
            })
            .collect();
        locked.sort_by_key(|u| u.locked_until);
        Ok(locked)
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()> {
        self.update_user(id, |u| u.password_hash = password_hash.to_string())?;
        Ok(())
    }
}

#[async_trait]
impl SessionStorage for MemoryStore {
    async fn create_session(&self, new: NewSession, now: DateTime<Utc>) -> Result<Session> {
        self.insert_session(new, now)
    }

    async fn get_session(&self, id: Uuid) -> Result<Session> {
        self.sessions
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or_else(|| session_not_found(id))
    }

    async fn block_session(&self, id: Uuid) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| session_not_found(id))?;
        session.is_blocked = true;
        Ok(())
    }

    async fn touch_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| session_not_found(id))?;
        session.last_activity = at;
        Ok(())
    }

    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.value().clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn block_user_sessions(&self, user_id: Uuid) -> Result<u64> {
        let mut blocked = 0;
        for mut session in self.sessions.iter_mut() {
            if session.user_id == user_id && !session.is_blocked {
                session.is_blocked = true;
                blocked += 1;
            }
        }
        Ok(blocked)
    }

    async fn rotate_session(
        &self,
        old_id: Uuid,
        new: NewSession,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        {
            let mut old = self
                .sessions
                .get_mut(&old_id)
                .ok_or_else(|| session_not_found(old_id))?;
            if old.is_blocked {
                return Err(Error::SessionInvalid(SessionRejection::Blocked));
            }
            old.is_blocked = true;
        }

        self.insert_session(new, now).inspect_err(|_| {
            // Undo the claim so a failed insert leaves the old session usable
            if let Some(mut old) = self.sessions.get_mut(&old_id) {
                old.is_blocked = false;
            }
        })
    }
}

#[async_trait]
impl LoginAttemptStorage for MemoryStore {
    async fn create_login_attempt(&self, attempt: NewLoginAttempt) -> Result<LoginAttempt> {
        let attempt = attempt.into_attempt();
        lock(&self.attempts).push(attempt.clone());
        Ok(attempt)
    }

    async fn count_recent_failed_login_attempts(
        &self,
        key: &AttemptKey,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        let count = lock(&self.attempts)
            .iter()
            .filter(|a| {
                !a.success && key.matches(a) && a.attempted_at >= since && a.attempted_at <= until
            })
            .count();
        Ok(count as u64)
    }

    async fn recent_login_attempts(
        &self,
        key: &AttemptKey,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LoginAttempt>> {
        let mut attempts: Vec<LoginAttempt> = lock(&self.attempts)
            .iter()
            .filter(|a| key.matches(a) && a.attempted_at >= since)
            .cloned()
            .collect();
        // Stable sort keeps insertion order for equal timestamps; reverse for newest first
        attempts.sort_by_key(|a| a.attempted_at);
        attempts.reverse();
        attempts.truncate(limit);
        Ok(attempts)
    }

    async fn cleanup_old_login_attempts(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut attempts = lock(&self.attempts);
        let len = attempts.len();
        attempts.retain(|a| a.attempted_at >= before);
        Ok((len - attempts.len()) as u64)
    }
}

#[async_trait]
impl AuditStorage for MemoryStore {
    async fn create_audit_log(&self, entry: &AuditEntry) -> Result<()> {
        lock(&self.audit).push(entry.clone());
        Ok(())
    }

    async fn recent_audit_logs(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        Ok(lock(&self.audit).iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{TokenKind, TokenPayload};
    use chrono::Duration;
    use std::sync::Arc;

    fn new_session(user_id: Uuid, token: &str, now: DateTime<Utc>) -> NewSession {
        let payload = TokenPayload::new(
            TokenKind::Refresh,
            user_id,
            "ada",
            Uuid::new_v4(),
            now,
            Duration::hours(24),
        );
        NewSession::for_refresh_token(token, &payload, "test-agent", None)
    }

    #[tokio::test]
    async fn test_block_session_is_idempotent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = store
            .create_session(new_session(Uuid::new_v4(), "t1", now), now)
            .await
            .expect("create");

        store.block_session(session.id).await.expect("first block");
        store.block_session(session.id).await.expect("second block");
        assert!(store.get_session(session.id).await.expect("get").is_blocked);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_session(Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.block_session(Uuid::new_v4()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_refresh_token_is_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = Uuid::new_v4();
        store
            .create_session(new_session(user, "same", now), now)
            .await
            .expect("create");

        let result = store.create_session(new_session(user, "same", now), now).await;
        assert!(matches!(result, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_many_sessions_per_user() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = Uuid::new_v4();
        for token in ["a", "b", "c"] {
            store
                .create_session(new_session(user, token, now), now)
                .await
                .expect("create");
        }
        assert_eq!(store.list_user_sessions(user).await.expect("list").len(), 3);
        assert_eq!(store.block_user_sessions(user).await.expect("block"), 3);
        assert_eq!(store.block_user_sessions(user).await.expect("block"), 0);
    }

    #[tokio::test]
    async fn test_rotate_blocks_old_session() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = Uuid::new_v4();
        let old = store
            .create_session(new_session(user, "old", now), now)
            .await
            .expect("create");

        let new = store
            .rotate_session(old.id, new_session(user, "new", now), now)
            .await
            .expect("rotate");

        assert!(store.get_session(old.id).await.expect("old").is_blocked);
        assert!(!store.get_session(new.id).await.expect("new").is_blocked);
    }

    #[tokio::test]
    async fn test_rotate_refuses_blocked_session() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = Uuid::new_v4();
        let old = store
            .create_session(new_session(user, "old", now), now)
            .await
            .expect("create");
        store
            .rotate_session(old.id, new_session(user, "first", now), now)
            .await
            .expect("rotate");

        let second = store
            .rotate_session(old.id, new_session(user, "second", now), now)
            .await;
        assert!(matches!(
            second,
            Err(Error::SessionInvalid(SessionRejection::Blocked))
        ));
        assert_eq!(store.session_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_rotation_leaves_old_session_usable() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let user = Uuid::new_v4();
        let old = store
            .create_session(new_session(user, "old", now), now)
            .await
            .expect("create");
        store
            .create_session(new_session(user, "taken", now), now)
            .await
            .expect("create");

        let result = store
            .rotate_session(old.id, new_session(user, "taken", now), now)
            .await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(!store.get_session(old.id).await.expect("old").is_blocked);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotations_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let user = Uuid::new_v4();
        let old = store
            .create_session(new_session(user, "old", now), now)
            .await
            .expect("create");

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .rotate_session(old.id, new_session(user, &format!("next-{}", i), now), now)
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            match task.await.expect("join") {
                Ok(_) => winners += 1,
                Err(Error::SessionInvalid(SessionRejection::Blocked)) => {}
                Err(e) => panic!("unexpected error: {:?}", e),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.session_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_tokens_insert_once() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let user = Uuid::new_v4();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .create_session(new_session(user, "contested", now), now)
                        .await
                })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.expect("join").is_ok() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_lock() {
        let store = MemoryStore::new();
        let user = store.insert_test_user("ada@example.com", "ada", "hash");
        let until = Utc::now() + Duration::minutes(5);

        store.increment_failed_login_attempts(user.id).await.expect("inc");
        store
            .update_user_lock_status(user.id, true, Some(until))
            .await
            .expect("lock");

        let reset = store.reset_failed_login_attempts(user.id).await.expect("reset");
        assert_eq!(reset.lock, AccountLockState::default());
    }
}
