//! PostgreSQL storage backend
//!
//! Counter and lock updates are single `UPDATE ... RETURNING` statements;
//! the sweep and cleanup are time-predicate statements that are safe to
//! run from several instances at once.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{AuditStorage, LoginAttemptStorage, SessionStorage, UserStorage};
use crate::attempts::{AttemptKey, LoginAttempt, NewLoginAttempt};
use crate::audit::{AuditAction, AuditEntry};
use crate::error::{Error, Result, StorageError, StorageErrorKind, StorageOperation};
use crate::session::{NewSession, Session, SessionRejection};
use crate::user::{AccountLockState, LockedUser, User};

const USER_COLUMNS: &str = "id, space_id, email, username, password_hash, \
     failed_login_attempts, is_locked, locked_until, created_at";

const SESSION_COLUMNS: &str = "id, user_id, space_id, username, refresh_token, user_agent, \
     ip_address, is_blocked, last_activity, expires_at, created_at";

const ATTEMPT_COLUMNS: &str = "id, username, ip_address, user_agent, success, attempted_at";

/// PostgreSQL-backed storage for users, sessions, attempts and audit entries
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    space_id: Uuid,
    email: String,
    username: String,
    password_hash: String,
    failed_login_attempts: i32,
    is_locked: bool,
    locked_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            space_id: row.space_id,
            email: row.email,
            username: row.username,
            password_hash: row.password_hash,
            lock: AccountLockState {
                failed_login_attempts: row.failed_login_attempts,
                is_locked: row.is_locked,
                locked_until: row.locked_until,
            },
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    user_id: Uuid,
    space_id: Uuid,
    username: String,
    refresh_token: String,
    user_agent: String,
    ip_address: Option<String>,
    is_blocked: bool,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            space_id: row.space_id,
            username: row.username,
            refresh_token: row.refresh_token,
            user_agent: row.user_agent,
            ip_address: row.ip_address.and_then(|ip| ip.parse().ok()),
            is_blocked: row.is_blocked,
            last_activity: row.last_activity,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    username: String,
    ip_address: String,
    user_agent: Option<String>,
    success: bool,
    attempted_at: DateTime<Utc>,
}

impl TryFrom<AttemptRow> for LoginAttempt {
    type Error = StorageError;

    fn try_from(row: AttemptRow) -> std::result::Result<Self, Self::Error> {
        let ip_address: IpAddr = row.ip_address.parse().map_err(|e| {
            StorageError::new(
                StorageOperation::Query,
                StorageErrorKind::TypeConversion,
                format!("Invalid ip_address '{}': {}", row.ip_address, e),
            )
        })?;
        Ok(Self {
            id: row.id,
            username: row.username,
            ip_address,
            user_agent: row.user_agent,
            success: row.success,
            attempted_at: row.attempted_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    admin_user_id: Option<Uuid>,
    action: String,
    resource_type: String,
    resource_id: Option<Uuid>,
    details: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StorageError;

    fn try_from(row: AuditRow) -> std::result::Result<Self, Self::Error> {
        let action: AuditAction = row.action.parse().map_err(|e: String| {
            StorageError::new(StorageOperation::Query, StorageErrorKind::TypeConversion, e)
        })?;
        Ok(Self {
            id: row.id,
            admin_user_id: row.admin_user_id,
            action,
            resource_type: row.resource_type,
            resource_id: row.resource_id,
            details: row.details,
            created_at: row.created_at,
        })
    }
}

fn user_not_found(id: Uuid) -> Error {
    Error::NotFound(format!("user {}", id))
}

fn session_not_found(id: Uuid) -> Error {
    Error::NotFound(format!("session {}", id))
}

fn key_column(key: &AttemptKey) -> (&'static str, String) {
    match key {
        AttemptKey::Username(name) => ("username", name.clone()),
        AttemptKey::Ip(ip) => ("ip_address", ip.to_string()),
    }
}

impl PgStore {
    /// Create a new PostgreSQL store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist
    ///
    /// Should be called once during application startup. The `users` table
    /// normally belongs to the wider platform; it is only created here when
    /// absent.
    pub async fn initialize(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id UUID PRIMARY KEY,
                space_id UUID NOT NULL,
                email TEXT NOT NULL UNIQUE,
                username TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                failed_login_attempts INTEGER NOT NULL DEFAULT 0,
                is_locked BOOLEAN NOT NULL DEFAULT false,
                locked_until TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id UUID PRIMARY KEY,
                user_id UUID NOT NULL,
                space_id UUID NOT NULL,
                username TEXT NOT NULL,
                refresh_token TEXT NOT NULL UNIQUE,
                user_agent TEXT NOT NULL,
                ip_address TEXT,
                is_blocked BOOLEAN NOT NULL DEFAULT false,
                last_activity TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions (user_id)",
            r#"
            CREATE TABLE IF NOT EXISTS login_attempts (
                id UUID PRIMARY KEY,
                username TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                user_agent TEXT,
                success BOOLEAN NOT NULL,
                attempted_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_login_attempts_username ON login_attempts (username, attempted_at)",
            "CREATE INDEX IF NOT EXISTS idx_login_attempts_ip ON login_attempts (ip_address, attempted_at)",
            "CREATE INDEX IF NOT EXISTS idx_login_attempts_attempted_at ON login_attempts (attempted_at)",
            r#"
            CREATE TABLE IF NOT EXISTS audit_logs (
                id UUID PRIMARY KEY,
                admin_user_id UUID,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id UUID,
                details JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_audit_logs_created_at ON audit_logs (created_at)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::from_sqlx(StorageOperation::Migration, e))?;
        }

        tracing::info!("Authentication schema initialized");
        Ok(())
    }

    async fn update_user_returning(&self, id: Uuid, set_clause: &str) -> Result<User> {
        let sql = format!(
            "UPDATE users SET {} WHERE id = $1 RETURNING {}",
            set_clause, USER_COLUMNS
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Update, e))?;
        row.map(User::from).ok_or_else(|| user_not_found(id))
    }
}

#[async_trait]
impl UserStorage for PgStore {
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE email = $1", USER_COLUMNS);
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Query, e))?;
        Ok(row.map(User::from))
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let sql = format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS);
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Query, e))?;
        Ok(row.map(User::from))
    }

    async fn increment_failed_login_attempts(&self, id: Uuid) -> Result<User> {
        self.update_user_returning(id, "failed_login_attempts = failed_login_attempts + 1")
            .await
    }

    async fn reset_failed_login_attempts(&self, id: Uuid) -> Result<User> {
        self.update_user_returning(
            id,
            "failed_login_attempts = 0, is_locked = false, locked_until = NULL",
        )
        .await
    }

    async fn update_user_lock_status(
        &self,
        id: Uuid,
        is_locked: bool,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<User> {
        let sql = format!(
            "UPDATE users SET is_locked = $2, locked_until = $3 WHERE id = $1 RETURNING {}",
            USER_COLUMNS
        );
        let row = sqlx::query_as::<_, UserRow>(&sql)
            .bind(id)
            .bind(is_locked)
            .bind(locked_until)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Update, e))?;
        row.map(User::from).ok_or_else(|| user_not_found(id))
    }

    async fn unlock_expired_accounts(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET is_locked = false, locked_until = NULL, failed_login_attempts = 0
            WHERE is_locked = true AND locked_until <= $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx(StorageOperation::Update, e))?;

        Ok(result.rows_affected())
    }

    async fn clear_expired_lock(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET is_locked = false, locked_until = NULL, failed_login_attempts = 0
            WHERE id = $1 AND is_locked = true
              AND (locked_until IS NULL OR locked_until <= $2)
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx(StorageOperation::Update, e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_locked_users(&self, now: DateTime<Utc>) -> Result<Vec<LockedUser>> {
        let rows = sqlx::query_as::<_, (Uuid, String, String, i32, DateTime<Utc>)>(
            r#"
            SELECT id, username, email, failed_login_attempts, locked_until
            FROM users
            WHERE is_locked = true AND locked_until > $1
            ORDER BY locked_until ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx(StorageOperation::Query, e))?;

        Ok(rows
            .into_iter()
            .map(
                |(id, username, email, failed_login_attempts, locked_until)| LockedUser {
                    id,
                    username,
                    email,
                    failed_login_attempts,
                    locked_until,
                },
            )
            .collect())
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()> {
        let result = sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Update, e))?;

        if result.rows_affected() == 0 {
            return Err(user_not_found(id));
        }
        Ok(())
    }
}

const INSERT_SESSION: &str = r#"
    INSERT INTO sessions (
        id, user_id, space_id, username, refresh_token, user_agent,
        ip_address, is_blocked, last_activity, expires_at, created_at
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, false, $8, $9, $8)
    RETURNING id, user_id, space_id, username, refresh_token, user_agent,
        ip_address, is_blocked, last_activity, expires_at, created_at
"#;

#[async_trait]
impl SessionStorage for PgStore {
    async fn create_session(&self, new: NewSession, now: DateTime<Utc>) -> Result<Session> {
        let row = sqlx::query_as::<_, SessionRow>(INSERT_SESSION)
            .bind(new.id)
            .bind(new.user_id)
            .bind(new.space_id)
            .bind(&new.username)
            .bind(&new.refresh_token)
            .bind(&new.user_agent)
            .bind(new.ip_address.map(|ip| ip.to_string()))
            .bind(now)
            .bind(new.expires_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Insert, e))?;

        Ok(row.into())
    }

    async fn get_session(&self, id: Uuid) -> Result<Session> {
        let sql = format!("SELECT {} FROM sessions WHERE id = $1", SESSION_COLUMNS);
        let row = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Query, e))?;
        row.map(Session::from).ok_or_else(|| session_not_found(id))
    }

    async fn block_session(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET is_blocked = true WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Update, e))?;

        if result.rows_affected() == 0 {
            return Err(session_not_found(id));
        }
        Ok(())
    }

    async fn touch_session(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE sessions SET last_activity = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Update, e))?;

        if result.rows_affected() == 0 {
            return Err(session_not_found(id));
        }
        Ok(())
    }

    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let sql = format!(
            "SELECT {} FROM sessions WHERE user_id = $1 ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SessionRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Query, e))?;
        Ok(rows.into_iter().map(Session::from).collect())
    }

    async fn block_user_sessions(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sessions SET is_blocked = true WHERE user_id = $1 AND is_blocked = false",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx(StorageOperation::Update, e))?;

        Ok(result.rows_affected())
    }

    async fn rotate_session(
        &self,
        old_id: Uuid,
        new: NewSession,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        // Use a transaction for atomic rotation
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Transaction, e))?;

        // A concurrent rotation holding the row lock makes this wait, then
        // match nothing once it commits
        let blocked = sqlx::query(
            "UPDATE sessions SET is_blocked = true WHERE id = $1 AND is_blocked = false",
        )
        .bind(old_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::from_sqlx(StorageOperation::Update, e))?;

        if blocked.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM sessions WHERE id = $1)")
                    .bind(old_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| StorageError::from_sqlx(StorageOperation::Query, e))?;
            return Err(if exists {
                Error::SessionInvalid(SessionRejection::Blocked)
            } else {
                session_not_found(old_id)
            });
        }

        let row = sqlx::query_as::<_, SessionRow>(INSERT_SESSION)
            .bind(new.id)
            .bind(new.user_id)
            .bind(new.space_id)
            .bind(&new.username)
            .bind(&new.refresh_token)
            .bind(&new.user_agent)
            .bind(new.ip_address.map(|ip| ip.to_string()))
            .bind(now)
            .bind(new.expires_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Insert, e))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Transaction, e))?;

        Ok(row.into())
    }
}

#[async_trait]
impl LoginAttemptStorage for PgStore {
    async fn create_login_attempt(&self, attempt: NewLoginAttempt) -> Result<LoginAttempt> {
        let attempt = attempt.into_attempt();
        sqlx::query(
            r#"
            INSERT INTO login_attempts (id, username, ip_address, user_agent, success, attempted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(attempt.id)
        .bind(&attempt.username)
        .bind(attempt.ip_address.to_string())
        .bind(&attempt.user_agent)
        .bind(attempt.success)
        .bind(attempt.attempted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx(StorageOperation::Insert, e))?;

        Ok(attempt)
    }

    async fn count_recent_failed_login_attempts(
        &self,
        key: &AttemptKey,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<u64> {
        let (column, value) = key_column(key);
        let sql = format!(
            "SELECT COUNT(*) FROM login_attempts \
             WHERE {} = $1 AND success = false AND attempted_at >= $2 AND attempted_at <= $3",
            column
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(value)
            .bind(since)
            .bind(until)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Query, e))?;

        Ok(count.max(0) as u64)
    }

    async fn recent_login_attempts(
        &self,
        key: &AttemptKey,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LoginAttempt>> {
        let (column, value) = key_column(key);
        let sql = format!(
            "SELECT {} FROM login_attempts WHERE {} = $1 AND attempted_at >= $2 \
             ORDER BY attempted_at DESC LIMIT $3",
            ATTEMPT_COLUMNS, column
        );
        let rows = sqlx::query_as::<_, AttemptRow>(&sql)
            .bind(value)
            .bind(since)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Query, e))?;

        rows.into_iter()
            .map(|row| LoginAttempt::try_from(row).map_err(Error::from))
            .collect()
    }

    async fn cleanup_old_login_attempts(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE attempted_at < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::from_sqlx(StorageOperation::Delete, e))?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AuditStorage for PgStore {
    async fn create_audit_log(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (
                id, admin_user_id, action, resource_type, resource_id, details, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.admin_user_id)
        .bind(entry.action.as_str())
        .bind(&entry.resource_type)
        .bind(entry.resource_id)
        .bind(&entry.details)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx(StorageOperation::Insert, e))?;

        Ok(())
    }

    async fn recent_audit_logs(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, admin_user_id, action, resource_type, resource_id, details, created_at
            FROM audit_logs
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::from_sqlx(StorageOperation::Query, e))?;

        rows.into_iter()
            .map(|row| AuditEntry::try_from(row).map_err(Error::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_key_column() {
        assert_eq!(
            key_column(&AttemptKey::Username("ada@example.com".into())),
            ("username", "ada@example.com".to_string())
        );
        assert_eq!(
            key_column(&AttemptKey::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))),
            ("ip_address", "10.0.0.1".to_string())
        );
    }

    #[test]
    fn test_attempt_row_rejects_bad_ip() {
        let row = AttemptRow {
            id: Uuid::new_v4(),
            username: "ada@example.com".into(),
            ip_address: "not-an-ip".into(),
            user_agent: None,
            success: false,
            attempted_at: Utc::now(),
        };
        let err = LoginAttempt::try_from(row).expect_err("bad ip");
        assert_eq!(err.kind, StorageErrorKind::TypeConversion);
    }

    #[test]
    fn test_session_row_tolerates_bad_ip() {
        let now = Utc::now();
        let row = SessionRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            space_id: Uuid::new_v4(),
            username: "ada".into(),
            refresh_token: "t".into(),
            user_agent: "curl/8".into(),
            ip_address: Some("garbage".into()),
            is_blocked: false,
            last_activity: now,
            expires_at: now,
            created_at: now,
        };
        assert_eq!(Session::from(row).ip_address, None);
    }
}
