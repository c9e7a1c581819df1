//! Login, refresh and logout
//!
//! [`AuthService`] composes the token maker, attempt tracker, lock manager
//! and stores into the three session flows. It holds no mutable state of
//! its own; every decision is made against the store and the injected
//! clock.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attempts::LoginAttemptTracker;
use crate::audit::AuditLogger;
use crate::clock::Clock;
use crate::config::{Config, TokenConfig};
use crate::error::{Error, Result};
use crate::lockout::{AccountLockManager, AuditLockoutNotification};
use crate::password::PasswordHasher;
use crate::session::{check_refreshable, NewSession, Session, SessionRejection};
use crate::store::Stores;
use crate::token::{PasetoMaker, TokenKind, TokenMaker, TokenPayload};
use crate::user::{normalize_email, User, UserSummary};

/// Where a request came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientMeta {
    /// Client address as seen by the service
    pub ip_address: IpAddr,
    /// `User-Agent` header, if sent
    pub user_agent: Option<String>,
}

impl ClientMeta {
    /// Metadata for callers without a network origin
    pub fn unknown() -> Self {
        Self {
            ip_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            user_agent: None,
        }
    }

    fn user_agent_or_empty(&self) -> &str {
        self.user_agent.as_deref().unwrap_or("")
    }
}

/// Result of a successful login
#[derive(Debug, Clone, Serialize)]
pub struct LoginOutcome {
    /// Short-lived bearer token
    pub access_token: String,
    /// Access token expiry
    pub access_token_expires_at: DateTime<Utc>,
    /// Session-bound refresh token
    pub refresh_token: String,
    /// Refresh token and session expiry
    pub refresh_token_expires_at: DateTime<Utc>,
    /// Session created for this login
    pub session_id: Uuid,
    /// Authenticated user
    pub user: UserSummary,
}

/// Result of a successful refresh
#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    /// New access token
    pub access_token: String,
    /// New access token expiry
    pub access_token_expires_at: DateTime<Utc>,
    /// Replacement refresh token, only when rotation is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Replacement refresh token expiry, only when rotation is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token_expires_at: Option<DateTime<Utc>>,
}

/// Session flows for one deployment
#[derive(Clone)]
pub struct AuthService {
    stores: Stores,
    tokens: Arc<dyn TokenMaker>,
    hasher: PasswordHasher,
    tracker: LoginAttemptTracker,
    locks: AccountLockManager,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    token_config: TokenConfig,
    // Verified against when the email is unknown so both paths pay for Argon2
    decoy_hash: Arc<str>,
}

impl AuthService {
    /// Build every component from configuration over `stores`
    ///
    /// Lock and unlock transitions are forwarded to the audit log.
    pub fn new(config: &Config, stores: Stores, clock: Arc<dyn Clock>) -> Result<Self> {
        let tokens = PasetoMaker::new(&config.token.symmetric_key, clock.clone())?;
        Self::with_token_maker(config, stores, clock, Arc::new(tokens))
    }

    /// Build with a caller-supplied token maker
    pub fn with_token_maker(
        config: &Config,
        stores: Stores,
        clock: Arc<dyn Clock>,
        tokens: Arc<dyn TokenMaker>,
    ) -> Result<Self> {
        let hasher = PasswordHasher::new(&config.password)?;
        let decoy_hash: Arc<str> = hasher.decoy_hash()?.into();
        let audit = AuditLogger::new(stores.audit.clone(), clock.clone());
        let locks = AccountLockManager::new(stores.users.clone(), clock.clone(), config.lockout.clone())
            .with_notification(Arc::new(AuditLockoutNotification::new(audit.clone())));
        let tracker =
            LoginAttemptTracker::new(stores.attempts.clone(), clock.clone(), config.attempts.clone());

        Ok(Self {
            stores,
            tokens,
            hasher,
            tracker,
            locks,
            audit,
            clock,
            token_config: config.token.clone(),
            decoy_hash,
        })
    }

    /// Storage handles
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Account lock manager
    pub fn locks(&self) -> &AccountLockManager {
        &self.locks
    }

    /// Login attempt tracker
    pub fn tracker(&self) -> &LoginAttemptTracker {
        &self.tracker
    }

    /// Audit logger
    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Password hasher
    pub fn hasher(&self) -> &PasswordHasher {
        &self.hasher
    }

    /// Injected clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Authenticate an access token
    ///
    /// Refresh tokens are refused here even though they verify; they are
    /// only honored through their session row.
    pub fn authenticate(&self, access_token: &str) -> Result<TokenPayload> {
        let payload = self.tokens.verify_token(access_token)?;
        payload.require_kind(TokenKind::Access)?;
        Ok(payload)
    }

    /// Exchange email and password for a session
    ///
    /// A locked account is refused before the password is looked at. A
    /// wrong password and an unknown email are indistinguishable to the
    /// caller.
    pub async fn login(&self, email: &str, password: &str, client: &ClientMeta) -> Result<LoginOutcome> {
        let email = normalize_email(email);
        if email.is_empty() || !email.contains('@') {
            return Err(Error::ValidationError("a valid email is required".to_string()));
        }
        if password.is_empty() {
            return Err(Error::ValidationError("password is required".to_string()));
        }

        self.tracker
            .check_rate_limit(&email, client.ip_address)
            .await?;

        let Some(user) = self.stores.users.get_user_by_email(&email).await? else {
            debug!(ip = %client.ip_address, "Login for unknown email");
            // Same Argon2 cost as a known account; the outcome is irrelevant
            let _ = self.verify_password(&self.decoy_hash, password).await;
            self.record_attempt(&email, client, false).await;
            return Err(Error::InvalidCredentials);
        };

        self.locks.ensure_unlocked(&user)?;

        if !self.verify_password(&user.password_hash, password).await? {
            self.record_attempt(&email, client, false).await;
            let status = self.locks.record_failure(&user).await?;
            info!(
                user_id = %user.id,
                attempt_count = status.attempt_count,
                locked = status.locked,
                "Login failed"
            );
            return Err(Error::InvalidCredentials);
        }

        self.locks.record_success(&user).await?;
        let outcome = self.open_session(&user, client).await?;
        self.record_attempt(&email, client, true).await;

        info!(user_id = %user.id, session_id = %outcome.session_id, "Login succeeded");
        Ok(outcome)
    }

    /// Issue a new access token for a live session
    ///
    /// With rotation enabled the presented refresh token is retired and a
    /// replacement bound to a new session row is returned; the replacement
    /// keeps the original session expiry.
    pub async fn refresh(&self, refresh_token: &str, client: &ClientMeta) -> Result<RefreshOutcome> {
        if refresh_token.trim().is_empty() {
            return Err(Error::ValidationError("refresh_token is required".to_string()));
        }

        let payload = self.tokens.verify_token(refresh_token)?;
        payload.require_kind(TokenKind::Refresh)?;
        let session = self.load_session(payload.id).await?;
        let now = self.clock.now();

        check_refreshable(&session, &payload, refresh_token, now)
            .map_err(|reason| reject(session.id, reason))?;

        self.stores.sessions.touch_session(session.id, now).await?;

        let (access_token, access_payload) = self.tokens.create_token(
            TokenKind::Access,
            payload.user_id,
            &payload.username,
            payload.space_id,
            self.token_config.access_token_duration(),
        )?;

        let mut outcome = RefreshOutcome {
            access_token,
            access_token_expires_at: access_payload.expired_at,
            refresh_token: None,
            refresh_token_expires_at: None,
        };

        if self.token_config.rotate_refresh_tokens {
            let remaining = session.expires_at - now;
            let (new_token, new_payload) = self.tokens.create_token(
                TokenKind::Refresh,
                payload.user_id,
                &payload.username,
                payload.space_id,
                remaining,
            )?;
            let replacement = NewSession::for_refresh_token(
                &new_token,
                &new_payload,
                client.user_agent_or_empty(),
                Some(client.ip_address),
            );
            // A concurrent refresh that rotated first wins; this one is refused
            let rotated = self
                .stores
                .sessions
                .rotate_session(session.id, replacement, now)
                .await
                .map_err(|e| match e {
                    Error::SessionInvalid(reason) => reject(session.id, reason),
                    Error::NotFound(_) => reject(session.id, SessionRejection::Unknown),
                    other => other,
                })?;

            debug!(old_session_id = %session.id, session_id = %rotated.id, "Refresh token rotated");
            outcome.refresh_token = Some(new_token);
            outcome.refresh_token_expires_at = Some(rotated.expires_at);
        }

        debug!(session_id = %session.id, user_id = %payload.user_id, "Access token refreshed");
        Ok(outcome)
    }

    /// Block the session behind `refresh_token`
    ///
    /// The session must belong to `caller`. An expired refresh token means
    /// the session is already unusable, so logout succeeds without a write.
    /// Logging out twice succeeds.
    pub async fn logout(&self, caller: &TokenPayload, refresh_token: &str) -> Result<()> {
        if refresh_token.trim().is_empty() {
            return Err(Error::ValidationError("refresh_token is required".to_string()));
        }

        let payload = match self.tokens.verify_token(refresh_token) {
            Ok(payload) => payload,
            Err(Error::TokenExpired) => {
                debug!(user_id = %caller.user_id, "Logout with expired refresh token");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        payload.require_kind(TokenKind::Refresh)?;

        let session = self.load_session(payload.id).await?;
        if session.user_id != caller.user_id {
            return Err(reject(session.id, SessionRejection::UserMismatch));
        }
        if session.refresh_token != refresh_token {
            return Err(reject(session.id, SessionRejection::TokenMismatch));
        }

        self.stores.sessions.block_session(session.id).await?;
        info!(user_id = %caller.user_id, session_id = %session.id, "Session logged out");
        Ok(())
    }

    /// Block every session of the caller; returns sessions newly blocked
    pub async fn logout_all(&self, caller: &TokenPayload) -> Result<u64> {
        let revoked = self
            .stores
            .sessions
            .block_user_sessions(caller.user_id)
            .await?;
        info!(user_id = %caller.user_id, revoked, "All sessions logged out");
        Ok(revoked)
    }

    /// Sessions of the caller that can still be refreshed, newest first
    pub async fn list_sessions(&self, caller: &TokenPayload) -> Result<Vec<Session>> {
        let now = self.clock.now();
        let sessions = self
            .stores
            .sessions
            .list_user_sessions(caller.user_id)
            .await?;
        Ok(sessions.into_iter().filter(|s| s.is_active_at(now)).collect())
    }

    /// One session of the caller by id
    ///
    /// Another user's session is reported as not found.
    pub async fn get_session(&self, caller: &TokenPayload, session_id: Uuid) -> Result<Session> {
        let session = self.stores.sessions.get_session(session_id).await?;
        if session.user_id != caller.user_id {
            debug!(user_id = %caller.user_id, session_id = %session_id, "Session owned by another user");
            return Err(Error::NotFound(format!("session {}", session_id)));
        }
        Ok(session)
    }

    async fn open_session(&self, user: &User, client: &ClientMeta) -> Result<LoginOutcome> {
        let (access_token, access_payload) = self.tokens.create_token(
            TokenKind::Access,
            user.id,
            &user.username,
            user.space_id,
            self.token_config.access_token_duration(),
        )?;
        let (refresh_token, refresh_payload) = self.tokens.create_token(
            TokenKind::Refresh,
            user.id,
            &user.username,
            user.space_id,
            self.token_config.refresh_token_duration(),
        )?;

        let new_session = NewSession::for_refresh_token(
            &refresh_token,
            &refresh_payload,
            client.user_agent_or_empty(),
            Some(client.ip_address),
        );
        let session = self
            .stores
            .sessions
            .create_session(new_session, self.clock.now())
            .await?;

        Ok(LoginOutcome {
            access_token,
            access_token_expires_at: access_payload.expired_at,
            refresh_token,
            refresh_token_expires_at: refresh_payload.expired_at,
            session_id: session.id,
            user: user.summary(),
        })
    }

    async fn load_session(&self, id: Uuid) -> Result<Session> {
        match self.stores.sessions.get_session(id).await {
            Ok(session) => Ok(session),
            Err(Error::NotFound(_)) => Err(reject(id, SessionRejection::Unknown)),
            Err(e) => Err(e),
        }
    }

    // Argon2 is CPU-bound; keep it off the async workers
    async fn verify_password(&self, hash: &str, password: &str) -> Result<bool> {
        let hasher = self.hasher.clone();
        let hash = hash.to_string();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(|e| Error::Internal(format!("password verification task failed: {}", e)))?
    }

    async fn record_attempt(&self, username: &str, client: &ClientMeta, success: bool) {
        self.tracker
            .record_attempt(username, client.ip_address, client.user_agent.as_deref(), success)
            .await;
    }
}

fn reject(session_id: Uuid, reason: SessionRejection) -> Error {
    warn!(session_id = %session_id, reason = %reason, "Session rejected");
    Error::SessionInvalid(reason)
}
