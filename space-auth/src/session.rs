//! Server-side sessions backing refresh tokens

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::token::TokenPayload;

/// One authenticated device or browser login
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    /// Session id, equal to the refresh token's payload id
    pub id: Uuid,
    /// Owning user
    pub user_id: Uuid,
    /// Tenant
    pub space_id: Uuid,
    /// Username at login time
    pub username: String,
    /// Refresh token bound to this session
    #[serde(skip_serializing)]
    pub refresh_token: String,
    /// Client user agent
    pub user_agent: String,
    /// Client address, when known
    pub ip_address: Option<IpAddr>,
    /// Revoked by logout or an admin
    pub is_blocked: bool,
    /// Last successful login or refresh
    pub last_activity: DateTime<Utc>,
    /// Fixed at creation and never extended
    pub expires_at: DateTime<Utc>,
    /// When the row was inserted
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Build the row for a new session; the store stamps activity and creation
    pub fn from_new(new: NewSession, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            user_id: new.user_id,
            space_id: new.space_id,
            username: new.username,
            refresh_token: new.refresh_token,
            user_agent: new.user_agent,
            ip_address: new.ip_address,
            is_blocked: false,
            last_activity: now,
            expires_at: new.expires_at,
            created_at: now,
        }
    }

    /// Whether the session has passed its fixed expiry
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether the session may still be refreshed at `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_blocked && !self.is_expired_at(now)
    }
}

/// Input for creating a session
#[derive(Debug, Clone)]
pub struct NewSession {
    /// Session id, taken from the refresh token payload
    pub id: Uuid,
    /// Owning user
    pub user_id: Uuid,
    /// Tenant
    pub space_id: Uuid,
    /// Username at login time
    pub username: String,
    /// Refresh token bound to this session
    pub refresh_token: String,
    /// Client user agent
    pub user_agent: String,
    /// Client address, when known
    pub ip_address: Option<IpAddr>,
    /// Fixed expiry
    pub expires_at: DateTime<Utc>,
}

impl NewSession {
    /// Session for a freshly issued refresh token
    pub fn for_refresh_token(
        token: &str,
        payload: &TokenPayload,
        user_agent: impl Into<String>,
        ip_address: Option<IpAddr>,
    ) -> Self {
        Self {
            id: payload.id,
            user_id: payload.user_id,
            space_id: payload.space_id,
            username: payload.username.clone(),
            refresh_token: token.to_string(),
            user_agent: user_agent.into(),
            ip_address,
            expires_at: payload.expired_at,
        }
    }
}

/// Why a refresh was refused
///
/// Logged internally; callers only ever see `Error::SessionInvalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejection {
    /// No session with the token's id
    Unknown,
    /// Session was logged out or revoked
    Blocked,
    /// Session belongs to a different user than the token
    UserMismatch,
    /// Stored refresh token differs from the presented one
    TokenMismatch,
    /// Session is past its expiry
    Expired,
}

impl fmt::Display for SessionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Blocked => "blocked",
            Self::UserMismatch => "user_mismatch",
            Self::TokenMismatch => "token_mismatch",
            Self::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Decide whether `session` may be refreshed with `presented` token
pub fn check_refreshable(
    session: &Session,
    payload: &TokenPayload,
    presented: &str,
    now: DateTime<Utc>,
) -> Result<(), SessionRejection> {
    if session.is_blocked {
        return Err(SessionRejection::Blocked);
    }
    if session.user_id != payload.user_id {
        return Err(SessionRejection::UserMismatch);
    }
    if session.refresh_token != presented {
        return Err(SessionRejection::TokenMismatch);
    }
    if session.is_expired_at(now) {
        return Err(SessionRejection::Expired);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenKind;
    use chrono::Duration;

    fn fixture(now: DateTime<Utc>) -> (Session, TokenPayload) {
        let payload = TokenPayload::new(
            TokenKind::Refresh,
            Uuid::new_v4(),
            "ada",
            Uuid::new_v4(),
            now,
            Duration::hours(24),
        );
        let new = NewSession::for_refresh_token("refresh-token", &payload, "curl/8", None);
        (Session::from_new(new, now), payload)
    }

    #[test]
    fn test_new_session_takes_identity_from_payload() {
        let now = Utc::now();
        let (session, payload) = fixture(now);
        assert_eq!(session.id, payload.id);
        assert_eq!(session.expires_at, payload.expired_at);
        assert_eq!(session.last_activity, now);
        assert!(!session.is_blocked);
    }

    #[test]
    fn test_accepts_matching_session() {
        let now = Utc::now();
        let (session, payload) = fixture(now);
        assert_eq!(check_refreshable(&session, &payload, "refresh-token", now), Ok(()));
    }

    #[test]
    fn test_rejection_reasons() {
        let now = Utc::now();
        let (session, payload) = fixture(now);

        let mut blocked = session.clone();
        blocked.is_blocked = true;
        assert_eq!(
            check_refreshable(&blocked, &payload, "refresh-token", now),
            Err(SessionRejection::Blocked)
        );

        let mut other_user = payload.clone();
        other_user.user_id = Uuid::new_v4();
        assert_eq!(
            check_refreshable(&session, &other_user, "refresh-token", now),
            Err(SessionRejection::UserMismatch)
        );

        assert_eq!(
            check_refreshable(&session, &payload, "some-other-token", now),
            Err(SessionRejection::TokenMismatch)
        );

        assert_eq!(
            check_refreshable(&session, &payload, "refresh-token", now + Duration::hours(25)),
            Err(SessionRejection::Expired)
        );
    }

    #[test]
    fn test_serialized_session_omits_refresh_token() {
        let (session, _) = fixture(Utc::now());
        let json = serde_json::to_value(&session).expect("serialize");
        assert!(json.get("refresh_token").is_none());
        assert_eq!(json["username"], "ada");
    }
}
