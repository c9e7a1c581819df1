//! Access and refresh token issuance
//!
//! Both token kinds share one payload shape and one [`TokenMaker`]. The
//! kind is a claim inside the encrypted payload, so one kind can never be
//! presented as the other. The access token is trusted on its own until it
//! expires; the refresh token is only honored while its session row is
//! usable.

mod paseto;

pub use paseto::{PasetoMaker, MIN_SYMMETRIC_KEY_LEN};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// What a token may be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    /// Bearer credential for API calls
    Access,
    /// Session handle exchanged at `/refresh`
    Refresh,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Access => f.write_str("access"),
            Self::Refresh => f.write_str("refresh"),
        }
    }
}

/// Claims carried inside a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Random token identifier; for refresh tokens this is also the session id
    pub id: Uuid,
    /// Access or refresh
    pub kind: TokenKind,
    /// Owning user
    pub user_id: Uuid,
    /// Username at issue time
    pub username: String,
    /// Tenant the user belongs to
    pub space_id: Uuid,
    /// When the token was issued
    pub issued_at: DateTime<Utc>,
    /// When the token stops being accepted
    pub expired_at: DateTime<Utc>,
}

impl TokenPayload {
    /// Build a payload with a fresh identifier, valid from `now` for `duration`
    pub fn new(
        kind: TokenKind,
        user_id: Uuid,
        username: impl Into<String>,
        space_id: Uuid,
        now: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id,
            username: username.into(),
            space_id,
            issued_at: now,
            expired_at: now + duration,
        }
    }

    /// Whether the payload is past its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expired_at
    }

    /// Refuse a token of the other kind
    ///
    /// The mismatch is reported as an invalid token.
    pub fn require_kind(&self, expected: TokenKind) -> Result<()> {
        if self.kind != expected {
            tracing::debug!(expected = %expected, presented = %self.kind, "Token of wrong kind");
            return Err(Error::TokenInvalidSignature);
        }
        Ok(())
    }
}

/// Stateless token issuer and verifier
///
/// Implementations hold only key material. Two makers built from the same
/// key accept each other's tokens.
pub trait TokenMaker: Send + Sync + 'static {
    /// Issue a token of `kind` valid for `duration`
    fn create_token(
        &self,
        kind: TokenKind,
        user_id: Uuid,
        username: &str,
        space_id: Uuid,
        duration: Duration,
    ) -> Result<(String, TokenPayload)>;

    /// Authenticate a token and return its payload
    ///
    /// Authentication failure is reported as `TokenInvalidSignature` before
    /// expiry is considered; an authentic but stale token is `TokenExpired`.
    fn verify_token(&self, token: &str) -> Result<TokenPayload>;
}
