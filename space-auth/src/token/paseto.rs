//! PASETO v4.local token maker
//!
//! Payloads are JSON encrypted and authenticated with XChaCha20 and
//! BLAKE2b-MAC under a 32-byte key derived from the configured secret.

use std::sync::Arc;

use chrono::Duration;
use rusty_paseto::core::{
    Footer, ImplicitAssertion, Key, Local, Paseto, PasetoNonce, PasetoSymmetricKey, Payload, V4,
};
use uuid::Uuid;

use super::{TokenKind, TokenMaker, TokenPayload};
use crate::clock::Clock;
use crate::error::{Error, Result};

/// Minimum accepted length of the configured secret, in bytes
pub const MIN_SYMMETRIC_KEY_LEN: usize = 32;

const KEY_DERIVATION_CONTEXT: &str = "space-auth 2024 paseto v4.local token key";

/// Token maker backed by PASETO v4.local
#[derive(Clone)]
pub struct PasetoMaker {
    key_bytes: [u8; 32],
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PasetoMaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasetoMaker").finish_non_exhaustive()
    }
}

impl PasetoMaker {
    /// Create a maker from a shared secret
    ///
    /// The secret must be at least [`MIN_SYMMETRIC_KEY_LEN`] bytes. The
    /// encryption key is derived from it deterministically.
    pub fn new(secret: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        if secret.len() < MIN_SYMMETRIC_KEY_LEN {
            return Err(Error::Config(Box::new(figment::Error::from(format!(
                "symmetric key must be at least {} characters, got {}",
                MIN_SYMMETRIC_KEY_LEN,
                secret.len()
            )))));
        }

        Ok(Self {
            key_bytes: blake3::derive_key(KEY_DERIVATION_CONTEXT, secret.as_bytes()),
            clock,
        })
    }

    fn key(&self) -> PasetoSymmetricKey<V4, Local> {
        PasetoSymmetricKey::<V4, Local>::from(Key::from(&self.key_bytes))
    }
}

impl TokenMaker for PasetoMaker {
    fn create_token(
        &self,
        kind: TokenKind,
        user_id: Uuid,
        username: &str,
        space_id: Uuid,
        duration: Duration,
    ) -> Result<(String, TokenPayload)> {
        let payload =
            TokenPayload::new(kind, user_id, username, space_id, self.clock.now(), duration);

        let json = serde_json::to_string(&payload)
            .map_err(|e| Error::TokenCreationFailed(format!("Failed to serialize payload: {}", e)))?;

        let nonce_bytes: [u8; 32] = rand::random();
        let nonce_key = Key::<32>::from(&nonce_bytes);
        let nonce = PasetoNonce::<V4, Local>::from(&nonce_key);

        let token = Paseto::<V4, Local>::default()
            .set_payload(Payload::from(json.as_str()))
            .try_encrypt(&self.key(), &nonce)
            .map_err(|e| Error::TokenCreationFailed(format!("Failed to encrypt token: {}", e)))?;

        Ok((token, payload))
    }

    fn verify_token(&self, token: &str) -> Result<TokenPayload> {
        let json = Paseto::<V4, Local>::try_decrypt(
            token,
            &self.key(),
            None::<Footer>,
            None::<ImplicitAssertion>,
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Token failed authentication");
            Error::TokenInvalidSignature
        })?;

        let payload: TokenPayload = serde_json::from_str(&json).map_err(|e| {
            tracing::debug!(error = %e, "Token payload is malformed");
            Error::TokenInvalidSignature
        })?;

        if payload.is_expired_at(self.clock.now()) {
            return Err(Error::TokenExpired);
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn maker() -> (PasetoMaker, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let maker = PasetoMaker::new(SECRET, Arc::new(clock.clone())).expect("valid key");
        (maker, clock)
    }

    #[test]
    fn test_rejects_short_secret() {
        let result = PasetoMaker::new("too-short", Arc::new(ManualClock::default()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_round_trip() {
        let (maker, _) = maker();
        let user = Uuid::new_v4();
        let space = Uuid::new_v4();

        let (token, payload) = maker
            .create_token(TokenKind::Access, user, "ada", space, Duration::minutes(15))
            .expect("token");
        assert!(token.starts_with("v4.local."));

        let verified = maker.verify_token(&token).expect("verify");
        assert_eq!(verified, payload);
        assert_eq!(verified.user_id, user);
        assert_eq!(verified.space_id, space);
        assert_eq!(verified.username, "ada");
        assert_eq!(verified.kind, TokenKind::Access);
    }

    #[test]
    fn test_kind_survives_encryption() {
        let (maker, _) = maker();
        let (token, _) = maker
            .create_token(TokenKind::Refresh, Uuid::new_v4(), "ada", Uuid::new_v4(), Duration::hours(1))
            .expect("token");
        let verified = maker.verify_token(&token).expect("verify");
        assert_eq!(verified.kind, TokenKind::Refresh);
        assert!(verified.require_kind(TokenKind::Access).is_err());
    }

    #[test]
    fn test_independent_makers_share_tokens() {
        let clock = Arc::new(ManualClock::default());
        let a = PasetoMaker::new(SECRET, clock.clone()).expect("maker a");
        let b = PasetoMaker::new(SECRET, clock).expect("maker b");

        let (token, payload) = a
            .create_token(TokenKind::Access, Uuid::new_v4(), "ada", Uuid::new_v4(), Duration::minutes(5))
            .expect("token");
        assert_eq!(b.verify_token(&token).expect("verify"), payload);
    }

    #[test]
    fn test_expired_token() {
        let (maker, clock) = maker();
        let (token, _) = maker
            .create_token(TokenKind::Access, Uuid::new_v4(), "ada", Uuid::new_v4(), Duration::minutes(15))
            .expect("token");

        clock.advance(Duration::minutes(15));
        assert!(maker.verify_token(&token).is_ok());

        clock.advance(Duration::seconds(1));
        assert!(matches!(maker.verify_token(&token), Err(Error::TokenExpired)));
    }

    #[test]
    fn test_wrong_key_is_invalid_even_when_expired() {
        let (maker, clock) = maker();
        let other = PasetoMaker::new(
            "fedcba9876543210fedcba9876543210",
            Arc::new(clock.clone()),
        )
        .expect("maker");

        let (token, _) = other
            .create_token(TokenKind::Access, Uuid::new_v4(), "ada", Uuid::new_v4(), Duration::minutes(1))
            .expect("token");
        assert!(matches!(
            maker.verify_token(&token),
            Err(Error::TokenInvalidSignature)
        ));

        clock.advance(Duration::hours(1));
        assert!(matches!(
            maker.verify_token(&token),
            Err(Error::TokenInvalidSignature)
        ));
    }

    #[test]
    fn test_tampered_token_is_rejected() {
        let (maker, _) = maker();
        let (token, _) = maker
            .create_token(TokenKind::Access, Uuid::new_v4(), "ada", Uuid::new_v4(), Duration::minutes(15))
            .expect("token");

        // The final base64 character may carry padding bits, so it is skipped.
        for index in 0..token.len() - 1 {
            let mut bytes = token.clone().into_bytes();
            bytes[index] = if bytes[index] == b'A' { b'B' } else { b'A' };
            let tampered = String::from_utf8(bytes).expect("ascii token");

            assert!(
                matches!(maker.verify_token(&tampered), Err(Error::TokenInvalidSignature)),
                "tampering at byte {} was not detected",
                index
            );
        }
    }

    #[test]
    fn test_garbage_is_invalid() {
        let (maker, _) = maker();
        assert!(matches!(maker.verify_token(""), Err(Error::TokenInvalidSignature)));
        assert!(matches!(
            maker.verify_token("v4.local.not-a-token"),
            Err(Error::TokenInvalidSignature)
        ));
    }
}
