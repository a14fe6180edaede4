//! Bearer session verification.
//!
//! Session tokens are issued by the identity platform and signed with its
//! Ed25519 key. A request without a valid token is anonymous; the gateway
//! turns that into `Unauthenticated`.

use chrono::{DateTime, Utc};
use tracing::debug;

use fellowship_shared::error::TokenError;
use fellowship_shared::tokens::SessionToken;
use fellowship_shared::UserId;

pub struct IdentityVerifier {
    /// The identity platform's Ed25519 public key.
    server_pubkey: [u8; 32],
}

impl IdentityVerifier {
    pub fn new(server_pubkey: [u8; 32]) -> Self {
        Self { server_pubkey }
    }

    /// Verify an encoded session token.
    pub fn verify(&self, encoded: &str, now: DateTime<Utc>) -> Result<UserId, TokenError> {
        let token = SessionToken::decode(encoded.trim())?;
        token.verify_with_key(&self.server_pubkey, now)
    }

    /// Resolve an `Authorization` header value to a user. Missing, malformed,
    /// forged and expired credentials all yield `None`.
    pub fn authenticate(&self, authorization: Option<&str>, now: DateTime<Utc>) -> Option<UserId> {
        let header = authorization?;
        let encoded = header.strip_prefix("Bearer ").unwrap_or(header);
        match self.verify(encoded, now) {
            Ok(user) => Some(user),
            Err(e) => {
                debug!(error = %e, "session token rejected");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn accepts_valid_bearer() {
        let key = SigningKey::generate(&mut OsRng);
        let verifier = IdentityVerifier::new(key.verifying_key().to_bytes());
        let user = UserId::new();
        let token = SessionToken::create(user, Utc::now() + Duration::hours(1), &key).encode();

        let header = format!("Bearer {token}");
        assert_eq!(verifier.authenticate(Some(&header), Utc::now()), Some(user));
    }

    #[test]
    fn rejects_expired_forged_and_missing() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let verifier = IdentityVerifier::new(key.verifying_key().to_bytes());
        let user = UserId::new();
        let now = Utc::now();

        let expired = SessionToken::create(user, now - Duration::minutes(1), &key).encode();
        assert!(matches!(verifier.verify(&expired, now), Err(TokenError::Expired)));

        let forged = SessionToken::create(user, now + Duration::hours(1), &other).encode();
        assert!(verifier.authenticate(Some(&forged), now).is_none());

        assert!(verifier.authenticate(Some("Bearer not-a-token"), now).is_none());
        assert!(verifier.authenticate(None, now).is_none());
    }
}
