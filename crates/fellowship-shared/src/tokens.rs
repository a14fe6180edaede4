use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::entitlement::Subscription;
use crate::error::TokenError;
use crate::types::UserId;

// Token signed by the identity platform, presented as a bearer credential
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub user: UserId,
    pub valid_until: DateTime<Utc>,
    pub signature: Vec<u8>,
}

// Snapshot signed by the payment provider, pushed to us on every plan change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionToken {
    pub subscription: Subscription,
    /// Lets the store ignore a replayed older snapshot.
    pub issued_at: DateTime<Utc>,
    pub signature: Vec<u8>,
}

fn session_payload(user: &UserId, valid_until: DateTime<Utc>) -> Vec<u8> {
    // payload = user uuid bytes || valid_until (rfc3339)
    let mut payload = Vec::new();
    payload.extend_from_slice(user.0.as_bytes());
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

fn subscription_payload(sub: &Subscription, issued_at: DateTime<Utc>) -> Vec<u8> {
    let start = sub.period_start.to_rfc3339();
    let end = sub.period_end.to_rfc3339();
    let issued = issued_at.to_rfc3339();

    let mut payload = Vec::new();
    payload.extend_from_slice(sub.user.0.as_bytes());
    for part in [
        sub.tier.as_str(),
        sub.status.as_str(),
        start.as_str(),
        end.as_str(),
        issued.as_str(),
    ] {
        payload.push(b'|');
        payload.extend_from_slice(part.as_bytes());
    }
    payload
}

fn verify_with_key(payload: &[u8], signature: &[u8], key: &[u8; 32]) -> Result<(), TokenError> {
    let verifying_key = VerifyingKey::from_bytes(key).map_err(|_| TokenError::InvalidKey)?;
    let signature = Signature::from_slice(signature).map_err(|_| TokenError::InvalidSignature)?;
    verifying_key
        .verify(payload, &signature)
        .map_err(|_| TokenError::InvalidSignature)
}

impl SessionToken {
    pub fn create(user: UserId, valid_until: DateTime<Utc>, identity_key: &SigningKey) -> Self {
        let signature = identity_key.sign(&session_payload(&user, valid_until));
        Self {
            user,
            valid_until,
            signature: signature.to_bytes().to_vec(),
        }
    }

    pub fn verify_with_key(&self, key: &[u8; 32], now: DateTime<Utc>) -> Result<UserId, TokenError> {
        if now > self.valid_until {
            return Err(TokenError::Expired);
        }
        verify_with_key(
            &session_payload(&self.user, self.valid_until),
            &self.signature,
            key,
        )?;
        Ok(self.user)
    }

    /// Encode as a base64url string suitable for an `Authorization` header.
    pub fn encode(&self) -> String {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        // serializing a struct of plain fields cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(s: &str) -> Result<Self, TokenError> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;
        let bytes = URL_SAFE_NO_PAD
            .decode(s.trim())
            .map_err(|_| TokenError::InvalidFormat)?;
        serde_json::from_slice(&bytes).map_err(|_| TokenError::InvalidFormat)
    }
}

impl SubscriptionToken {
    pub fn create(
        subscription: Subscription,
        issued_at: DateTime<Utc>,
        payment_key: &SigningKey,
    ) -> Self {
        let signature = payment_key.sign(&subscription_payload(&subscription, issued_at));
        Self {
            subscription,
            issued_at,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Check the payment provider's signature. Expiry is not an error here:
    /// a lapsed snapshot is still a valid statement that the user is free.
    pub fn verify_with_key(&self, key: &[u8; 32]) -> Result<&Subscription, TokenError> {
        verify_with_key(
            &subscription_payload(&self.subscription, self.issued_at),
            &self.signature,
            key,
        )?;
        Ok(&self.subscription)
    }
}
