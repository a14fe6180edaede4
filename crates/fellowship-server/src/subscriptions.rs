//! Subscription snapshot intake and caching.
//!
//! Verifies `SubscriptionToken`s issued by the payment server using
//! ed25519-dalek, stores the snapshot, and caches the signature so a client
//! re-presenting the same token skips both the cryptographic check and the
//! database write.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use fellowship_shared::entitlement;
use fellowship_shared::tokens::SubscriptionToken;
use fellowship_shared::{FeatureSet, Rejection, Subscription, SubscriptionStatus, Tier, UserId};
use fellowship_store::{Database, StoreError};

// ---------------------------------------------------------------------------
// Cached entry
// ---------------------------------------------------------------------------

/// A recently stored snapshot.
#[derive(Debug, Clone)]
struct CachedSnapshot {
    /// Signature of the token that produced it.
    signature: Vec<u8>,
    subscription: Subscription,
}

impl CachedSnapshot {
    /// Entries are dropped once the billing period they describe is over.
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.subscription.period_end
    }
}

// ---------------------------------------------------------------------------
// Verifier
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SubscriptionVerifier {
    /// The payment server's Ed25519 public key.
    server_pubkey: [u8; 32],
    db: Arc<Database>,
    /// Cache: user -> last stored snapshot.
    cache: Arc<RwLock<HashMap<UserId, CachedSnapshot>>>,
}

impl SubscriptionVerifier {
    pub fn new(server_pubkey: [u8; 32], db: Arc<Database>) -> Self {
        Self {
            server_pubkey,
            db,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Verify a snapshot token and store it as the user's current
    /// subscription. Returns the user's entitlements afterwards.
    ///
    /// A snapshot older than the one already stored is accepted but ignored.
    pub async fn record(&self, token: &SubscriptionToken) -> Result<FeatureSet, Rejection> {
        let now = Utc::now();
        let user = token.subscription.user;

        // 1. Check the cache first.
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&user) {
                if entry.signature == token.signature && entry.is_fresh(now) {
                    debug!(user = %user, "subscription snapshot served from cache");
                    return Ok(entitlement::resolve(Some(&entry.subscription), now));
                }
            }
        }

        // 2. Perform full cryptographic verification.
        let subscription = token
            .verify_with_key(&self.server_pubkey)
            .map_err(|e| {
                debug!(user = %user, error = %e, "subscription token rejected");
                Rejection::forbidden(format!("subscription token rejected: {e}"))
            })?
            .clone();

        // 3. Store, keeping whichever snapshot was issued last.
        let stored = self.store(subscription, token.issued_at).await?;

        // 4. Update the cache.
        {
            let mut cache = self.cache.write().await;
            cache.insert(
                user,
                CachedSnapshot {
                    signature: token.signature.clone(),
                    subscription: stored.clone(),
                },
            );
        }

        Ok(entitlement::resolve(Some(&stored), now))
    }

    /// Grant `tier` for `days` (admin action for self-hosted instances).
    pub async fn admin_grant(&self, user: UserId, tier: Tier, days: i64) -> Result<(), Rejection> {
        let now = Utc::now();
        let period_end = Duration::try_days(days)
            .filter(|d| *d > Duration::zero())
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| Rejection::invalid(format!("cannot grant for {days} days")))?;
        let subscription = Subscription {
            user,
            tier,
            status: SubscriptionStatus::Active,
            period_start: now,
            period_end,
        };
        self.store(subscription, now).await?;
        self.cache.write().await.remove(&user);
        Ok(())
    }

    /// End a user's subscription now (admin action for self-hosted
    /// instances). Stored as a canceled snapshot so an older token cannot
    /// restore access.
    pub async fn admin_revoke(&self, user: UserId) -> Result<(), Rejection> {
        let now = Utc::now();
        let subscription = Subscription {
            user,
            tier: Tier::Free,
            status: SubscriptionStatus::Canceled,
            period_start: now,
            period_end: now,
        };
        self.store(subscription, now).await?;
        self.cache.write().await.remove(&user);
        Ok(())
    }

    /// Number of cached snapshots.
    pub async fn cached(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Evict expired entries from the cache.
    pub async fn purge_expired(&self) {
        let now = Utc::now();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh(now));
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "Purged expired subscription cache entries");
        }
    }

    /// Upsert a snapshot and return whichever one is current afterwards.
    async fn store(&self, subscription: Subscription, issued_at: DateTime<Utc>) -> Result<Subscription, Rejection> {
        let db = self.db.clone();
        let user = subscription.user;

        let outcome = tokio::task::spawn_blocking(move || {
            db.write(|tx| {
                let applied = tx.upsert_subscription(&subscription, issued_at)?;
                let current = tx.subscription_for(user)?.ok_or(StoreError::NotFound)?;
                Ok::<_, StoreError>((applied, current))
            })
        })
        .await;

        match outcome {
            Ok(Ok((applied, current))) => {
                if applied {
                    info!(
                        user = %user,
                        tier = %current.tier,
                        until = %current.period_end,
                        "Subscription snapshot recorded"
                    );
                }
                Ok(current)
            }
            Ok(Err(e)) => {
                error!(error = %e, "failed to store subscription snapshot");
                Err(Rejection::unavailable("storage unavailable, try again"))
            }
            Err(e) => {
                error!(error = %e, "subscription storage task failed");
                Err(Rejection::unavailable("storage unavailable, try again"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use fellowship_shared::{ErrorKind, Feature};
    use rand::rngs::OsRng;

    fn snapshot(user: UserId, tier: Tier, status: SubscriptionStatus) -> Subscription {
        let now = Utc::now();
        Subscription {
            user,
            tier,
            status,
            period_start: now - Duration::days(1),
            period_end: now + Duration::days(30),
        }
    }

    fn verifier(key: &SigningKey) -> SubscriptionVerifier {
        let db = Arc::new(Database::open_in_memory().unwrap());
        SubscriptionVerifier::new(key.verifying_key().to_bytes(), db)
    }

    #[tokio::test]
    async fn test_record_valid_token() {
        let server_key = SigningKey::generate(&mut OsRng);
        let verifier = verifier(&server_key);
        let user = UserId::new();

        let token = SubscriptionToken::create(
            snapshot(user, Tier::Premium, SubscriptionStatus::Active),
            Utc::now(),
            &server_key,
        );

        let features = verifier.record(&token).await.unwrap();
        assert!(features.contains(Feature::MediaMessages));
        assert_eq!(verifier.cached().await, 1);

        // Second call is served from cache.
        let again = verifier.record(&token).await.unwrap();
        assert_eq!(again.tier, Tier::Premium);
    }

    #[tokio::test]
    async fn test_record_wrong_key() {
        let server_key = SigningKey::generate(&mut OsRng);
        let wrong_key = SigningKey::generate(&mut OsRng);
        let verifier = verifier(&server_key);

        let token = SubscriptionToken::create(
            snapshot(UserId::new(), Tier::Family, SubscriptionStatus::Active),
            Utc::now(),
            &wrong_key,
        );

        let err = verifier.record(&token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert_eq!(verifier.cached().await, 0);
    }

    #[tokio::test]
    async fn test_replayed_old_token_does_not_restore_access() {
        let server_key = SigningKey::generate(&mut OsRng);
        let verifier = verifier(&server_key);
        let user = UserId::new();
        let now = Utc::now();

        let active = SubscriptionToken::create(
            snapshot(user, Tier::Premium, SubscriptionStatus::Active),
            now - Duration::hours(2),
            &server_key,
        );
        let canceled = SubscriptionToken::create(
            snapshot(user, Tier::Premium, SubscriptionStatus::Canceled),
            now - Duration::hours(1),
            &server_key,
        );

        verifier.record(&canceled).await.unwrap();
        let features = verifier.record(&active).await.unwrap();
        assert_eq!(features.tier, Tier::Free);
    }

    #[tokio::test]
    async fn test_admin_grant_out_of_range() {
        let server_key = SigningKey::generate(&mut OsRng);
        let verifier = verifier(&server_key);
        let user = UserId::new();

        for days in [1_000_000_000, i64::MAX, 0, -3] {
            let err = verifier.admin_grant(user, Tier::Premium, days).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument);
        }
        let stored = verifier.db.read(|tx| tx.subscription_for(user)).unwrap();
        assert!(stored.is_none());
    }

    #[tokio::test]
    async fn test_admin_grant_and_revoke() {
        let server_key = SigningKey::generate(&mut OsRng);
        let verifier = verifier(&server_key);
        let user = UserId::new();

        verifier.admin_grant(user, Tier::Family, 30).await.unwrap();
        let stored = verifier
            .db
            .read(|tx| tx.subscription_for(user))
            .unwrap()
            .unwrap();
        assert_eq!(stored.effective_tier(Utc::now()), Tier::Family);

        verifier.admin_revoke(user).await.unwrap();
        let stored = verifier
            .db
            .read(|tx| tx.subscription_for(user))
            .unwrap()
            .unwrap();
        assert_eq!(stored.effective_tier(Utc::now()), Tier::Free);
    }
}
