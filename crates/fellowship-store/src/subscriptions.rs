//! Subscription snapshots and assistant usage counters.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension};

use fellowship_shared::{Subscription, UserId};

use crate::codec::{parse_label, parse_ts, parse_uuid, ts};
use crate::database::Txn;
use crate::error::Result;

impl Txn<'_> {
    /// Store a snapshot for a user unless a newer one is already stored.
    ///
    /// Returns `false` when the snapshot was older than the stored one and was
    /// ignored, so a replayed token cannot roll a cancellation back.
    pub fn upsert_subscription(&self, sub: &Subscription, issued_at: DateTime<Utc>) -> Result<bool> {
        let changed = self.conn().execute(
            "INSERT INTO subscriptions (user_id, tier, status, period_start, period_end, issued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                 tier = excluded.tier,
                 status = excluded.status,
                 period_start = excluded.period_start,
                 period_end = excluded.period_end,
                 issued_at = excluded.issued_at
             WHERE excluded.issued_at >= subscriptions.issued_at",
            params![
                sub.user.to_string(),
                sub.tier.as_str(),
                sub.status.as_str(),
                ts(sub.period_start),
                ts(sub.period_end),
                ts(issued_at),
            ],
        )?;

        if changed == 0 {
            tracing::debug!(user = %sub.user, issued = %issued_at, "stale subscription snapshot ignored");
            return Ok(false);
        }

        tracing::info!(
            user = %sub.user,
            tier = %sub.tier,
            status = sub.status.as_str(),
            until = %sub.period_end,
            "subscription snapshot stored"
        );
        Ok(true)
    }

    pub fn subscription_for(&self, user: UserId) -> Result<Option<Subscription>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT user_id, tier, status, period_start, period_end
                 FROM subscriptions WHERE user_id = ?1",
                params![user.to_string()],
                |row| {
                    let user_str: String = row.get(0)?;
                    let tier_str: String = row.get(1)?;
                    let status_str: String = row.get(2)?;
                    let start_str: String = row.get(3)?;
                    let end_str: String = row.get(4)?;
                    Ok(Subscription {
                        user: UserId(parse_uuid(0, &user_str)?),
                        tier: parse_label(1, &tier_str)?,
                        status: parse_label(2, &status_str)?,
                        period_start: parse_ts(3, &start_str)?,
                        period_end: parse_ts(4, &end_str)?,
                    })
                },
            )
            .optional()?)
    }

    /// Questions the user has asked on `day`.
    pub fn assistant_questions_on(&self, user: UserId, day: NaiveDate) -> Result<u32> {
        Ok(self
            .conn()
            .query_row(
                "SELECT count FROM assistant_usage WHERE user_id = ?1 AND day = ?2",
                params![user.to_string(), day.to_string()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0))
    }

    /// Count one more question for `day` and return the new total.
    pub fn record_assistant_question(&self, user: UserId, day: NaiveDate) -> Result<u32> {
        self.conn().execute(
            "INSERT INTO assistant_usage (user_id, day, count) VALUES (?1, ?2, 1)
             ON CONFLICT(user_id, day) DO UPDATE SET count = count + 1",
            params![user.to_string(), day.to_string()],
        )?;
        self.assistant_questions_on(user, day)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::Duration;
    use fellowship_shared::{SubscriptionStatus, Tier};

    #[test]
    fn snapshot_is_replaced_not_duplicated() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        let now = Utc::now();

        let mut sub = Subscription {
            user,
            tier: Tier::Premium,
            status: SubscriptionStatus::Active,
            period_start: now - Duration::days(1),
            period_end: now + Duration::days(30),
        };
        assert!(db.write(|tx| tx.upsert_subscription(&sub, now)).unwrap());

        sub.tier = Tier::Family;
        assert!(db
            .write(|tx| tx.upsert_subscription(&sub, now + Duration::seconds(1)))
            .unwrap());

        let stored = db.read(|tx| tx.subscription_for(user)).unwrap().unwrap();
        assert_eq!(stored.tier, Tier::Family);

        let rows: i64 = db
            .read(|tx| {
                Ok::<_, crate::StoreError>(tx.conn().query_row(
                    "SELECT COUNT(*) FROM subscriptions",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn older_snapshot_does_not_replace_newer() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        let now = Utc::now();

        let active = Subscription {
            user,
            tier: Tier::Premium,
            status: SubscriptionStatus::Active,
            period_start: now - Duration::days(1),
            period_end: now + Duration::days(30),
        };
        let canceled = Subscription {
            status: SubscriptionStatus::Canceled,
            ..active.clone()
        };

        db.write(|tx| tx.upsert_subscription(&canceled, now)).unwrap();
        let applied = db
            .write(|tx| tx.upsert_subscription(&active, now - Duration::hours(1)))
            .unwrap();
        assert!(!applied);

        let stored = db.read(|tx| tx.subscription_for(user)).unwrap().unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Canceled);
    }

    #[test]
    fn unknown_user_has_no_snapshot() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.read(|tx| tx.subscription_for(UserId::new())).unwrap().is_none());
    }

    #[test]
    fn usage_counts_per_day() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        let today = Utc::now().date_naive();
        let yesterday = today - Duration::days(1);

        db.write(|tx| tx.record_assistant_question(user, yesterday)).unwrap();
        assert_eq!(db.write(|tx| tx.record_assistant_question(user, today)).unwrap(), 1);
        assert_eq!(db.write(|tx| tx.record_assistant_question(user, today)).unwrap(), 2);
        assert_eq!(db.read(|tx| tx.assistant_questions_on(user, yesterday)).unwrap(), 1);
    }
}
