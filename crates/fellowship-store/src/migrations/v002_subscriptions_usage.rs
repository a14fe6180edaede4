use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Latest snapshot per user as delivered by the payment provider.
-- One row per user, so at most one active subscription each.
CREATE TABLE IF NOT EXISTS subscriptions (
    user_id      TEXT PRIMARY KEY NOT NULL,
    tier         TEXT NOT NULL,              -- free | premium | family
    status       TEXT NOT NULL,              -- active | trialing | past_due | canceled | expired
    period_start TEXT NOT NULL,
    period_end   TEXT NOT NULL,
    issued_at    TEXT NOT NULL               -- provider's issue time, newest wins
);

-- Assistant questions asked per user per UTC day
CREATE TABLE IF NOT EXISTS assistant_usage (
    user_id TEXT NOT NULL,
    day     TEXT NOT NULL,                   -- YYYY-MM-DD
    count   INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (user_id, day)
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
