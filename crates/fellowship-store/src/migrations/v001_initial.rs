//! v001 -- Initial schema creation.
//!
//! Creates the four core tables: `groups`, `memberships`, `invitations` and
//! `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Groups
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS groups (
    id              TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    name            TEXT NOT NULL,
    description     TEXT,
    visibility      TEXT NOT NULL,               -- public | private | invite_only
    owner_id        TEXT,                        -- UUID, NULL once deleted
    invite_code     TEXT UNIQUE,
    member_count    INTEGER NOT NULL DEFAULT 0,
    is_premium_only INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    next_seq        INTEGER NOT NULL DEFAULT 1,  -- next message ordering key
    created_at      TEXT NOT NULL,               -- RFC-3339, fixed width
    updated_at      TEXT NOT NULL,
    deleted_at      TEXT,

    CHECK (visibility IN ('public', 'private', 'invite_only')),
    CHECK (member_count >= 0),
    CHECK (deleted_at IS NOT NULL
           OR ((visibility = 'invite_only') = (invite_code IS NOT NULL)))
);

CREATE INDEX IF NOT EXISTS idx_groups_discover
    ON groups(visibility, member_count DESC) WHERE deleted_at IS NULL;

-- ----------------------------------------------------------------
-- Memberships
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS memberships (
    group_id  TEXT NOT NULL,                     -- FK -> groups(id)
    user_id   TEXT NOT NULL,                     -- UUID
    role      TEXT NOT NULL,                     -- owner | moderator | member
    joined_at TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    CHECK (role IN ('owner', 'moderator', 'member')),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

-- At most one owner per group; the write path guarantees at least one.
CREATE UNIQUE INDEX IF NOT EXISTS idx_memberships_one_owner
    ON memberships(group_id) WHERE role = 'owner';

CREATE INDEX IF NOT EXISTS idx_memberships_user ON memberships(user_id);

-- ----------------------------------------------------------------
-- Invitations (grant entry to private groups)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS invitations (
    group_id   TEXT NOT NULL,                    -- FK -> groups(id)
    user_id    TEXT NOT NULL,
    invited_by TEXT NOT NULL,
    created_at TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY NOT NULL,        -- UUID v4
    group_id   TEXT NOT NULL,                    -- FK -> groups(id)
    author_id  TEXT NOT NULL,
    kind       TEXT NOT NULL,                    -- text | verse | prayer | media
    body       TEXT,
    verse_refs TEXT NOT NULL DEFAULT '[]',       -- JSON array of strings
    media_url  TEXT,
    reply_to   TEXT,                             -- FK -> messages(id), same group
    seq        INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    edited_at  TEXT,
    deleted_at TEXT,

    CHECK (kind IN ('text', 'verse', 'prayer', 'media')),
    FOREIGN KEY (group_id) REFERENCES groups(id),
    FOREIGN KEY (reply_to) REFERENCES messages(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_group_seq
    ON messages(group_id, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
