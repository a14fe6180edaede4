use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use fellowship_shared::{GroupId, MessageId, MessageKind, UserId};

use crate::codec::{parse_json, parse_label, parse_opt_ts, parse_ts, parse_uuid, ts};
use crate::database::Txn;
use crate::error::{conflict, not_found, Result, StoreError};
use crate::models::{Message, MessageContent, MessageState};

const MESSAGE_COLUMNS: &str = "id, group_id, author_id, kind, body, verse_refs, media_url, reply_to,
     seq, created_at, edited_at, deleted_at";

impl Txn<'_> {
    /// Append a message to a group's log.
    ///
    /// The ordering key comes from `groups.next_seq`, read and advanced in
    /// this same write transaction, so two posts can never share a key.
    pub fn insert_message(
        &self,
        group: GroupId,
        author: UserId,
        kind: MessageKind,
        content: &MessageContent,
        reply_to: Option<MessageId>,
        now: DateTime<Utc>,
    ) -> Result<Message> {
        let seq: i64 = self
            .conn()
            .query_row(
                "SELECT next_seq FROM groups WHERE id = ?1 AND deleted_at IS NULL",
                params![group.to_string()],
                |row| row.get(0),
            )
            .map_err(not_found)?;

        let id = MessageId::new();
        self.conn()
            .execute(
                "INSERT INTO messages (id, group_id, author_id, kind, body, verse_refs, media_url,
                                       reply_to, seq, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.to_string(),
                    group.to_string(),
                    author.to_string(),
                    kind.as_str(),
                    stored_body(content.body.as_deref()),
                    serde_json::to_string(&content.verse_refs)?,
                    content.media_url,
                    reply_to.map(|r| r.to_string()),
                    seq,
                    ts(now),
                ],
            )
            .map_err(|e| conflict(e, "duplicate ordering key"))?;

        self.conn().execute(
            "UPDATE groups SET next_seq = ?2, updated_at = ?3 WHERE id = ?1",
            params![group.to_string(), seq + 1, ts(now)],
        )?;

        tracing::debug!(group = %group, message = %id, seq, kind = %kind, "message appended");

        self.get_message(id)
    }

    pub fn get_message(&self, id: MessageId) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(not_found)
    }

    pub fn find_message(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .optional()?)
    }

    /// The newest `limit` active messages with `seq < before`, returned
    /// oldest first.
    pub fn list_recent_messages(
        &self,
        group: GroupId,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages
             WHERE group_id = ?1 AND deleted_at IS NULL AND seq < ?2
             ORDER BY seq DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![group.to_string(), before.unwrap_or(i64::MAX), limit],
            row_to_message,
        )?;

        let mut messages = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// Whether any active message older than `seq` exists.
    pub fn has_messages_before(&self, group: GroupId, seq: i64) -> Result<bool> {
        Ok(self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM messages
                           WHERE group_id = ?1 AND deleted_at IS NULL AND seq < ?2)",
            params![group.to_string(), seq],
            |row| row.get(0),
        )?)
    }

    /// Which of `ids` refer to soft-deleted messages.
    pub fn deleted_among(&self, ids: &[MessageId]) -> Result<HashSet<MessageId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT deleted_at IS NOT NULL FROM messages WHERE id = ?1")?;

        let mut deleted = HashSet::new();
        for id in ids {
            let is_deleted: Option<bool> = stmt
                .query_row(params![id.to_string()], |row| row.get(0))
                .optional()?;
            if is_deleted.unwrap_or(true) {
                deleted.insert(*id);
            }
        }
        Ok(deleted)
    }

    /// Replace the body of an active message. A blank body is stored as
    /// `NULL`.
    pub fn edit_message(&self, id: MessageId, body: &str, now: DateTime<Utc>) -> Result<Message> {
        let affected = self.conn().execute(
            "UPDATE messages SET body = ?2, edited_at = ?3
             WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), stored_body(Some(body)), ts(now)],
        )?;
        if affected == 0 {
            return Err(StoreError::Conflict("message is deleted".into()));
        }

        tracing::debug!(message = %id, "message edited");
        self.get_message(id)
    }

    /// Mark a message deleted. Returns `false` if it already was; the
    /// original deletion time is kept.
    pub fn soft_delete_message(&self, id: MessageId, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE messages SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
            params![id.to_string(), ts(now)],
        )?;

        if affected > 0 {
            tracing::info!(message = %id, "message soft-deleted");
        }
        Ok(affected > 0)
    }

    pub(crate) fn soft_delete_group_messages(&self, group: GroupId, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.conn().execute(
            "UPDATE messages SET deleted_at = ?2 WHERE group_id = ?1 AND deleted_at IS NULL",
            params![group.to_string(), ts(now)],
        )?)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let group_str: String = row.get(1)?;
    let author_str: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let body: Option<String> = row.get(4)?;
    let refs_json: String = row.get(5)?;
    let media_url: Option<String> = row.get(6)?;
    let reply_str: Option<String> = row.get(7)?;
    let seq: i64 = row.get(8)?;
    let created_str: String = row.get(9)?;
    let edited_str: Option<String> = row.get(10)?;
    let deleted_str: Option<String> = row.get(11)?;

    let state = match parse_opt_ts(11, deleted_str)? {
        Some(at) => MessageState::Deleted { at },
        None => MessageState::Active,
    };

    Ok(Message {
        id: MessageId(parse_uuid(0, &id_str)?),
        group: GroupId(parse_uuid(1, &group_str)?),
        author: UserId(parse_uuid(2, &author_str)?),
        kind: parse_label(3, &kind_str)?,
        body,
        verse_refs: parse_json(5, &refs_json)?,
        media_url,
        reply_to: reply_str
            .map(|s| parse_uuid(7, &s).map(MessageId))
            .transpose()?,
        seq,
        created_at: parse_ts(9, &created_str)?,
        edited_at: parse_opt_ts(10, edited_str)?,
        state,
    })
}

/// Blank bodies are kept as `NULL` so optional captions read back as absent.
fn stored_body(body: Option<&str>) -> Option<&str> {
    body.filter(|b| !b.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewGroup;
    use crate::Database;
    use fellowship_shared::Visibility;
    use std::sync::Arc;

    fn setup() -> (Database, GroupId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let group = db
            .write(|tx| {
                tx.create_group(
                    owner,
                    &NewGroup {
                        name: "Evening prayer".into(),
                        description: None,
                        visibility: Visibility::Public,
                        is_premium_only: false,
                    },
                    Utc::now(),
                )
            })
            .unwrap();
        (db, group.id, owner)
    }

    fn text(body: &str) -> MessageContent {
        MessageContent {
            body: Some(body.to_string()),
            ..Default::default()
        }
    }

    fn post(db: &Database, group: GroupId, author: UserId, body: &str) -> Message {
        db.write(|tx| tx.insert_message(group, author, MessageKind::Text, &text(body), None, Utc::now()))
            .unwrap()
    }

    #[test]
    fn sequence_is_strictly_increasing() {
        let (db, group, owner) = setup();
        let seqs: Vec<i64> = (0..5).map(|i| post(&db, group, owner, &i.to_string()).seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn concurrent_posts_never_share_a_key() {
        let (db, group, owner) = setup();
        let db = Arc::new(db);

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    (0..10)
                        .map(|i| post(&db, group, owner, &format!("{t}-{i}")).seq)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seqs: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        seqs.sort_unstable();
        seqs.dedup();
        assert_eq!(seqs.len(), 80);

        let listed = db.read(|tx| tx.list_recent_messages(group, 100, None)).unwrap();
        assert!(listed.windows(2).all(|w| w[0].seq < w[1].seq));
    }

    #[test]
    fn list_returns_newest_page_oldest_first() {
        let (db, group, owner) = setup();
        for i in 1..=5 {
            post(&db, group, owner, &format!("m{i}"));
        }

        let page = db.read(|tx| tx.list_recent_messages(group, 3, None)).unwrap();
        let bodies: Vec<_> = page.iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["m3", "m4", "m5"]);

        let older = db
            .read(|tx| tx.list_recent_messages(group, 3, Some(page[0].seq)))
            .unwrap();
        let bodies: Vec<_> = older.iter().map(|m| m.body.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["m1", "m2"]);
    }

    #[test]
    fn soft_delete_is_idempotent_and_hidden_from_list() {
        let (db, group, owner) = setup();
        let m = post(&db, group, owner, "hello");

        assert!(db.write(|tx| tx.soft_delete_message(m.id, Utc::now())).unwrap());
        let first = db.read(|tx| tx.get_message(m.id)).unwrap();
        assert!(!db.write(|tx| tx.soft_delete_message(m.id, Utc::now())).unwrap());
        let second = db.read(|tx| tx.get_message(m.id)).unwrap();

        assert_eq!(first, second);
        assert!(db.read(|tx| tx.list_recent_messages(group, 10, None)).unwrap().is_empty());
        assert!(db.read(|tx| tx.deleted_among(&[m.id])).unwrap().contains(&m.id));
    }

    #[test]
    fn edit_sets_edited_at_but_not_on_deleted() {
        let (db, group, owner) = setup();
        let m = post(&db, group, owner, "hello");

        let edited = db
            .write(|tx| tx.edit_message(m.id, "hello world", Utc::now()))
            .unwrap();
        assert_eq!(edited.body.as_deref(), Some("hello world"));
        assert!(edited.edited_at.is_some());
        assert_eq!(edited.seq, m.seq);
        assert_eq!(edited.created_at, m.created_at);

        db.write(|tx| tx.soft_delete_message(m.id, Utc::now())).unwrap();
        let result = db.write(|tx| tx.edit_message(m.id, "again", Utc::now()));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[test]
    fn blank_body_is_stored_as_null() {
        let (db, group, owner) = setup();
        let verse = MessageContent {
            body: Some("   ".into()),
            verse_refs: vec!["Psalm 46:10".into()],
            ..Default::default()
        };
        let m = db
            .write(|tx| tx.insert_message(group, owner, MessageKind::Verse, &verse, None, Utc::now()))
            .unwrap();
        assert_eq!(m.body, None);

        let with_caption = db
            .write(|tx| tx.edit_message(m.id, "Be still", Utc::now()))
            .unwrap();
        assert_eq!(with_caption.body.as_deref(), Some("Be still"));

        let cleared = db.write(|tx| tx.edit_message(m.id, "", Utc::now())).unwrap();
        assert_eq!(cleared.body, None);
        assert!(cleared.edited_at.is_some());
    }

    #[test]
    fn verse_refs_round_trip_in_order() {
        let (db, group, owner) = setup();
        let content = MessageContent {
            body: None,
            verse_refs: vec!["John 3:16".into(), "Romans 8:28".into()],
            media_url: None,
        };
        let m = db
            .write(|tx| tx.insert_message(group, owner, MessageKind::Verse, &content, None, Utc::now()))
            .unwrap();
        assert_eq!(m.verse_refs, content.verse_refs);
        assert_eq!(m.kind, MessageKind::Verse);
    }
}
