//! CRUD operations for [`Group`] records.
//!
//! Creating a group inserts its owner membership in the same transaction, and
//! every helper that changes membership rows keeps `member_count` in step.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use fellowship_shared::invite::generate_invite_code;
use fellowship_shared::{GroupId, Role, UserId, Visibility};

use crate::codec::{parse_label, parse_opt_ts, parse_ts, parse_uuid, ts};
use crate::database::Txn;
use crate::error::{conflict, not_found, Result, StoreError};
use crate::models::{Group, GroupChanges, NewGroup};

const GROUP_COLUMNS: &str = "g.id, g.name, g.description, g.visibility, g.owner_id, g.invite_code,
     g.member_count, g.is_premium_only, g.created_at, g.updated_at, g.deleted_at";

impl Txn<'_> {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new group together with its owner's membership.
    pub fn create_group(&self, owner: UserId, new: &NewGroup, now: DateTime<Utc>) -> Result<Group> {
        let id = GroupId::new();
        let invite_code = new
            .visibility
            .requires_invite_code()
            .then(generate_invite_code);

        self.conn()
            .execute(
                "INSERT INTO groups (id, name, description, visibility, owner_id, invite_code,
                                     member_count, is_premium_only, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8, ?8)",
                params![
                    id.to_string(),
                    new.name,
                    new.description,
                    new.visibility.as_str(),
                    owner.to_string(),
                    invite_code,
                    new.is_premium_only,
                    ts(now),
                ],
            )
            .map_err(|e| conflict(e, "group already exists"))?;

        self.conn().execute(
            "INSERT INTO memberships (group_id, user_id, role, joined_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                owner.to_string(),
                Role::Owner.as_str(),
                ts(now)
            ],
        )?;

        tracing::info!(group = %id, owner = %owner, visibility = %new.visibility, "group created");

        self.get_group(id)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a group by id, including deleted ones.
    pub fn get_group(&self, id: GroupId) -> Result<Group> {
        self.conn()
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM groups g WHERE g.id = ?1"),
                params![id.to_string()],
                row_to_group,
            )
            .map_err(not_found)
    }

    /// Fetch a group that has not been deleted.
    pub fn find_active_group(&self, id: GroupId) -> Result<Option<Group>> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {GROUP_COLUMNS} FROM groups g WHERE g.id = ?1 AND g.deleted_at IS NULL"),
                params![id.to_string()],
                row_to_group,
            )
            .optional()?)
    }

    /// Groups the user belongs to, most recently updated first.
    pub fn list_groups_for_user(&self, user: UserId) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {GROUP_COLUMNS}
             FROM groups g
             JOIN memberships m ON m.group_id = g.id
             WHERE m.user_id = ?1 AND g.deleted_at IS NULL
             ORDER BY g.updated_at DESC, g.id ASC"
        ))?;

        let rows = stmt.query_map(params![user.to_string()], row_to_group)?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    /// Public groups, largest first.
    pub fn list_discoverable_groups(&self, limit: u32) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {GROUP_COLUMNS}
             FROM groups g
             WHERE g.visibility = 'public' AND g.deleted_at IS NULL
             ORDER BY g.member_count DESC, g.created_at ASC
             LIMIT ?1"
        ))?;

        let rows = stmt.query_map(params![limit], row_to_group)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// Count membership rows directly, bypassing the cached counter.
    pub fn count_members(&self, id: GroupId) -> Result<u32> {
        Ok(self.conn().query_row(
            "SELECT COUNT(*) FROM memberships WHERE group_id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply settings changes. Moving to `InviteOnly` mints a code when none
    /// exists; moving away clears it.
    pub fn update_group(&self, id: GroupId, changes: &GroupChanges, now: DateTime<Utc>) -> Result<Group> {
        let current = self.get_group(id)?;

        let name = changes.name.clone().unwrap_or(current.name);
        let description = changes.description.clone().unwrap_or(current.description);
        let visibility = changes.visibility.unwrap_or(current.visibility);
        let is_premium_only = changes.is_premium_only.unwrap_or(current.is_premium_only);
        let invite_code = match (visibility, current.invite_code) {
            (Visibility::InviteOnly, Some(code)) => Some(code),
            (Visibility::InviteOnly, None) => Some(generate_invite_code()),
            (_, _) => None,
        };

        self.conn().execute(
            "UPDATE groups
             SET name = ?2, description = ?3, visibility = ?4, invite_code = ?5,
                 is_premium_only = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                id.to_string(),
                name,
                description,
                visibility.as_str(),
                invite_code,
                is_premium_only,
                ts(now),
            ],
        )?;

        tracing::info!(group = %id, visibility = %visibility, "group settings updated");

        self.get_group(id)
    }

    /// Replace the invite code of an invite-only group.
    pub fn rotate_invite_code(&self, id: GroupId, now: DateTime<Utc>) -> Result<String> {
        let code = generate_invite_code();
        let affected = self
            .conn()
            .execute(
                "UPDATE groups SET invite_code = ?2, updated_at = ?3
                 WHERE id = ?1 AND visibility = 'invite_only' AND deleted_at IS NULL",
                params![id.to_string(), code, ts(now)],
            )
            .map_err(|e| conflict(e, "invite code collision"))?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(code)
    }

    pub(crate) fn adjust_member_count(&self, id: GroupId, delta: i64, now: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE groups SET member_count = member_count + ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), delta, ts(now)],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a group: memberships and invitations are removed, messages are
    /// soft-deleted and the group row is kept as a tombstone.
    pub fn delete_group(&self, id: GroupId, now: DateTime<Utc>) -> Result<()> {
        let group = self.get_group(id)?;
        if group.is_deleted() {
            return Ok(());
        }

        let id_str = id.to_string();
        self.conn()
            .execute("DELETE FROM invitations WHERE group_id = ?1", params![id_str])?;
        let removed = self
            .conn()
            .execute("DELETE FROM memberships WHERE group_id = ?1", params![id_str])?;
        let hidden = self.soft_delete_group_messages(id, now)?;

        self.conn().execute(
            "UPDATE groups
             SET owner_id = NULL, invite_code = NULL, member_count = 0,
                 updated_at = ?2, deleted_at = ?2
             WHERE id = ?1",
            params![id_str, ts(now)],
        )?;

        tracing::info!(group = %id, removed, hidden, "group deleted");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Map a `rusqlite::Row` to a [`Group`].
fn row_to_group(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let description: Option<String> = row.get(2)?;
    let visibility_str: String = row.get(3)?;
    let owner_str: Option<String> = row.get(4)?;
    let invite_code: Option<String> = row.get(5)?;
    let member_count: u32 = row.get(6)?;
    let is_premium_only: bool = row.get(7)?;
    let created_str: String = row.get(8)?;
    let updated_str: String = row.get(9)?;
    let deleted_str: Option<String> = row.get(10)?;

    Ok(Group {
        id: GroupId(parse_uuid(0, &id_str)?),
        name,
        description,
        visibility: parse_label(3, &visibility_str)?,
        owner: owner_str
            .map(|s| parse_uuid(4, &s).map(UserId))
            .transpose()?,
        invite_code,
        member_count,
        is_premium_only,
        created_at: parse_ts(8, &created_str)?,
        updated_at: parse_ts(9, &updated_str)?,
        deleted_at: parse_opt_ts(10, deleted_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::Duration;

    fn new_group(name: &str, visibility: Visibility) -> NewGroup {
        NewGroup {
            name: name.to_string(),
            description: None,
            visibility,
            is_premium_only: false,
        }
    }

    #[test]
    fn create_group_adds_owner_membership() {
        let db = Database::open_in_memory().unwrap();
        let owner = UserId::new();

        let group = db
            .write(|tx| tx.create_group(owner, &new_group("Romans study", Visibility::Public), Utc::now()))
            .unwrap();

        assert_eq!(group.member_count, 1);
        assert_eq!(group.owner, Some(owner));
        assert!(group.invite_code.is_none());

        let role = db.read(|tx| tx.role_of(group.id, owner)).unwrap();
        assert_eq!(role, Some(Role::Owner));
    }

    #[test]
    fn invite_code_follows_visibility() {
        let db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let now = Utc::now();

        let group = db
            .write(|tx| tx.create_group(owner, &new_group("Elders", Visibility::InviteOnly), now))
            .unwrap();
        assert!(group.invite_code.is_some());

        let public = GroupChanges {
            visibility: Some(Visibility::Public),
            ..Default::default()
        };
        let group = db.write(|tx| tx.update_group(group.id, &public, now)).unwrap();
        assert!(group.invite_code.is_none());

        let invite_only = GroupChanges {
            visibility: Some(Visibility::InviteOnly),
            ..Default::default()
        };
        let group = db
            .write(|tx| tx.update_group(group.id, &invite_only, now))
            .unwrap();
        assert!(group.invite_code.is_some());
    }

    #[test]
    fn discoverable_lists_public_by_size() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();

        let small = db
            .write(|tx| tx.create_group(UserId::new(), &new_group("small", Visibility::Public), now))
            .unwrap();
        let big = db
            .write(|tx| tx.create_group(UserId::new(), &new_group("big", Visibility::Public), now))
            .unwrap();
        db.write(|tx| tx.create_group(UserId::new(), &new_group("hidden", Visibility::Private), now))
            .unwrap();
        db.write(|tx| tx.add_member(big.id, UserId::new(), Role::Member, now))
            .unwrap();

        let listed = db.read(|tx| tx.list_discoverable_groups(10)).unwrap();
        let ids: Vec<_> = listed.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![big.id, small.id]);
    }

    #[test]
    fn groups_for_user_most_recent_first() {
        let db = Database::open_in_memory().unwrap();
        let user = UserId::new();
        let now = Utc::now();

        let first = db
            .write(|tx| tx.create_group(user, &new_group("first", Visibility::Public), now))
            .unwrap();
        let second = db
            .write(|tx| tx.create_group(user, &new_group("second", Visibility::Public), now + Duration::seconds(1)))
            .unwrap();
        let rename = GroupChanges {
            name: Some("first again".into()),
            ..Default::default()
        };
        db.write(|tx| tx.update_group(first.id, &rename, now + Duration::seconds(2)))
            .unwrap();

        let listed = db.read(|tx| tx.list_groups_for_user(user)).unwrap();
        let ids: Vec<_> = listed.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
    }

    #[test]
    fn delete_group_keeps_tombstone() {
        let db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let now = Utc::now();

        let group = db
            .write(|tx| tx.create_group(owner, &new_group("gone", Visibility::InviteOnly), now))
            .unwrap();
        db.write(|tx| tx.delete_group(group.id, now)).unwrap();

        let group = db.read(|tx| tx.get_group(group.id)).unwrap();
        assert!(group.is_deleted());
        assert_eq!(group.member_count, 0);
        assert!(group.owner.is_none());
        assert!(db.read(|tx| tx.find_active_group(group.id)).unwrap().is_none());
        assert_eq!(db.read(|tx| tx.count_members(group.id)).unwrap(), 0);
    }
}
