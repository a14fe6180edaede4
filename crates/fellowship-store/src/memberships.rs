//! Membership rows, role changes and invitations.
//!
//! The helpers here hold the structural invariants: one row per
//! (group, user), exactly one owner, and `groups.member_count` moving in the
//! same transaction as the rows it counts. Whether an actor is *allowed* to
//! request a change is decided by the caller before these run.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use fellowship_shared::{GroupId, Role, UserId};

use crate::codec::{parse_label, parse_ts, parse_uuid, ts};
use crate::database::Txn;
use crate::error::{conflict, Result, StoreError};
use crate::models::{Invitation, Membership};

impl Txn<'_> {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn membership(&self, group: GroupId, user: UserId) -> Result<Option<Membership>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT group_id, user_id, role, joined_at
                 FROM memberships WHERE group_id = ?1 AND user_id = ?2",
                params![group.to_string(), user.to_string()],
                row_to_membership,
            )
            .optional()?)
    }

    pub fn role_of(&self, group: GroupId, user: UserId) -> Result<Option<Role>> {
        Ok(self.membership(group, user)?.map(|m| m.role))
    }

    /// Members ordered owner first, then moderators, then by tenure.
    pub fn list_members(&self, group: GroupId) -> Result<Vec<Membership>> {
        let mut stmt = self.conn().prepare(
            "SELECT group_id, user_id, role, joined_at
             FROM memberships
             WHERE group_id = ?1
             ORDER BY CASE role WHEN 'owner' THEN 0 WHEN 'moderator' THEN 1 ELSE 2 END,
                      joined_at ASC, user_id ASC",
        )?;

        let rows = stmt.query_map(params![group.to_string()], row_to_membership)?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }

    // ------------------------------------------------------------------
    // Join / leave
    // ------------------------------------------------------------------

    /// Insert a membership and bump the group's counter.
    ///
    /// Fails with [`StoreError::Conflict`] if the user is already a member.
    /// Owners are only created through [`Txn::create_group`] and
    /// [`Txn::transfer_ownership`].
    pub fn add_member(&self, group: GroupId, user: UserId, role: Role, now: DateTime<Utc>) -> Result<Membership> {
        if role == Role::Owner {
            return Err(StoreError::Conflict("a group has exactly one owner".into()));
        }

        self.conn()
            .execute(
                "INSERT INTO memberships (group_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group.to_string(), user.to_string(), role.as_str(), ts(now)],
            )
            .map_err(|e| conflict(e, "already a member of this group"))?;

        self.adjust_member_count(group, 1, now)?;

        tracing::info!(group = %group, user = %user, role = %role, "member added");

        self.membership(group, user)?.ok_or(StoreError::NotFound)
    }

    /// Delete a membership and decrement the group's counter.
    ///
    /// The owner row can never be removed this way; ownership has to be
    /// transferred first.
    pub fn remove_member(&self, group: GroupId, user: UserId, now: DateTime<Utc>) -> Result<Membership> {
        let membership = self.membership(group, user)?.ok_or(StoreError::NotFound)?;
        if membership.role == Role::Owner {
            return Err(StoreError::Conflict(
                "the owner must transfer ownership before leaving".into(),
            ));
        }

        self.conn().execute(
            "DELETE FROM memberships WHERE group_id = ?1 AND user_id = ?2",
            params![group.to_string(), user.to_string()],
        )?;

        self.adjust_member_count(group, -1, now)?;

        tracing::info!(group = %group, user = %user, "member removed");
        Ok(membership)
    }

    // ------------------------------------------------------------------
    // Roles
    // ------------------------------------------------------------------

    /// Switch a non-owner between `Member` and `Moderator`.
    pub fn set_role(&self, group: GroupId, user: UserId, role: Role) -> Result<Membership> {
        let current = self.membership(group, user)?.ok_or(StoreError::NotFound)?;
        if role == Role::Owner || current.role == Role::Owner {
            return Err(StoreError::Conflict(
                "ownership changes go through a transfer".into(),
            ));
        }

        self.conn().execute(
            "UPDATE memberships SET role = ?3 WHERE group_id = ?1 AND user_id = ?2",
            params![group.to_string(), user.to_string(), role.as_str()],
        )?;

        tracing::info!(group = %group, user = %user, from = %current.role, to = %role, "role changed");

        Ok(Membership { role, ..current })
    }

    /// Hand ownership from `from` to `to` in one step. The previous owner
    /// stays on as a moderator.
    pub fn transfer_ownership(&self, group: GroupId, from: UserId, to: UserId, now: DateTime<Utc>) -> Result<()> {
        let old = self.membership(group, from)?.ok_or(StoreError::NotFound)?;
        if old.role != Role::Owner {
            return Err(StoreError::Conflict("only the owner can transfer ownership".into()));
        }
        if from == to {
            return Err(StoreError::Conflict("already the owner".into()));
        }
        self.membership(group, to)?.ok_or(StoreError::NotFound)?;

        // Demote first: the partial unique index allows one owner at a time.
        self.conn().execute(
            "UPDATE memberships SET role = 'moderator' WHERE group_id = ?1 AND user_id = ?2",
            params![group.to_string(), from.to_string()],
        )?;
        self.conn().execute(
            "UPDATE memberships SET role = 'owner' WHERE group_id = ?1 AND user_id = ?2",
            params![group.to_string(), to.to_string()],
        )?;
        self.conn().execute(
            "UPDATE groups SET owner_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![group.to_string(), to.to_string(), ts(now)],
        )?;

        tracing::info!(group = %group, from = %from, to = %to, "ownership transferred");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invitations
    // ------------------------------------------------------------------

    /// Record an invitation. Returns `false` if one already existed.
    pub fn invite(&self, group: GroupId, user: UserId, invited_by: UserId, now: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO invitations (group_id, user_id, invited_by, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                group.to_string(),
                user.to_string(),
                invited_by.to_string(),
                ts(now)
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn invitation(&self, group: GroupId, user: UserId) -> Result<Option<Invitation>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT group_id, user_id, invited_by, created_at
                 FROM invitations WHERE group_id = ?1 AND user_id = ?2",
                params![group.to_string(), user.to_string()],
                |row| {
                    let group_str: String = row.get(0)?;
                    let user_str: String = row.get(1)?;
                    let by_str: String = row.get(2)?;
                    let created_str: String = row.get(3)?;
                    Ok(Invitation {
                        group: GroupId(parse_uuid(0, &group_str)?),
                        user: UserId(parse_uuid(1, &user_str)?),
                        invited_by: UserId(parse_uuid(2, &by_str)?),
                        created_at: parse_ts(3, &created_str)?,
                    })
                },
            )
            .optional()?)
    }

    /// Consume an invitation. Returns `true` if one was present.
    pub fn take_invitation(&self, group: GroupId, user: UserId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM invitations WHERE group_id = ?1 AND user_id = ?2",
            params![group.to_string(), user.to_string()],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_membership(row: &rusqlite::Row<'_>) -> rusqlite::Result<Membership> {
    let group_str: String = row.get(0)?;
    let user_str: String = row.get(1)?;
    let role_str: String = row.get(2)?;
    let joined_str: String = row.get(3)?;

    Ok(Membership {
        group: GroupId(parse_uuid(0, &group_str)?),
        user: UserId(parse_uuid(1, &user_str)?),
        role: parse_label(2, &role_str)?,
        joined_at: parse_ts(3, &joined_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewGroup;
    use crate::Database;
    use fellowship_shared::Visibility;

    fn setup() -> (Database, GroupId, UserId) {
        let db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let group = db
            .write(|tx| {
                tx.create_group(
                    owner,
                    &NewGroup {
                        name: "Psalms".into(),
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

    fn cached_count(db: &Database, group: GroupId) -> u32 {
        db.read(|tx| tx.get_group(group)).unwrap().member_count
    }

    #[test]
    fn duplicate_join_is_conflict_and_count_unchanged() {
        let (db, group, _) = setup();
        let user = UserId::new();

        db.write(|tx| tx.add_member(group, user, Role::Member, Utc::now()))
            .unwrap();
        let again = db.write(|tx| tx.add_member(group, user, Role::Member, Utc::now()));

        assert!(matches!(again, Err(StoreError::Conflict(_))));
        assert_eq!(cached_count(&db, group), 2);
        assert_eq!(db.read(|tx| tx.count_members(group)).unwrap(), 2);
    }

    #[test]
    fn owner_cannot_be_removed() {
        let (db, group, owner) = setup();
        let result = db.write(|tx| tx.remove_member(group, owner, Utc::now()));
        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert_eq!(cached_count(&db, group), 1);
    }

    #[test]
    fn remove_missing_member_is_not_found() {
        let (db, group, _) = setup();
        let result = db.write(|tx| tx.remove_member(group, UserId::new(), Utc::now()));
        assert!(matches!(result, Err(StoreError::NotFound)));
    }

    #[test]
    fn transfer_swaps_roles_atomically() {
        let (db, group, owner) = setup();
        let heir = UserId::new();
        db.write(|tx| tx.add_member(group, heir, Role::Member, Utc::now()))
            .unwrap();

        db.write(|tx| tx.transfer_ownership(group, owner, heir, Utc::now()))
            .unwrap();

        let members = db.read(|tx| tx.list_members(group)).unwrap();
        let owners: Vec<_> = members.iter().filter(|m| m.role == Role::Owner).collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].user, heir);
        assert_eq!(db.read(|tx| tx.role_of(group, owner)).unwrap(), Some(Role::Moderator));
        assert_eq!(db.read(|tx| tx.get_group(group)).unwrap().owner, Some(heir));
    }

    #[test]
    fn set_role_refuses_owner_changes() {
        let (db, group, owner) = setup();
        let user = UserId::new();
        db.write(|tx| tx.add_member(group, user, Role::Member, Utc::now()))
            .unwrap();

        assert!(db.write(|tx| tx.set_role(group, user, Role::Owner)).is_err());
        assert!(db.write(|tx| tx.set_role(group, owner, Role::Member)).is_err());

        let m = db.write(|tx| tx.set_role(group, user, Role::Moderator)).unwrap();
        assert_eq!(m.role, Role::Moderator);
    }

    #[test]
    fn invitations_are_consumed_once() {
        let (db, group, owner) = setup();
        let guest = UserId::new();

        assert!(db.write(|tx| tx.invite(group, guest, owner, Utc::now())).unwrap());
        assert!(!db.write(|tx| tx.invite(group, guest, owner, Utc::now())).unwrap());
        assert!(db.read(|tx| tx.invitation(group, guest)).unwrap().is_some());

        assert!(db.write(|tx| tx.take_invitation(group, guest)).unwrap());
        assert!(!db.write(|tx| tx.take_invitation(group, guest)).unwrap());
    }

    #[test]
    fn counter_tracks_rows_through_churn() {
        let (db, group, _) = setup();
        let users: Vec<UserId> = (0..6).map(|_| UserId::new()).collect();

        for u in &users {
            db.write(|tx| tx.add_member(group, *u, Role::Member, Utc::now()))
                .unwrap();
        }
        for u in users.iter().step_by(2) {
            db.write(|tx| tx.remove_member(group, *u, Utc::now())).unwrap();
        }

        let rows = db.read(|tx| tx.count_members(group)).unwrap();
        assert_eq!(rows, 4);
        assert_eq!(cached_count(&db, group), rows);
    }
}
