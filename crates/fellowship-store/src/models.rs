//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fellowship_shared::{GroupId, MessageId, MessageKind, Role, UserId, Visibility};

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// A community group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    /// `None` only after the group has been deleted.
    pub owner: Option<UserId>,
    /// Present iff `visibility` is `InviteOnly`.
    pub invite_code: Option<String>,
    /// Cached count of membership rows.
    pub member_count: u32,
    pub is_premium_only: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Group {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Input for creating a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewGroup {
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    #[serde(default)]
    pub is_premium_only: bool,
}

/// Partial update of group settings. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupChanges {
    pub name: Option<String>,
    /// `Some(None)` clears the description.
    #[serde(default, with = "double_option")]
    pub description: Option<Option<String>>,
    pub visibility: Option<Visibility>,
    pub is_premium_only: Option<bool>,
}

impl GroupChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.visibility.is_none()
            && self.is_premium_only.is_none()
    }
}

// Distinguishes an absent field from an explicit `null`.
mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T>(value: &Option<Option<T>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        Option::<T>::deserialize(deserializer).map(Some)
    }
}

// ---------------------------------------------------------------------------
// Membership / Invitation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub group: GroupId,
    pub user: UserId,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
}

/// Permission to join a private group, consumed on join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Invitation {
    pub group: GroupId,
    pub user: UserId,
    pub invited_by: UserId,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Lifecycle of a message. `Deleted` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MessageState {
    Active,
    Deleted { at: DateTime<Utc> },
}

impl MessageState {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted { .. })
    }
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub group: GroupId,
    pub author: UserId,
    pub kind: MessageKind,
    pub body: Option<String>,
    pub verse_refs: Vec<String>,
    pub media_url: Option<String>,
    pub reply_to: Option<MessageId>,
    /// Group-scoped ordering key, strictly increasing in post order.
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub state: MessageState,
}

impl Message {
    pub fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }
}

/// Content of a message being posted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageContent {
    pub body: Option<String>,
    #[serde(default)]
    pub verse_refs: Vec<String>,
    pub media_url: Option<String>,
}
