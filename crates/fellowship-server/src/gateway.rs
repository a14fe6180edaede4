//! Authorization gateway.
//!
//! Every operation runs the same three steps inside one write transaction:
//! load the [`Facts`] it depends on, ask [`authorize`] for a [`Decision`],
//! then mutate. Because the facts are read under the same write lock as the
//! mutation, a decision can never be made on stale data, and each mutation
//! passes through exactly one `authorize` call.
//!
//! [`authorize`] itself is pure: given the same actor, operation and facts it
//! always returns the same decision.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use fellowship_shared::constants::{
    clamp_page_size, MAX_BODY_LEN, MAX_GROUP_DESCRIPTION_LEN, MAX_GROUP_NAME_LEN,
    MAX_QUESTION_LEN, MAX_VERSE_REFS,
};
use fellowship_shared::entitlement::{self, required_feature};
use fellowship_shared::invite::invite_code_matches;
use fellowship_shared::{
    Feature, FeatureSet, GroupId, MessageId, MessageKind, Rejection, Role, Tier, UserId,
    Visibility,
};
use fellowship_store::{
    Database, Group, GroupChanges, Membership, Message, MessageContent, NewGroup, StoreError, Txn,
};

use crate::assistant::{Answer, Assistant, Turn};
use crate::billing::Billing;

// ---------------------------------------------------------------------------
// Operations, facts, decisions
// ---------------------------------------------------------------------------

/// Everything an actor can ask the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateGroup { group: NewGroup },
    GetGroup { group: GroupId },
    ListMyGroups,
    ListDiscoverable,
    UpdateGroup { group: GroupId, changes: GroupChanges },
    RegenerateInviteCode { group: GroupId },
    DeleteGroup { group: GroupId },
    Join { group: GroupId, invite_code: Option<String> },
    Leave { group: GroupId },
    Invite { group: GroupId, user: UserId },
    ChangeRole { group: GroupId, target: UserId, role: Role },
    TransferOwnership { group: GroupId, target: UserId },
    RemoveMember { group: GroupId, target: UserId },
    ListMembers { group: GroupId },
    Post {
        group: GroupId,
        kind: MessageKind,
        content: MessageContent,
        reply_to: Option<MessageId>,
    },
    Edit { message: MessageId, body: String },
    SoftDelete { message: MessageId },
    ListMessages { group: GroupId },
    GetMessage { message: MessageId },
    AskAssistant { question: String },
    StartCheckout { tier: Tier },
    OpenBillingPortal,
    Entitlements,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateGroup { .. } => "create_group",
            Self::GetGroup { .. } => "get_group",
            Self::ListMyGroups => "list_my_groups",
            Self::ListDiscoverable => "list_discoverable",
            Self::UpdateGroup { .. } => "update_group",
            Self::RegenerateInviteCode { .. } => "regenerate_invite_code",
            Self::DeleteGroup { .. } => "delete_group",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Invite { .. } => "invite",
            Self::ChangeRole { .. } => "change_role",
            Self::TransferOwnership { .. } => "transfer_ownership",
            Self::RemoveMember { .. } => "remove_member",
            Self::ListMembers { .. } => "list_members",
            Self::Post { .. } => "post",
            Self::Edit { .. } => "edit",
            Self::SoftDelete { .. } => "soft_delete",
            Self::ListMessages { .. } => "list_messages",
            Self::GetMessage { .. } => "get_message",
            Self::AskAssistant { .. } => "ask_assistant",
            Self::StartCheckout { .. } => "start_checkout",
            Self::OpenBillingPortal => "open_billing_portal",
            Self::Entitlements => "entitlements",
        }
    }

    fn group(&self) -> Option<GroupId> {
        match self {
            Self::GetGroup { group }
            | Self::UpdateGroup { group, .. }
            | Self::RegenerateInviteCode { group }
            | Self::DeleteGroup { group }
            | Self::Join { group, .. }
            | Self::Leave { group }
            | Self::Invite { group, .. }
            | Self::ChangeRole { group, .. }
            | Self::TransferOwnership { group, .. }
            | Self::RemoveMember { group, .. }
            | Self::ListMembers { group }
            | Self::Post { group, .. }
            | Self::ListMessages { group } => Some(*group),
            _ => None,
        }
    }

    fn message(&self) -> Option<MessageId> {
        match self {
            Self::Edit { message, .. }
            | Self::SoftDelete { message }
            | Self::GetMessage { message } => Some(*message),
            _ => None,
        }
    }

    fn target_user(&self) -> Option<UserId> {
        match self {
            Self::Invite { user, .. } => Some(*user),
            Self::ChangeRole { target, .. }
            | Self::TransferOwnership { target, .. }
            | Self::RemoveMember { target, .. } => Some(*target),
            _ => None,
        }
    }
}

/// The state an authorization decision depends on, read in the same
/// transaction that will apply the operation.
#[derive(Debug, Clone)]
pub struct Facts {
    pub now: DateTime<Utc>,
    pub features: FeatureSet,
    /// The group the operation targets, or the message's group. `None` when
    /// it does not exist or has been deleted.
    pub group: Option<Group>,
    pub actor_role: Option<Role>,
    pub target_role: Option<Role>,
    /// The actor holds an invitation to `group`.
    pub invited: bool,
    pub message: Option<Message>,
    pub reply_target: Option<Message>,
    /// Assistant questions the actor has asked today (UTC).
    pub questions_today: u32,
}

impl Facts {
    pub fn new(now: DateTime<Utc>, features: FeatureSet) -> Self {
        Self {
            now,
            features,
            group: None,
            actor_role: None,
            target_role: None,
            invited: false,
            message: None,
            reply_target: None,
            questions_today: 0,
        }
    }

    fn load(tx: &Txn<'_>, actor: UserId, op: &Operation, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let subscription = tx.subscription_for(actor)?;
        let mut facts = Self::new(now, entitlement::resolve(subscription.as_ref(), now));

        if let Some(id) = op.message() {
            facts.message = tx.find_message(id)?;
        }

        let group_id = op.group().or(facts.message.as_ref().map(|m| m.group));
        if let Some(id) = group_id {
            facts.group = tx.find_active_group(id)?;
            if facts.group.is_some() {
                facts.actor_role = tx.role_of(id, actor)?;
                if let Some(target) = op.target_user() {
                    facts.target_role = tx.role_of(id, target)?;
                }
                if matches!(op, Operation::Join { .. } | Operation::GetGroup { .. }) {
                    facts.invited = tx.invitation(id, actor)?.is_some();
                }
            }
        }

        if let Operation::Post {
            reply_to: Some(parent),
            ..
        } = op
        {
            facts.reply_target = tx.find_message(*parent)?;
        }

        if matches!(op, Operation::AskAssistant { .. }) {
            facts.questions_today = tx.assistant_questions_on(actor, now.date_naive())?;
        }

        Ok(facts)
    }
}

/// Instance-wide limits that feed into decisions.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub free_daily_ai_questions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Permit,
    Reject(Rejection),
}

impl Decision {
    pub fn is_permit(&self) -> bool {
        matches!(self, Self::Permit)
    }
}

// ---------------------------------------------------------------------------
// The decision function
// ---------------------------------------------------------------------------

/// Decide whether `actor` may perform `op` given `facts`.
pub fn authorize(actor: Option<UserId>, op: &Operation, facts: &Facts, policy: &Policy) -> Decision {
    match check(actor, op, facts, policy) {
        Ok(()) => Decision::Permit,
        Err(rejection) => Decision::Reject(rejection),
    }
}

fn check(actor: Option<UserId>, op: &Operation, facts: &Facts, policy: &Policy) -> Result<(), Rejection> {
    let Some(actor) = actor else {
        return Err(Rejection::unauthenticated());
    };

    match op {
        Operation::CreateGroup { group } => {
            validate_name(&group.name)?;
            validate_description(group.description.as_deref())?;
            if group.is_premium_only {
                require_feature(facts, Feature::PremiumGroups)?;
            }
            Ok(())
        }

        Operation::GetGroup { .. } => {
            let group = active_group(facts)?;
            if group.visibility == Visibility::Public || facts.actor_role.is_some() || facts.invited {
                Ok(())
            } else {
                Err(Rejection::forbidden("only members can view this group"))
            }
        }

        Operation::ListMyGroups
        | Operation::ListDiscoverable
        | Operation::OpenBillingPortal
        | Operation::Entitlements => Ok(()),

        Operation::UpdateGroup { changes, .. } => {
            active_group(facts)?;
            require_owner(facts, "only the owner can change group settings")?;
            if changes.is_empty() {
                return Err(Rejection::invalid("no changes requested"));
            }
            if let Some(name) = &changes.name {
                validate_name(name)?;
            }
            if let Some(description) = &changes.description {
                validate_description(description.as_deref())?;
            }
            if changes.is_premium_only == Some(true) {
                require_feature(facts, Feature::PremiumGroups)?;
            }
            Ok(())
        }

        Operation::RegenerateInviteCode { .. } => {
            let group = active_group(facts)?;
            require_moderator(facts)?;
            if group.visibility != Visibility::InviteOnly {
                return Err(Rejection::invalid("only invite-only groups have an invite code"));
            }
            Ok(())
        }

        Operation::DeleteGroup { .. } => {
            active_group(facts)?;
            require_owner(facts, "only the owner can delete the group")
        }

        Operation::Join { invite_code, .. } => {
            let group = active_group(facts)?;
            if facts.actor_role.is_some() {
                return Err(Rejection::conflict("already a member of this group"));
            }
            match group.visibility {
                Visibility::Public => {}
                Visibility::Private => {
                    if !facts.invited {
                        return Err(Rejection::forbidden("this group is private; an invitation is required"));
                    }
                }
                Visibility::InviteOnly => {
                    let matches = match (group.invite_code.as_deref(), invite_code.as_deref()) {
                        (Some(expected), Some(presented)) => invite_code_matches(expected, presented),
                        _ => false,
                    };
                    if !matches {
                        return Err(Rejection::forbidden("a valid invite code is required"));
                    }
                }
            }
            if group.is_premium_only {
                require_feature(facts, Feature::PremiumGroups)?;
            }
            Ok(())
        }

        Operation::Leave { .. } => {
            active_group(facts)?;
            match facts.actor_role {
                None => Err(Rejection::not_found("not a member of this group")),
                Some(Role::Owner) => Err(Rejection::conflict(
                    "the owner cannot leave; transfer ownership first",
                )),
                Some(_) => Ok(()),
            }
        }

        Operation::Invite { .. } => {
            let group = active_group(facts)?;
            require_moderator(facts)?;
            if group.visibility != Visibility::Private {
                return Err(Rejection::invalid(
                    "invitations apply to private groups; share the group or its invite code instead",
                ));
            }
            if facts.target_role.is_some() {
                return Err(Rejection::conflict("already a member of this group"));
            }
            Ok(())
        }

        Operation::ChangeRole { role, .. } => {
            active_group(facts)?;
            let actor_role = require_member(facts)?;
            let target_role = facts
                .target_role
                .ok_or_else(|| Rejection::not_found("target is not a member of this group"))?;
            if actor_role > target_role && actor_role > *role {
                Ok(())
            } else {
                Err(Rejection::forbidden(format!(
                    "a {actor_role} cannot change a {target_role} to {role}"
                )))
            }
        }

        Operation::TransferOwnership { target, .. } => {
            active_group(facts)?;
            require_owner(facts, "only the owner can transfer ownership")?;
            if facts.target_role.is_none() {
                return Err(Rejection::not_found("target is not a member of this group"));
            }
            if *target == actor {
                return Err(Rejection::invalid("already the owner"));
            }
            Ok(())
        }

        Operation::RemoveMember { target, .. } => {
            active_group(facts)?;
            let actor_role = require_member(facts)?;
            let target_role = facts
                .target_role
                .ok_or_else(|| Rejection::not_found("target is not a member of this group"))?;
            if *target == actor {
                return Err(Rejection::invalid("use leave to remove yourself"));
            }
            if actor_role > target_role {
                Ok(())
            } else {
                Err(Rejection::forbidden(format!("a {actor_role} cannot remove a {target_role}")))
            }
        }

        Operation::ListMembers { .. } => {
            active_group(facts)?;
            require_member(facts)?;
            Ok(())
        }

        Operation::Post {
            kind,
            content,
            reply_to,
            ..
        } => {
            let group = active_group(facts)?;
            if facts.actor_role.is_none() {
                return Err(Rejection::forbidden("only members can post in this group"));
            }
            if let Some(feature) = required_feature(*kind) {
                require_feature(facts, feature)?;
            }
            validate_content(*kind, content)?;
            if reply_to.is_some() {
                match &facts.reply_target {
                    Some(parent) if parent.group == group.id && !parent.is_deleted() => {}
                    _ => {
                        return Err(Rejection::invalid(
                            "reply target is not an active message in this group",
                        ))
                    }
                }
            }
            Ok(())
        }

        Operation::Edit { body, .. } => {
            let message = facts
                .message
                .as_ref()
                .ok_or_else(|| Rejection::not_found("message not found"))?;
            if message.author != actor {
                return Err(Rejection::forbidden("only the author can edit a message"));
            }
            if message.is_deleted() {
                return Err(Rejection::forbidden("deleted messages cannot be edited"));
            }
            validate_body(message.kind, Some(body.as_str()))
        }

        Operation::SoftDelete { .. } => {
            let message = facts
                .message
                .as_ref()
                .ok_or_else(|| Rejection::not_found("message not found"))?;
            let moderates = facts.actor_role.is_some_and(|r| r.can_moderate());
            if message.author == actor || moderates {
                Ok(())
            } else {
                Err(Rejection::forbidden(
                    "only the author or a moderator can delete a message",
                ))
            }
        }

        Operation::ListMessages { .. } => readable(facts),

        Operation::GetMessage { .. } => {
            match &facts.message {
                Some(message) if !message.is_deleted() => {}
                _ => return Err(Rejection::not_found("message not found")),
            }
            readable(facts)
        }

        Operation::AskAssistant { question } => {
            let question = question.trim();
            if question.is_empty() {
                return Err(Rejection::invalid("question cannot be empty"));
            }
            if question.chars().count() > MAX_QUESTION_LEN {
                return Err(Rejection::invalid(format!(
                    "question exceeds {MAX_QUESTION_LEN} characters"
                )));
            }
            if facts.features.contains(Feature::UnlimitedAiGuide)
                || facts.questions_today < policy.free_daily_ai_questions
            {
                Ok(())
            } else {
                Err(Rejection::entitlement(Feature::UnlimitedAiGuide))
            }
        }

        Operation::StartCheckout { tier } => {
            if *tier == Tier::Free {
                return Err(Rejection::invalid("the free plan needs no checkout"));
            }
            if facts.features.tier.at_least(*tier) {
                return Err(Rejection::conflict(format!(
                    "already on the {} plan",
                    facts.features.tier
                )));
            }
            Ok(())
        }
    }
}

fn active_group(facts: &Facts) -> Result<&Group, Rejection> {
    facts
        .group
        .as_ref()
        .ok_or_else(|| Rejection::not_found("group not found"))
}

fn require_member(facts: &Facts) -> Result<Role, Rejection> {
    facts
        .actor_role
        .ok_or_else(|| Rejection::forbidden("not a member of this group"))
}

fn require_moderator(facts: &Facts) -> Result<(), Rejection> {
    match facts.actor_role {
        Some(role) if role.can_moderate() => Ok(()),
        _ => Err(Rejection::forbidden("requires a moderator or the owner")),
    }
}

fn require_owner(facts: &Facts, reason: &str) -> Result<(), Rejection> {
    match facts.actor_role {
        Some(Role::Owner) => Ok(()),
        _ => Err(Rejection::forbidden(reason)),
    }
}

fn require_feature(facts: &Facts, feature: Feature) -> Result<(), Rejection> {
    if facts.features.contains(feature) {
        Ok(())
    } else {
        Err(Rejection::entitlement(feature))
    }
}

// Public groups are readable by any signed-in user, the rest by members.
fn readable(facts: &Facts) -> Result<(), Rejection> {
    let group = active_group(facts)?;
    if group.visibility == Visibility::Public || facts.actor_role.is_some() {
        Ok(())
    } else {
        Err(Rejection::forbidden("only members can read this group"))
    }
}

fn validate_name(name: &str) -> Result<(), Rejection> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Rejection::invalid("group name cannot be empty"));
    }
    if name.chars().count() > MAX_GROUP_NAME_LEN {
        return Err(Rejection::invalid(format!(
            "group name exceeds {MAX_GROUP_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_description(description: Option<&str>) -> Result<(), Rejection> {
    match description {
        Some(d) if d.chars().count() > MAX_GROUP_DESCRIPTION_LEN => Err(Rejection::invalid(
            format!("description exceeds {MAX_GROUP_DESCRIPTION_LEN} characters"),
        )),
        _ => Ok(()),
    }
}

fn validate_body(kind: MessageKind, body: Option<&str>) -> Result<(), Rejection> {
    let body = body.unwrap_or("");
    if kind.requires_body() && body.trim().is_empty() {
        return Err(Rejection::invalid(format!("a {kind} message needs a body")));
    }
    if body.chars().count() > MAX_BODY_LEN {
        return Err(Rejection::invalid(format!(
            "message body exceeds {MAX_BODY_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_content(kind: MessageKind, content: &MessageContent) -> Result<(), Rejection> {
    validate_body(kind, content.body.as_deref())?;
    if kind != MessageKind::Media && content.media_url.is_some() {
        return Err(Rejection::invalid("only media messages carry a media URL"));
    }
    if kind != MessageKind::Verse && !content.verse_refs.is_empty() {
        return Err(Rejection::invalid("only verse messages carry verse references"));
    }
    match kind {
        MessageKind::Verse => {
            if content.verse_refs.is_empty() {
                return Err(Rejection::invalid("a verse message needs at least one reference"));
            }
            if content.verse_refs.len() > MAX_VERSE_REFS {
                return Err(Rejection::invalid(format!(
                    "at most {MAX_VERSE_REFS} verse references per message"
                )));
            }
            if content.verse_refs.iter().any(|r| r.trim().is_empty()) {
                return Err(Rejection::invalid("verse references cannot be blank"));
            }
        }
        MessageKind::Media => match content.media_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => {}
            _ => return Err(Rejection::invalid("a media message needs a URL")),
        },
        MessageKind::Text | MessageKind::Prayer => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// A group as seen by one user. The invite code is only shown to moderators
/// and the owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupView {
    #[serde(flatten)]
    pub group: Group,
    pub role: Option<Role>,
}

impl GroupView {
    fn new(mut group: Group, role: Option<Role>) -> Self {
        if !role.is_some_and(|r| r.can_moderate()) {
            group.invite_code = None;
        }
        Self { group, role }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    /// The message this one replies to has been deleted.
    #[serde(default)]
    pub reply_unavailable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePage {
    /// Oldest first.
    pub messages: Vec<MessageView>,
    /// Pass as `before` to fetch the next older page. `None` at the start of
    /// the history.
    pub next_before: Option<i64>,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

// What a failed transaction attempt produced.
enum Failure {
    Rejected(Rejection),
    Store(StoreError),
}

impl From<StoreError> for Failure {
    fn from(e: StoreError) -> Self {
        Failure::Store(e)
    }
}

impl From<Rejection> for Failure {
    fn from(r: Rejection) -> Self {
        Failure::Rejected(r)
    }
}

struct Ctx<'a> {
    actor: UserId,
    now: DateTime<Utc>,
    facts: &'a Facts,
}

/// Entry point for every operation on groups, memberships and messages.
#[derive(Clone)]
pub struct Gateway {
    db: Arc<Database>,
    assistant: Arc<dyn Assistant>,
    billing: Arc<dyn Billing>,
    policy: Policy,
}

impl Gateway {
    pub fn new(
        db: Arc<Database>,
        assistant: Arc<dyn Assistant>,
        billing: Arc<dyn Billing>,
        policy: Policy,
    ) -> Self {
        Self {
            db,
            assistant,
            billing,
            policy,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Load facts, authorize and apply `op` in one write transaction.
    async fn execute<T, F>(&self, actor: Option<UserId>, op: Operation, apply: F) -> Result<T, Rejection>
    where
        T: Send + 'static,
        F: Fn(&Txn<'_>, &Ctx<'_>) -> Result<T, StoreError> + Send + Sync + 'static,
    {
        let name = op.name();
        let Some(user) = actor else {
            debug!(op = name, "anonymous request rejected");
            return Err(Rejection::unauthenticated());
        };

        let policy = self.policy;
        let now = Utc::now();

        self.transact(name, move |tx| {
            let facts = Facts::load(tx, user, &op, now)?;
            if let Decision::Reject(rejection) = authorize(Some(user), &op, &facts, &policy) {
                debug!(
                    op = name,
                    actor = %user,
                    kind = rejection.kind.as_str(),
                    reason = %rejection.reason,
                    "operation rejected"
                );
                return Err(Failure::Rejected(rejection));
            }
            let ctx = Ctx {
                actor: user,
                now,
                facts: &facts,
            };
            Ok(apply(tx, &ctx)?)
        })
        .await
    }

    /// Run `job` on the blocking pool, retrying once if storage failed in a
    /// way that may succeed on a second attempt.
    async fn transact<T, F>(&self, op: &'static str, job: F) -> Result<T, Rejection>
    where
        T: Send + 'static,
        F: Fn(&Txn<'_>) -> Result<T, Failure> + Send + Sync + 'static,
    {
        let job = Arc::new(job);
        let mut retried = false;

        loop {
            let db = self.db.clone();
            let attempt = job.clone();
            let outcome = tokio::task::spawn_blocking(move || db.write(|tx| (*attempt)(tx))).await;

            let err = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(Failure::Rejected(rejection))) => return Err(rejection),
                Ok(Err(Failure::Store(StoreError::NotFound))) => {
                    return Err(Rejection::not_found("not found"))
                }
                Ok(Err(Failure::Store(StoreError::Conflict(reason)))) => {
                    return Err(Rejection::conflict(reason))
                }
                Ok(Err(Failure::Store(e))) => e,
                Err(join_err) => {
                    error!(op, error = %join_err, "storage task failed");
                    return Err(Rejection::unavailable("storage unavailable, try again"));
                }
            };

            if err.is_transient() && !retried {
                warn!(op, error = %err, "storage failure, retrying once");
                retried = true;
                continue;
            }

            error!(op, error = %err, "storage failure");
            return Err(Rejection::unavailable("storage unavailable, try again"));
        }
    }

    // -- Groups -------------------------------------------------------------

    pub async fn create_group(&self, actor: Option<UserId>, mut group: NewGroup) -> Result<GroupView, Rejection> {
        group.name = group.name.trim().to_string();
        let new = group.clone();
        self.execute(actor, Operation::CreateGroup { group }, move |tx, ctx| {
            let group = tx.create_group(ctx.actor, &new, ctx.now)?;
            Ok(GroupView::new(group, Some(Role::Owner)))
        })
        .await
    }

    pub async fn get_group(&self, actor: Option<UserId>, group: GroupId) -> Result<GroupView, Rejection> {
        self.execute(actor, Operation::GetGroup { group }, |_tx, ctx| {
            let group = ctx.facts.group.clone().ok_or(StoreError::NotFound)?;
            Ok(GroupView::new(group, ctx.facts.actor_role))
        })
        .await
    }

    /// Groups the actor belongs to, most recently active first.
    pub async fn list_my_groups(&self, actor: Option<UserId>) -> Result<Vec<GroupView>, Rejection> {
        self.execute(actor, Operation::ListMyGroups, |tx, ctx| {
            with_roles(tx, ctx.actor, tx.list_groups_for_user(ctx.actor)?)
        })
        .await
    }

    /// Public groups, largest first.
    pub async fn list_discoverable(
        &self,
        actor: Option<UserId>,
        page_size: Option<u32>,
    ) -> Result<Vec<GroupView>, Rejection> {
        let limit = clamp_page_size(page_size);
        self.execute(actor, Operation::ListDiscoverable, move |tx, ctx| {
            with_roles(tx, ctx.actor, tx.list_discoverable_groups(limit)?)
        })
        .await
    }

    pub async fn update_group(
        &self,
        actor: Option<UserId>,
        group: GroupId,
        mut changes: GroupChanges,
    ) -> Result<GroupView, Rejection> {
        if let Some(name) = changes.name.as_mut() {
            *name = name.trim().to_string();
        }
        let update = changes.clone();
        self.execute(actor, Operation::UpdateGroup { group, changes }, move |tx, ctx| {
            let updated = tx.update_group(group, &update, ctx.now)?;
            Ok(GroupView::new(updated, ctx.facts.actor_role))
        })
        .await
    }

    pub async fn regenerate_invite_code(&self, actor: Option<UserId>, group: GroupId) -> Result<String, Rejection> {
        self.execute(actor, Operation::RegenerateInviteCode { group }, move |tx, ctx| {
            tx.rotate_invite_code(group, ctx.now)
        })
        .await
    }

    pub async fn delete_group(&self, actor: Option<UserId>, group: GroupId) -> Result<(), Rejection> {
        self.execute(actor, Operation::DeleteGroup { group }, move |tx, ctx| {
            tx.delete_group(group, ctx.now)
        })
        .await
    }

    // -- Memberships ----------------------------------------------------------

    pub async fn join(
        &self,
        actor: Option<UserId>,
        group: GroupId,
        invite_code: Option<String>,
    ) -> Result<Membership, Rejection> {
        self.execute(actor, Operation::Join { group, invite_code }, move |tx, ctx| {
            tx.take_invitation(group, ctx.actor)?;
            tx.add_member(group, ctx.actor, Role::Member, ctx.now)
        })
        .await
    }

    pub async fn leave(&self, actor: Option<UserId>, group: GroupId) -> Result<(), Rejection> {
        self.execute(actor, Operation::Leave { group }, move |tx, ctx| {
            tx.remove_member(group, ctx.actor, ctx.now).map(|_| ())
        })
        .await
    }

    /// Invite `user` to a private group. Returns `false` if they were already
    /// invited.
    pub async fn invite(&self, actor: Option<UserId>, group: GroupId, user: UserId) -> Result<bool, Rejection> {
        self.execute(actor, Operation::Invite { group, user }, move |tx, ctx| {
            tx.invite(group, user, ctx.actor, ctx.now)
        })
        .await
    }

    pub async fn change_role(
        &self,
        actor: Option<UserId>,
        group: GroupId,
        target: UserId,
        role: Role,
    ) -> Result<Membership, Rejection> {
        self.execute(actor, Operation::ChangeRole { group, target, role }, move |tx, _ctx| {
            tx.set_role(group, target, role)
        })
        .await
    }

    pub async fn transfer_ownership(
        &self,
        actor: Option<UserId>,
        group: GroupId,
        target: UserId,
    ) -> Result<(), Rejection> {
        self.execute(actor, Operation::TransferOwnership { group, target }, move |tx, ctx| {
            tx.transfer_ownership(group, ctx.actor, target, ctx.now)
        })
        .await
    }

    pub async fn remove_member(
        &self,
        actor: Option<UserId>,
        group: GroupId,
        target: UserId,
    ) -> Result<(), Rejection> {
        self.execute(actor, Operation::RemoveMember { group, target }, move |tx, ctx| {
            tx.remove_member(group, target, ctx.now).map(|_| ())
        })
        .await
    }

    pub async fn members(&self, actor: Option<UserId>, group: GroupId) -> Result<Vec<Membership>, Rejection> {
        self.execute(actor, Operation::ListMembers { group }, move |tx, _ctx| {
            tx.list_members(group)
        })
        .await
    }

    // -- Messages -----------------------------------------------------------

    pub async fn post(
        &self,
        actor: Option<UserId>,
        group: GroupId,
        kind: MessageKind,
        content: MessageContent,
        reply_to: Option<MessageId>,
    ) -> Result<MessageView, Rejection> {
        let stored = content.clone();
        let op = Operation::Post {
            group,
            kind,
            content,
            reply_to,
        };
        self.execute(actor, op, move |tx, ctx| {
            let message = tx.insert_message(group, ctx.actor, kind, &stored, reply_to, ctx.now)?;
            Ok(MessageView {
                message,
                reply_unavailable: false,
            })
        })
        .await
    }

    pub async fn edit(&self, actor: Option<UserId>, message: MessageId, body: String) -> Result<MessageView, Rejection> {
        let new_body = body.clone();
        self.execute(actor, Operation::Edit { message, body }, move |tx, ctx| {
            let edited = tx.edit_message(message, &new_body, ctx.now)?;
            view_of(tx, edited)
        })
        .await
    }

    /// Soft-delete a message. Returns `false` if it was already deleted.
    pub async fn soft_delete(&self, actor: Option<UserId>, message: MessageId) -> Result<bool, Rejection> {
        self.execute(actor, Operation::SoftDelete { message }, move |tx, ctx| {
            tx.soft_delete_message(message, ctx.now)
        })
        .await
    }

    /// A page of the newest active messages older than `before`, presented
    /// oldest first.
    pub async fn list_messages(
        &self,
        actor: Option<UserId>,
        group: GroupId,
        page_size: Option<u32>,
        before: Option<i64>,
    ) -> Result<MessagePage, Rejection> {
        let limit = clamp_page_size(page_size);
        self.execute(actor, Operation::ListMessages { group }, move |tx, _ctx| {
            let messages = tx.list_recent_messages(group, limit, before)?;

            let parents: Vec<MessageId> = messages.iter().filter_map(|m| m.reply_to).collect();
            let gone = tx.deleted_among(&parents)?;

            let next_before = match messages.first() {
                Some(oldest) if tx.has_messages_before(group, oldest.seq)? => Some(oldest.seq),
                _ => None,
            };

            let messages = messages
                .into_iter()
                .map(|message| MessageView {
                    reply_unavailable: message.reply_to.is_some_and(|p| gone.contains(&p)),
                    message,
                })
                .collect();

            Ok(MessagePage {
                messages,
                next_before,
            })
        })
        .await
    }

    pub async fn get_message(&self, actor: Option<UserId>, message: MessageId) -> Result<MessageView, Rejection> {
        self.execute(actor, Operation::GetMessage { message }, |tx, ctx| {
            let message = ctx.facts.message.clone().ok_or(StoreError::NotFound)?;
            view_of(tx, message)
        })
        .await
    }

    // -- Entitlements, assistant, billing ----------------------------------

    pub async fn entitlements(&self, actor: Option<UserId>) -> Result<FeatureSet, Rejection> {
        self.execute(actor, Operation::Entitlements, |_tx, ctx| {
            Ok(ctx.facts.features.clone())
        })
        .await
    }

    /// Ask the AI guide. The question is counted against the daily quota
    /// before the guide is called.
    pub async fn ask_assistant(
        &self,
        actor: Option<UserId>,
        question: String,
        prior_turns: Vec<Turn>,
    ) -> Result<Answer, Rejection> {
        let question = question.trim().to_string();
        let op = Operation::AskAssistant {
            question: question.clone(),
        };
        let asked = self
            .execute(actor, op, |tx, ctx| {
                tx.record_assistant_question(ctx.actor, ctx.now.date_naive())
            })
            .await?;
        debug!(asked_today = asked, "assistant question accepted");

        Ok(self.assistant.ask(&question, &prior_turns).await?)
    }

    /// Checkout URL for upgrading to `tier`.
    pub async fn start_checkout(&self, actor: Option<UserId>, tier: Tier) -> Result<String, Rejection> {
        self.execute(actor, Operation::StartCheckout { tier }, |_tx, _ctx| Ok(()))
            .await?;
        let user = actor.ok_or_else(Rejection::unauthenticated)?;
        Ok(self.billing.checkout_url(user, tier).await?)
    }

    pub async fn open_billing_portal(&self, actor: Option<UserId>) -> Result<String, Rejection> {
        self.execute(actor, Operation::OpenBillingPortal, |_tx, _ctx| Ok(()))
            .await?;
        let user = actor.ok_or_else(Rejection::unauthenticated)?;
        Ok(self.billing.portal_url(user).await?)
    }
}

fn with_roles(tx: &Txn<'_>, user: UserId, groups: Vec<Group>) -> Result<Vec<GroupView>, StoreError> {
    groups
        .into_iter()
        .map(|group| {
            let role = tx.role_of(group.id, user)?;
            Ok(GroupView::new(group, role))
        })
        .collect()
}

fn view_of(tx: &Txn<'_>, message: Message) -> Result<MessageView, StoreError> {
    let reply_unavailable = match message.reply_to {
        Some(parent) => !tx.deleted_among(&[parent])?.is_empty(),
        None => false,
    };
    Ok(MessageView {
        message,
        reply_unavailable,
    })
}
