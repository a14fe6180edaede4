//! Subscription tiers and the features they unlock.
//!
//! Everything here is a pure function of a subscription snapshot and the
//! current time. Nothing is stored: a user's entitlements are recomputed from
//! whatever snapshot the payment provider last delivered.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MessageKind, ParseLabelError, UserId};

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Premium,
    Family,
}

impl Tier {
    /// Explicit ordinal used for "this tier or above" comparisons.
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Free => 0,
            Self::Premium => 1,
            Self::Family => 2,
        }
    }

    pub fn at_least(&self, other: Tier) -> bool {
        self.ordinal() >= other.ordinal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Premium => "premium",
            Self::Family => "family",
        }
    }
}

impl FromStr for Tier {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "premium" => Ok(Self::Premium),
            "family" => Ok(Self::Family),
            other => Err(ParseLabelError {
                what: "tier",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Subscription snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Expired => "expired",
        }
    }

    /// Statuses that grant the subscription's tier.
    pub fn grants_access(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            "expired" => Ok(Self::Expired),
            other => Err(ParseLabelError {
                what: "subscription status",
                value: other.to_string(),
            }),
        }
    }
}

/// What the payment provider last told us about a user's plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user: UserId,
    pub tier: Tier,
    pub status: SubscriptionStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl Subscription {
    /// The tier this snapshot grants at `now`. Lapsed, canceled or
    /// out-of-period snapshots grant `Free`.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> Tier {
        if self.status.grants_access() && self.period_start <= now && now < self.period_end {
            self.tier
        } else {
            Tier::Free
        }
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    DailyVerse,
    GroupChat,
    UnlimitedAiGuide,
    AudioBible,
    MediaMessages,
    PremiumGroups,
    FamilyCircles,
    FamilySharing,
}

impl Feature {
    pub const ALL: [Feature; 8] = [
        Feature::DailyVerse,
        Feature::GroupChat,
        Feature::UnlimitedAiGuide,
        Feature::AudioBible,
        Feature::MediaMessages,
        Feature::PremiumGroups,
        Feature::FamilyCircles,
        Feature::FamilySharing,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::DailyVerse => "daily_verse",
            Self::GroupChat => "group_chat",
            Self::UnlimitedAiGuide => "unlimited_ai_guide",
            Self::AudioBible => "audio_bible",
            Self::MediaMessages => "media_messages",
            Self::PremiumGroups => "premium_groups",
            Self::FamilyCircles => "family_circles",
            Self::FamilySharing => "family_sharing",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// Lowest tier that includes this feature.
    pub fn minimum_tier(&self) -> Tier {
        match self {
            Self::DailyVerse | Self::GroupChat => Tier::Free,
            Self::UnlimitedAiGuide
            | Self::AudioBible
            | Self::MediaMessages
            | Self::PremiumGroups => Tier::Premium,
            Self::FamilyCircles | Self::FamilySharing => Tier::Family,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The resolved capabilities of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub tier: Tier,
    pub features: BTreeSet<Feature>,
}

impl FeatureSet {
    pub fn for_tier(tier: Tier) -> Self {
        let features = Feature::ALL
            .into_iter()
            .filter(|f| tier.at_least(f.minimum_tier()))
            .collect();
        Self { tier, features }
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }
}

/// Resolve a user's features. A missing snapshot means `Free`.
pub fn resolve(subscription: Option<&Subscription>, now: DateTime<Utc>) -> FeatureSet {
    let tier = subscription
        .map(|s| s.effective_tier(now))
        .unwrap_or(Tier::Free);
    FeatureSet::for_tier(tier)
}

/// Total lookup: unknown feature names are simply not granted.
pub fn has_feature(tier: Tier, feature: &str) -> bool {
    Feature::from_name(feature)
        .map(|f| tier.at_least(f.minimum_tier()))
        .unwrap_or(false)
}

/// Feature a message kind requires, if any.
pub fn required_feature(kind: MessageKind) -> Option<Feature> {
    match kind {
        MessageKind::Media => Some(Feature::MediaMessages),
        MessageKind::Text | MessageKind::Verse | MessageKind::Prayer => None,
    }
}
