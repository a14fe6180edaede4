//! # fellowship-shared
//!
//! Types shared by the store and the server: identifiers, role and
//! visibility enums, the subscription entitlement table, the rejection
//! taxonomy, and signed tokens handed to us by the identity and payment
//! platforms.

pub mod constants;
pub mod entitlement;
pub mod error;
pub mod invite;
pub mod tokens;
pub mod types;

pub use entitlement::{Feature, FeatureSet, Subscription, SubscriptionStatus, Tier};
pub use error::{ErrorKind, Rejection};
pub use types::{GroupId, MessageId, MessageKind, Role, UserId, Visibility};
