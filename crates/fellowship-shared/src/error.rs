use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entitlement::Feature;

/// Stable, machine-readable rejection category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    InvalidArgument,
    Unavailable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::InvalidArgument => "invalid_argument",
            Self::Unavailable => "unavailable",
        }
    }

    /// Only transient storage failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Why an operation was refused.
///
/// `feature` is set only for entitlement denials so callers can offer an
/// upgrade instead of a plain error.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}: {reason}", kind.as_str())]
pub struct Rejection {
    pub kind: ErrorKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<Feature>,
}

impl Rejection {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            feature: None,
        }
    }

    pub fn unauthenticated() -> Self {
        Self::new(ErrorKind::Unauthenticated, "sign in required")
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, reason)
    }

    pub fn entitlement(feature: Feature) -> Self {
        Self {
            kind: ErrorKind::Forbidden,
            reason: format!(
                "requires the {} feature ({} plan or above)",
                feature,
                feature.minimum_tier()
            ),
            feature: Some(feature),
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, reason)
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, reason)
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, reason)
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, reason)
    }

    pub fn is_entitlement(&self) -> bool {
        self.kind == ErrorKind::Forbidden && self.feature.is_some()
    }
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token has expired")]
    Expired,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid token format")]
    InvalidFormat,

    #[error("Invalid key bytes")]
    InvalidKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entitlement_rejection_names_the_feature() {
        let r = Rejection::entitlement(Feature::MediaMessages);
        assert_eq!(r.kind, ErrorKind::Forbidden);
        assert!(r.is_entitlement());
        assert!(r.reason.contains("media_messages"));
        assert!(r.reason.contains("premium"));
    }

    #[test]
    fn display_is_kind_then_reason() {
        let r = Rejection::conflict("already a member");
        assert_eq!(r.to_string(), "conflict: already a member");
        assert!(!r.kind.is_retryable());
    }
}
