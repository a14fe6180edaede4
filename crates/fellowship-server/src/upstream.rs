use thiserror::Error;

use fellowship_shared::Rejection;

/// Failure talking to an external collaborator (AI guide, billing).
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{0} is not configured on this instance")]
    NotConfigured(&'static str),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned status {0}")]
    Status(u16),
}

impl From<UpstreamError> for Rejection {
    fn from(e: UpstreamError) -> Self {
        tracing::warn!(error = %e, "upstream call failed");
        Rejection::unavailable(e.to_string())
    }
}
