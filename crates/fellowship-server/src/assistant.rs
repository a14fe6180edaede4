//! AI guide boundary.
//!
//! The gateway only decides whether a question may be asked. Answering is
//! delegated to an [`Assistant`] implementation, normally [`HttpAssistant`]
//! talking JSON to the guide service.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::upstream::UpstreamError;

/// One earlier exchange, sent back to the guide for context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    /// Scripture references the answer draws on.
    #[serde(default)]
    pub citations: Vec<String>,
}

#[async_trait]
pub trait Assistant: Send + Sync {
    async fn ask(&self, question: &str, prior_turns: &[Turn]) -> Result<Answer, UpstreamError>;
}

#[derive(Serialize)]
struct AskRequest<'a> {
    question: &'a str,
    prior_turns: &'a [Turn],
}

/// Talks to the guide service at `{base_url}/ask`.
pub struct HttpAssistant {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAssistant {
    pub fn new(base_url: impl Into<String>) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Assistant for HttpAssistant {
    async fn ask(&self, question: &str, prior_turns: &[Turn]) -> Result<Answer, UpstreamError> {
        let resp = self
            .client
            .post(format!("{}/ask", self.base_url))
            .json(&AskRequest {
                question,
                prior_turns,
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(UpstreamError::Status(resp.status().as_u16()));
        }

        let answer = resp.json::<Answer>().await?;
        tracing::debug!(citations = answer.citations.len(), "assistant answered");
        Ok(answer)
    }
}

/// Used when no `ASSISTANT_URL` is configured.
pub struct DisabledAssistant;

#[async_trait]
impl Assistant for DisabledAssistant {
    async fn ask(&self, _question: &str, _prior_turns: &[Turn]) -> Result<Answer, UpstreamError> {
        Err(UpstreamError::NotConfigured("assistant"))
    }
}
