//! Billing provider boundary: hosted checkout and customer portal links.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fellowship_shared::{Tier, UserId};

use crate::upstream::UpstreamError;

#[async_trait]
pub trait Billing: Send + Sync {
    /// Where to send the user to buy `tier`.
    async fn checkout_url(&self, user: UserId, tier: Tier) -> Result<String, UpstreamError>;

    /// Where the user manages or cancels an existing plan.
    async fn portal_url(&self, user: UserId) -> Result<String, UpstreamError>;
}

#[derive(Serialize)]
struct CheckoutRequest {
    user: UserId,
    tier: Tier,
}

#[derive(Serialize)]
struct PortalRequest {
    user: UserId,
}

#[derive(Deserialize)]
struct RedirectResponse {
    url: String,
}

pub struct HttpBilling {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBilling {
    pub fn new(base_url: impl Into<String>) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn redirect<B: Serialize + Sync>(&self, path: &str, body: &B) -> Result<String, UpstreamError> {
        let resp = self
            .client
            .post(format!("{}/{}", self.base_url, path))
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(UpstreamError::Status(resp.status().as_u16()));
        }

        Ok(resp.json::<RedirectResponse>().await?.url)
    }
}

#[async_trait]
impl Billing for HttpBilling {
    async fn checkout_url(&self, user: UserId, tier: Tier) -> Result<String, UpstreamError> {
        self.redirect("checkout", &CheckoutRequest { user, tier }).await
    }

    async fn portal_url(&self, user: UserId) -> Result<String, UpstreamError> {
        self.redirect("portal", &PortalRequest { user }).await
    }
}

/// Used when no `BILLING_URL` is configured.
pub struct DisabledBilling;

#[async_trait]
impl Billing for DisabledBilling {
    async fn checkout_url(&self, _user: UserId, _tier: Tier) -> Result<String, UpstreamError> {
        Err(UpstreamError::NotConfigured("billing"))
    }

    async fn portal_url(&self, _user: UserId) -> Result<String, UpstreamError> {
        Err(UpstreamError::NotConfigured("billing"))
    }
}
