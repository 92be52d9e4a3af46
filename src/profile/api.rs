//! Backend profile API: fetch, role switch, onboarding completion.
//!
//! ERROR HANDLING
//! ==============
//! Network failures, 429 and 5xx map to [`HydrationError::Transient`] and are
//! retried once by the hydrator. 401 maps to `Unauthorized` so the caller can
//! refresh the provider token. Every other status is a terminal `Rejected`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::HydrationError;
use crate::config::ProfileApiConfig;
use crate::identity::provider::ProviderSession;
use crate::roles::Capability;

/// `GET /profile` response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileResponse {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub current_role: Option<String>,
    #[serde(default)]
    pub is_onboarded: bool,
    #[serde(default)]
    pub venue: Option<serde_json::Value>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Serialize)]
struct RoleSwitchBody<'a> {
    role: &'a str,
}

/// Backend profile endpoints. All calls are idempotent under repeated identical payloads.
#[async_trait]
pub trait ProfileApi: Send + Sync {
    async fn fetch_profile(&self, session: &ProviderSession) -> Result<ProfileResponse, HydrationError>;

    async fn switch_role(&self, session: &ProviderSession, role: &str) -> Result<(), HydrationError>;

    async fn complete_onboarding(
        &self,
        session: &ProviderSession,
        payload: &serde_json::Value,
    ) -> Result<(), HydrationError>;
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct HttpProfileApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpProfileApi {
    /// Build a client with the configured request and connect timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &ProfileApiConfig) -> Result<Self, HydrationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| HydrationError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: config.base_url.trim_end_matches('/').to_string() })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(request: reqwest::RequestBuilder, session: &ProviderSession) -> reqwest::RequestBuilder {
        match &session.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ProfileApi for HttpProfileApi {
    async fn fetch_profile(&self, session: &ProviderSession) -> Result<ProfileResponse, HydrationError> {
        let resp = Self::authorize(self.http.get(self.url("/profile")), session)
            .send()
            .await
            .map_err(|e| HydrationError::Transient(e.to_string()))?;
        let resp = check_status(resp).await?;
        resp.json::<ProfileResponse>()
            .await
            .map_err(|e| HydrationError::Parse(e.to_string()))
    }

    async fn switch_role(&self, session: &ProviderSession, role: &str) -> Result<(), HydrationError> {
        let resp = Self::authorize(self.http.patch(self.url("/profile/role")), session)
            .json(&RoleSwitchBody { role })
            .send()
            .await
            .map_err(|e| HydrationError::Transient(e.to_string()))?;
        check_status(resp).await.map(drop)
    }

    async fn complete_onboarding(
        &self,
        session: &ProviderSession,
        payload: &serde_json::Value,
    ) -> Result<(), HydrationError> {
        let resp = Self::authorize(self.http.post(self.url("/onboarding/complete")), session)
            .json(payload)
            .send()
            .await
            .map_err(|e| HydrationError::Transient(e.to_string()))?;
        check_status(resp).await.map(drop)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, HydrationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(classify_status(status.as_u16(), body))
}

pub(crate) fn classify_status(status: u16, body: String) -> HydrationError {
    match status {
        401 => HydrationError::Unauthorized,
        429 | 500..=599 => HydrationError::Transient(format!("status {status}: {body}")),
        _ => HydrationError::Rejected { status, body },
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;
