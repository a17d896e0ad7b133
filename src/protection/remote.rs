use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::protection::settings::Settings;
use crate::protection::state::DailyState;

/// Server copy of a user's settings and daily state, as received.
///
/// Both parts stay raw so they go through the same normalization as local
/// input.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteSnapshot {
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub state: Value,
}

/// Body of a sync request
#[derive(Debug, Clone, Serialize)]
pub struct RemotePayload {
    pub settings: Settings,
    pub state: DailyState,
}

/// Server-side storage of usage protection data for authenticated users
#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    /// Fetch the stored snapshot. `Ok(None)` means the server has nothing usable.
    async fn fetch(&self, user_id: &str) -> Result<Option<RemoteSnapshot>>;

    /// Store the current settings and state
    async fn push(&self, user_id: &str, payload: &RemotePayload) -> Result<()>;
}

/// Connection settings for [`HttpSyncClient`]
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteConfig {
    /// API root, e.g. `https://api.example.com/v1`
    pub base_url: String,

    /// Bearer token for the authenticated session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchEnvelope {
    #[serde(default)]
    status: Value,
    #[serde(default)]
    usage_protection: Option<RemoteSnapshot>,
}

impl FetchEnvelope {
    fn into_snapshot(self) -> Option<RemoteSnapshot> {
        let ok = self
            .status
            .as_f64()
            .is_some_and(|status| (200.0..300.0).contains(&status));
        if ok { self.usage_protection } else { None }
    }
}

/// `RemoteSyncClient` over HTTPS
pub struct HttpSyncClient {
    client: Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HttpSyncClient {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).context("Invalid remote base URL")?;

        if base_url.scheme() != "https" {
            anyhow::bail!("Remote URL must use HTTPS (got: {})", base_url.scheme());
        }

        if base_url.cannot_be_a_base() {
            anyhow::bail!("Remote URL cannot be used as a base: {}", base_url);
        }

        let client = Client::builder()
            .user_agent(format!("usage-protection/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout))
            .https_only(true)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            access_token: config.access_token,
        })
    }

    /// `{base}/user/usage-protection/{userId}`
    fn endpoint(&self, user_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Remote URL cannot be used as a base"))?
            .pop_if_empty()
            .extend(["user", "usage-protection", user_id]);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteSyncClient for HttpSyncClient {
    async fn fetch(&self, user_id: &str) -> Result<Option<RemoteSnapshot>> {
        let url = self.endpoint(user_id)?;
        tracing::debug!("Fetching usage protection from: {}", url);

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .context("Failed to connect to usage protection server")?
            .error_for_status()
            .context("Usage protection server rejected fetch")?;

        let envelope: FetchEnvelope = response
            .json()
            .await
            .context("Failed to parse usage protection response")?;

        Ok(envelope.into_snapshot())
    }

    async fn push(&self, user_id: &str, payload: &RemotePayload) -> Result<()> {
        let url = self.endpoint(user_id)?;
        tracing::debug!("Pushing usage protection to: {}", url);

        self.authorize(self.client.post(url))
            .json(payload)
            .send()
            .await
            .context("Failed to connect to usage protection server")?
            .error_for_status()
            .context("Usage protection server rejected sync")?;

        Ok(())
    }
}
