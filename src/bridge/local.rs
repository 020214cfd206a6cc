//! Local host services the bridge drives over HTTP.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;

/// Local process a restart action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTarget {
    Listener,
    Bridge,
}

impl RestartTarget {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Bridge => "bridge",
        }
    }
}

/// Side-effecting local endpoints the bridge drives.
#[async_trait]
pub trait LocalServices: Send + Sync {
    /// Speak `text` aloud, attributed to `session_id` when known.
    async fn speak(&self, text: &str, session_id: Option<&str>) -> anyhow::Result<()>;

    async fn activate_profile(&self, profile_id: &str) -> anyhow::Result<()>;

    async fn restart(&self, target: RestartTarget) -> anyhow::Result<()>;

    /// Free-form health summary; read only.
    async fn health_summary(&self) -> anyhow::Result<Value>;
}

/// [`LocalServices`] over the local HTTP API.
///
/// - `POST /speak` `{"text", "session_id"}`
/// - `POST /profiles/{id}/activate`
/// - `POST /listener/restart`, `POST /bridge/restart`
/// - `GET /health/summary`
pub struct LocalApiClient {
    base_url: String,
    client: reqwest::Client,
}

const LOCAL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl LocalApiClient {
    #[must_use]
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, route: &str, body: Value) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}{route}", self.base_url))
            .timeout(LOCAL_REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("local {route} failed ({status}): {body}");
        }
        Ok(())
    }
}

#[async_trait]
impl LocalServices for LocalApiClient {
    async fn speak(&self, text: &str, session_id: Option<&str>) -> anyhow::Result<()> {
        self.post("/speak", json!({"text": text, "session_id": session_id}))
            .await
    }

    async fn activate_profile(&self, profile_id: &str) -> anyhow::Result<()> {
        if profile_id.contains('/') {
            anyhow::bail!("invalid profile id `{profile_id}`");
        }
        self.post(&format!("/profiles/{profile_id}/activate"), json!({}))
            .await
    }

    async fn restart(&self, target: RestartTarget) -> anyhow::Result<()> {
        self.post(&format!("/{}/restart", target.as_str()), json!({}))
            .await
    }

    async fn health_summary(&self) -> anyhow::Result<Value> {
        let response = self
            .client
            .get(format!("{}/health/summary", self.base_url))
            .timeout(LOCAL_REQUEST_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("local health summary failed ({status})");
        }
        Ok(response.json().await?)
    }
}
