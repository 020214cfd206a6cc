//! Resend paths used when a round-trip watchdog fires.

use crate::bridge::transport::{ChatTransport, TelegramTransport};
use crate::profile::{ProfileStore, read_secret_file};
use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of a resend attempt that did not error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDelivery {
    /// The pending text went out again.
    Sent,
    /// Nowhere to send it (no profile, destination, or credentials).
    Unavailable(String),
}

/// Resends a round trip's pending text to the agent.
#[async_trait]
pub trait RetrySender: Send + Sync {
    async fn resend(&self, session_id: &str, text: &str) -> anyhow::Result<RetryDelivery>;
}

/// Sender that never resends; every watchdog fire becomes `retry_unavailable`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetrySender;

#[async_trait]
impl RetrySender for NoRetrySender {
    async fn resend(&self, _session_id: &str, _text: &str) -> anyhow::Result<RetryDelivery> {
        Ok(RetryDelivery::Unavailable("retries disabled".to_owned()))
    }
}

/// Resends through the chat bound to the active profile.
///
/// The destination and bot token are resolved on every attempt so that a
/// profile switch takes effect without restarting the coordinator.
pub struct ChatRetrySender {
    profiles: Arc<dyn ProfileStore>,
    api_base: String,
    client: reqwest::Client,
}

impl ChatRetrySender {
    #[must_use]
    pub fn new(profiles: Arc<dyn ProfileStore>, api_base: impl Into<String>) -> Self {
        Self {
            profiles,
            api_base: api_base.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl RetrySender for ChatRetrySender {
    async fn resend(&self, session_id: &str, text: &str) -> anyhow::Result<RetryDelivery> {
        let profile = match self.profiles.active_profile() {
            Ok(Some(profile)) => profile,
            Ok(None) => return Ok(RetryDelivery::Unavailable("no active profile".to_owned())),
            Err(e) => {
                return Ok(RetryDelivery::Unavailable(format!(
                    "profile store unreadable: {e}"
                )));
            }
        };
        let Some(chat_id) = profile.chat_id.clone() else {
            return Ok(RetryDelivery::Unavailable(format!(
                "profile `{}` has no bound chat",
                profile.id
            )));
        };
        let Some(token_path) = profile.token_path.as_deref() else {
            return Ok(RetryDelivery::Unavailable(format!(
                "profile `{}` has no token path",
                profile.id
            )));
        };
        let token = match read_secret_file(token_path) {
            Ok(Some(token)) => token,
            Ok(None) => {
                return Ok(RetryDelivery::Unavailable(format!(
                    "token file {} is empty or missing",
                    token_path.display()
                )));
            }
            Err(e) => return Ok(RetryDelivery::Unavailable(e.to_string())),
        };

        let transport = TelegramTransport::with_client(self.client.clone(), &self.api_base, token);
        transport.send_message(&chat_id, text).await?;
        tracing::debug!(session_id, profile = %profile.id, "resent pending text");
        Ok(RetryDelivery::Sent)
    }
}
