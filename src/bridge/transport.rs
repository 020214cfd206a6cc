//! Chat transport trait and the Telegram Bot API long-poll client.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

/// One inbound update from the external chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalUpdate {
    /// Strictly increasing id assigned by the chat service.
    pub update_id: i64,
    pub chat_id: Option<String>,
    pub text: Option<String>,
    /// Epoch seconds the message was sent, when known.
    pub date: Option<i64>,
}

impl ExternalUpdate {
    #[must_use]
    pub fn text(update_id: i64, chat_id: &str, text: &str) -> Self {
        Self {
            update_id,
            chat_id: Some(chat_id.to_owned()),
            text: Some(text.to_owned()),
            date: None,
        }
    }
}

/// Chat transport contract used by the command bridge.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Stable transport identifier (e.g. `telegram`).
    fn id(&self) -> &'static str;

    /// Long-poll for updates after `after` (exclusive), in ascending order.
    async fn fetch_updates(
        &self,
        after: Option<i64>,
        timeout_secs: u64,
    ) -> anyhow::Result<Vec<ExternalUpdate>>;

    /// The most recent update, if any. Transports may discard older
    /// undelivered updates as a side effect; only bootstrap calls this.
    async fn latest_update(&self) -> anyhow::Result<Option<ExternalUpdate>>;

    /// Send a text message to a chat.
    async fn send_message(&self, chat_id: &str, text: &str) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
struct TelegramEnvelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    channel_post: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    date: Option<i64>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: Value,
}

impl From<TelegramUpdate> for ExternalUpdate {
    fn from(update: TelegramUpdate) -> Self {
        let message = update.message.or(update.channel_post);
        let (chat_id, text, date) = match message {
            Some(m) => {
                let chat_id = m.chat.and_then(|c| match c.id {
                    Value::Number(n) => Some(n.to_string()),
                    Value::String(s) => Some(s),
                    _ => None,
                });
                (chat_id, m.text, m.date)
            }
            None => (None, None, None),
        };
        Self {
            update_id: update.update_id,
            chat_id,
            text,
            date,
        }
    }
}

/// Telegram Bot API transport (`getUpdates` long polling + `sendMessage`).
pub struct TelegramTransport {
    api_base: String,
    token: String,
    client: reqwest::Client,
}

impl TelegramTransport {
    #[must_use]
    pub fn new(api_base: &str, token: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_base, token)
    }

    #[must_use]
    pub fn with_client(client: reqwest::Client, api_base: &str, token: String) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_owned(),
            token,
            client,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    async fn get_updates(&self, body: Value, timeout_secs: u64) -> anyhow::Result<Vec<ExternalUpdate>> {
        if self.token.trim().is_empty() {
            anyhow::bail!("telegram bot token is empty");
        }
        let response = self
            .client
            .post(self.method_url("getUpdates"))
            .timeout(Duration::from_secs(timeout_secs.saturating_add(10)))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("telegram getUpdates failed ({status}): {body}");
        }

        let envelope: TelegramEnvelope<Vec<TelegramUpdate>> = response.json().await?;
        if !envelope.ok {
            anyhow::bail!(
                "telegram getUpdates rejected: {}",
                envelope.description.unwrap_or_default()
            );
        }
        let mut updates: Vec<ExternalUpdate> = envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .map(ExternalUpdate::from)
            .collect();
        updates.sort_by_key(|u| u.update_id);
        Ok(updates)
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    fn id(&self) -> &'static str {
        "telegram"
    }

    async fn fetch_updates(
        &self,
        after: Option<i64>,
        timeout_secs: u64,
    ) -> anyhow::Result<Vec<ExternalUpdate>> {
        let mut body = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message", "channel_post"],
        });
        if let Some(after) = after {
            body["offset"] = json!(after.saturating_add(1));
        }
        self.get_updates(body, timeout_secs).await
    }

    async fn latest_update(&self) -> anyhow::Result<Option<ExternalUpdate>> {
        // A negative offset returns only the newest update and makes Telegram
        // forget everything before it. Bootstrap skips that backlog anyway.
        let body = json!({"offset": -1, "limit": 1, "timeout": 0});
        Ok(self.get_updates(body, 0).await?.pop())
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
        });
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("telegram send failed ({status}): {body}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn fetch_updates_maps_messages_and_requests_next_offset() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottok/getUpdates"))
            .and(body_partial_json(json!({"offset": 11, "timeout": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [
                    {"update_id": 13, "message": {"date": 1700000001, "chat": {"id": -1001}, "text": "#faye_ping"}},
                    {"update_id": 12, "channel_post": {"date": 1700000000, "chat": {"id": "55"}, "text": "hi"}},
                    {"update_id": 14, "edited_message": {"text": "ignored"}}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = TelegramTransport::new(&server.uri(), "tok".to_owned());
        let updates = transport.fetch_updates(Some(10), 5).await.unwrap();

        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].update_id, 12);
        assert_eq!(updates[0].chat_id.as_deref(), Some("55"));
        assert_eq!(updates[1].chat_id.as_deref(), Some("-1001"));
        assert_eq!(updates[1].text.as_deref(), Some("#faye_ping"));
        assert_eq!(updates[1].date, Some(1_700_000_001));
        assert!(updates[2].text.is_none());
    }

    #[tokio::test]
    async fn latest_update_returns_tail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottok/getUpdates"))
            .and(body_partial_json(json!({"offset": -1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": true,
                "result": [{"update_id": 99, "message": {"date": 5, "chat": {"id": 1}, "text": "x"}}]
            })))
            .mount(&server)
            .await;

        let transport = TelegramTransport::new(&server.uri(), "tok".to_owned());
        let latest = transport.latest_update().await.unwrap().unwrap();
        assert_eq!(latest.update_id, 99);
    }

    #[tokio::test]
    async fn rejected_envelope_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ok": false,
                "description": "Conflict"
            })))
            .mount(&server)
            .await;

        let transport = TelegramTransport::new(&server.uri(), "tok".to_owned());
        let err = transport.fetch_updates(None, 0).await.unwrap_err();
        assert!(err.to_string().contains("Conflict"));
    }

    #[tokio::test]
    async fn empty_token_is_rejected_before_any_request() {
        let transport = TelegramTransport::new("http://127.0.0.1:9", "  ".to_owned());
        assert!(transport.fetch_updates(None, 0).await.is_err());
    }

    #[tokio::test]
    async fn send_message_posts_chat_and_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bottok/sendMessage"))
            .and(body_partial_json(json!({"chat_id": "42", "text": "#faye_pong status=online"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let transport = TelegramTransport::new(&format!("{}/", server.uri()), "tok".to_owned());
        transport
            .send_message("42", "#faye_pong status=online")
            .await
            .unwrap();
    }
}
