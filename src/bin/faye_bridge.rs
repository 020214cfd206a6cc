//! Command bridge daemon.
//!
//! Wires one event hub to the round-trip coordinator, the conversation
//! session manager, and the Telegram command bridge, then polls until
//! Ctrl-C. The bot token and default chat come from the active profile.
//!
//! All tracing output goes to stderr.

use anyhow::Context;
use faye::bridge::{CommandBridge, LocalApiClient, TelegramTransport};
use faye::config::FayeConfig;
use faye::conversation::ConversationSessionManager;
use faye::events::EventHub;
use faye::profile::{JsonProfileStore, ProfileStore, read_secret_file};
use faye::roundtrip::{ChatRetrySender, RoundTripCoordinator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config_path = FayeConfig::default_config_path();
    let mut config = if config_path.exists() {
        FayeConfig::from_file(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?
    } else {
        tracing::info!(path = %config_path.display(), "no config file; using defaults");
        FayeConfig::default()
    };

    let profiles = Arc::new(JsonProfileStore::new(config.profiles.resolved_path()));
    let profile = profiles
        .active_profile()?
        .with_context(|| format!("no active profile in {}", profiles.path().display()))?;
    let token_path = profile
        .token_path
        .as_deref()
        .with_context(|| format!("profile `{}` has no token path", profile.id))?;
    let token = read_secret_file(token_path)?
        .with_context(|| format!("token file {} is empty or missing", token_path.display()))?;
    if config.bridge.chat_id.is_none() {
        config.bridge.chat_id = profile.chat_id.clone();
    }

    let hub = EventHub::new(config.events.history_capacity);
    let retry_sender = Arc::new(ChatRetrySender::new(
        profiles.clone(),
        config.bridge.telegram_api_url.clone(),
    ));
    let coordinator = RoundTripCoordinator::new(config.roundtrip.clone(), hub.clone(), retry_sender);
    let conversations = ConversationSessionManager::new(config.conversation.clone(), hub.clone());
    let _coordinator_subscription = coordinator.attach();
    let _conversation_subscription = conversations.attach();

    let transport = Arc::new(TelegramTransport::new(
        &config.bridge.telegram_api_url,
        token,
    ));
    let local = Arc::new(LocalApiClient::new(&config.bridge.local_api_url));
    let bridge = CommandBridge::new(config.bridge.clone(), hub, transport, local);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for Ctrl-C");
            return;
        }
        tracing::info!("shutdown requested");
        shutdown.cancel();
    });

    tracing::info!(profile = %profile.id, "faye-bridge starting");
    bridge.run(cancel).await.map_err(|e| {
        tracing::error!(error = %e, "faye-bridge exited with error");
        anyhow::anyhow!("faye-bridge failed: {e}")
    })?;

    let snapshot = coordinator.snapshot();
    tracing::info!(
        completed = snapshot.totals.completed,
        retries = snapshot.totals.retries_sent,
        timeouts = snapshot.totals.timeouts,
        conversations = conversations.snapshot().tracked_sessions,
        "faye-bridge shut down cleanly"
    );
    Ok(())
}
