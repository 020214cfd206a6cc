//! Command bridge between an external chat and local side effects.
//!
//! The bridge long-polls the chat for updates, parses tagged commands, runs
//! each side effect at most once, and replies with an acknowledgment. Per
//! command the order is fixed: side effect, mark the idempotency key, ack
//! and event, then persist the offset. A crash anywhere in between either
//! replays an unmarked command or skips a marked one; a marked command is
//! never executed twice.

pub mod command;
pub mod local;
pub mod state;
pub mod transport;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::events::{EventHub, EventKind};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use command::{ActionCommand, BridgeCommand, SpeakCommand, parse_command};
pub use local::{LocalApiClient, LocalServices, RestartTarget};
pub use state::{BridgeState, RuntimeState, RuntimeStatus, RuntimeStatusStore, backoff_ms};
pub use transport::{ChatTransport, ExternalUpdate, TelegramTransport};

/// Pause after an empty poll so a transport that returns immediately does
/// not spin.
const IDLE_POLL_PAUSE: Duration = Duration::from_millis(250);

/// Per-batch tally returned by [`CommandBridge::process_updates`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub duplicates: usize,
    /// Destructive actions held back for confirmation.
    pub blocked: usize,
    /// Non-command, malformed, or foreign-chat updates.
    pub skipped: usize,
    pub errors: usize,
    /// Offset after the batch.
    pub offset: Option<i64>,
}

impl BatchReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Processed => self.processed += 1,
            Outcome::Duplicate => self.duplicates += 1,
            Outcome::Blocked => self.blocked += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.errors += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Processed,
    Duplicate,
    Blocked,
    Skipped,
    Failed,
}

pub struct CommandBridge {
    config: BridgeConfig,
    hub: EventHub,
    transport: Arc<dyn ChatTransport>,
    local: Arc<dyn LocalServices>,
    state: tokio::sync::Mutex<BridgeState>,
    status: Mutex<RuntimeStatusStore>,
}

impl CommandBridge {
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        hub: EventHub,
        transport: Arc<dyn ChatTransport>,
        local: Arc<dyn LocalServices>,
    ) -> Self {
        let state_dir = config.resolved_state_dir();
        Self {
            state: tokio::sync::Mutex::new(BridgeState::new(
                &state_dir,
                config.processed_key_capacity,
            )),
            status: Mutex::new(RuntimeStatusStore::new(&state_dir)),
            config,
            hub,
            transport,
            local,
        }
    }

    /// Last fully consumed update id.
    pub async fn offset(&self) -> Option<i64> {
        self.state.lock().await.offset()
    }

    #[must_use]
    pub fn runtime_status(&self) -> RuntimeStatus {
        self.status_store().current().clone()
    }

    fn status_store(&self) -> MutexGuard<'_, RuntimeStatusStore> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_status(&self, change: impl FnOnce(&mut RuntimeStatus)) {
        self.status_store().update(change);
    }

    /// Choose a starting offset on first run.
    pub async fn bootstrap_offset(&self) -> Result<Option<i64>> {
        self.bootstrap_offset_at(chrono::Utc::now().timestamp()).await
    }

    /// [`Self::bootstrap_offset`] with an explicit clock (epoch seconds).
    ///
    /// With a stored offset nothing changes. Otherwise the latest update is
    /// skipped, unless it is younger than `bootstrap_recent_secs`, in which
    /// case it is replayed once.
    pub async fn bootstrap_offset_at(&self, now_secs: i64) -> Result<Option<i64>> {
        let mut state = self.state.lock().await;
        if let Some(offset) = state.offset() {
            debug!(offset, "bridge offset restored");
            return Ok(Some(offset));
        }

        let latest = self
            .transport
            .latest_update()
            .await
            .map_err(|e| BridgeError::Transport(format!("latest update: {e:#}")))?;
        let Some(latest) = latest else {
            info!("no prior updates; bridge starts from the beginning");
            return Ok(None);
        };

        let recent_secs = i64::try_from(self.config.bootstrap_recent_secs).unwrap_or(i64::MAX);
        let recent = latest
            .date
            .is_some_and(|date| now_secs.saturating_sub(date) <= recent_secs);
        let offset = if recent {
            latest.update_id.saturating_sub(1)
        } else {
            latest.update_id
        };
        state.advance_offset(offset)?;
        info!(
            offset,
            latest = latest.update_id,
            replay_latest = recent,
            "bridge offset bootstrapped"
        );
        Ok(Some(offset))
    }

    /// Process one ordered batch. The offset is persisted after every update;
    /// a failure to persist either a processed key or the offset aborts the
    /// batch with an error before anything later is acknowledged.
    pub async fn process_updates(&self, updates: &[ExternalUpdate]) -> Result<BatchReport> {
        let mut state = self.state.lock().await;
        let mut report = BatchReport {
            offset: state.offset(),
            ..BatchReport::default()
        };

        for update in updates {
            let outcome = self.process_update(&mut state, update).await?;
            report.record(outcome);
            // A key that failed to persist earlier must be durable before the
            // offset moves past its update.
            state.flush_keys()?;
            state.advance_offset(update.update_id)?;
            report.offset = state.offset();
        }
        drop(state);

        if !updates.is_empty() {
            info!(
                processed = report.processed,
                duplicates = report.duplicates,
                blocked = report.blocked,
                skipped = report.skipped,
                errors = report.errors,
                offset = ?report.offset,
                "bridge batch done"
            );
        }
        Ok(report)
    }

    /// Fetch one batch from the current offset and process it.
    pub async fn poll_once(&self) -> Result<BatchReport> {
        let updates = self.fetch_batch().await?;
        self.process_updates(&updates).await
    }

    async fn fetch_batch(&self) -> Result<Vec<ExternalUpdate>> {
        let after = self.offset().await;
        self.transport
            .fetch_updates(after, self.config.poll_timeout_secs)
            .await
            .map_err(|e| BridgeError::Transport(format!("fetch updates: {e:#}")))
    }

    /// Poll until `cancel` fires.
    ///
    /// Errors back off exponentially up to `max_backoff_ms`; the runtime
    /// status file is rewritten every cycle.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.update_status(|s| {
            s.state = RuntimeState::Starting;
            s.consecutive_errors = 0;
            s.backoff_ms = 0;
        });
        info!(transport = self.transport.id(), "command bridge started");

        let mut bootstrapped = false;
        let mut consecutive_errors: u32 = 0;

        loop {
            let pause = match self.cycle(&cancel, &mut bootstrapped).await {
                Ok(None) => break,
                Ok(Some(report)) => {
                    consecutive_errors = 0;
                    let offset = report.offset;
                    self.update_status(|s| {
                        s.state = RuntimeState::Idle;
                        s.consecutive_errors = 0;
                        s.backoff_ms = 0;
                        s.offset = offset;
                    });
                    let idle = report == BatchReport { offset, ..BatchReport::default() };
                    idle.then_some(IDLE_POLL_PAUSE)
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let backoff = backoff_ms(consecutive_errors, self.config.max_backoff_ms);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_ms = backoff,
                        "bridge poll failed"
                    );
                    let message = e.to_string();
                    self.update_status(|s| {
                        s.state = RuntimeState::Error;
                        s.consecutive_errors = consecutive_errors;
                        s.backoff_ms = backoff;
                        s.last_error = Some(message);
                    });
                    Some(Duration::from_millis(backoff))
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(pause) => {}
                }
            }
        }

        self.update_status(|s| s.state = RuntimeState::Idle);
        info!("command bridge stopped");
        Ok(())
    }

    /// One poll cycle. `Ok(None)` means cancelled; processing itself is
    /// never interrupted once a batch has been fetched.
    async fn cycle(
        &self,
        cancel: &CancellationToken,
        bootstrapped: &mut bool,
    ) -> Result<Option<BatchReport>> {
        if !*bootstrapped {
            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                result = self.bootstrap_offset() => { result?; }
            }
            *bootstrapped = true;
        }

        let updates = tokio::select! {
            () = cancel.cancelled() => return Ok(None),
            result = self.fetch_batch() => result?,
        };
        if !updates.is_empty() {
            self.update_status(|s| s.state = RuntimeState::Processing);
        }
        self.process_updates(&updates).await.map(Some)
    }

    async fn process_update(
        &self,
        state: &mut BridgeState,
        update: &ExternalUpdate,
    ) -> Result<Outcome> {
        let Some(text) = update.text.as_deref() else {
            return Ok(Outcome::Skipped);
        };
        let Some(parsed) = parse_command(text) else {
            debug!(update_id = update.update_id, "ignoring non-command update");
            return Ok(Outcome::Skipped);
        };
        if let Some(expected) = self.config.chat_id.as_deref()
            && update.chat_id.as_deref() != Some(expected)
        {
            warn!(
                update_id = update.update_id,
                chat_id = ?update.chat_id,
                "ignoring command from unbound chat"
            );
            return Ok(Outcome::Skipped);
        }

        let key = parsed.idempotency_key(update.update_id);
        let chat = update.chat_id.as_deref();
        if state.is_processed(&key) {
            self.report_duplicate(&parsed, &key, chat).await;
            return Ok(Outcome::Duplicate);
        }

        debug!(update_id = update.update_id, command = parsed.label(), %key, "executing command");
        match parsed {
            BridgeCommand::Speak(cmd) => self.run_speak(state, &key, cmd, chat).await,
            BridgeCommand::Action(cmd) => self.run_action(state, &key, cmd, chat).await,
            BridgeCommand::ActivateProfile { profile_id } => {
                self.run_activate(state, &key, &profile_id, chat).await
            }
            BridgeCommand::Ping => {
                mark(state, &key)?;
                self.ack(chat, command::pong_ack()).await;
                self.hub
                    .emit(EventKind::BridgePing, json!({"status": "online"}));
                Ok(Outcome::Processed)
            }
        }
    }

    async fn run_speak(
        &self,
        state: &mut BridgeState,
        key: &str,
        cmd: SpeakCommand,
        chat: Option<&str>,
    ) -> Result<Outcome> {
        let session = cmd.session_id.as_deref();
        self.hub.emit(
            EventKind::BridgeSpeakReceived,
            json!({"session_id": session, "turn": cmd.turn, "text": cmd.text}),
        );

        match self.local.speak(&cmd.text, session).await {
            Ok(()) => {
                mark(state, key)?;
                self.ack(chat, command::spoken_ack("ok", session)).await;
                self.hub.emit(
                    EventKind::BridgeSpoken,
                    json!({"session_id": session, "turn": cmd.turn, "status": "ok"}),
                );
                Ok(Outcome::Processed)
            }
            Err(e) => {
                warn!(session_id = ?session, error = %e, "local speak failed");
                self.ack(chat, command::spoken_ack("error", session)).await;
                self.hub.emit(
                    EventKind::BridgeSpoken,
                    json!({
                        "session_id": session,
                        "turn": cmd.turn,
                        "status": "error",
                        "reason": "speak_failed",
                    }),
                );
                Ok(Outcome::Failed)
            }
        }
    }

    async fn run_action(
        &self,
        state: &mut BridgeState,
        key: &str,
        cmd: ActionCommand,
        chat: Option<&str>,
    ) -> Result<Outcome> {
        let session = cmd.session_id.as_deref();
        self.hub.emit(
            EventKind::BridgeActionRequested,
            json!({
                "name": cmd.name,
                "session_id": session,
                "nonce": cmd.nonce,
                "confirm": cmd.confirm,
            }),
        );

        if cmd.is_destructive() && !cmd.confirm {
            info!(action = %cmd.name, "destructive action needs confirmation");
            self.ack(
                chat,
                command::action_result_ack(
                    &cmd.name,
                    "needs_confirm",
                    "confirmation_required",
                    session,
                ),
            )
            .await;
            self.hub.emit(
                EventKind::BridgeActionBlocked,
                json!({
                    "name": cmd.name,
                    "session_id": session,
                    "nonce": cmd.nonce,
                    "status": "needs_confirm",
                    "reason": "confirmation_required",
                }),
            );
            return Ok(Outcome::Blocked);
        }

        let (status, reason) = match cmd.name.as_str() {
            "health" => match self.local.health_summary().await {
                Ok(summary) => ("ok", health_reason(&summary)),
                Err(e) => {
                    warn!(error = %e, "health summary failed");
                    ("error", "health_unavailable".to_owned())
                }
            },
            "listener_restart" => self.restart(RestartTarget::Listener).await,
            "bridge_restart" => self.restart(RestartTarget::Bridge).await,
            other => {
                warn!(action = other, "unknown bridge action");
                ("error", "unknown_action".to_owned())
            }
        };

        // Unknown actions can never succeed, so they are not replayed either.
        if status == "ok" || reason == "unknown_action" {
            mark(state, key)?;
        }
        self.ack(
            chat,
            command::action_result_ack(&cmd.name, status, &reason, session),
        )
        .await;
        self.hub.emit(
            EventKind::BridgeActionExecuted,
            json!({
                "name": cmd.name,
                "session_id": session,
                "nonce": cmd.nonce,
                "status": status,
                "reason": reason,
            }),
        );

        Ok(if status == "ok" {
            Outcome::Processed
        } else {
            Outcome::Failed
        })
    }

    async fn restart(&self, target: RestartTarget) -> (&'static str, String) {
        match self.local.restart(target).await {
            Ok(()) => {
                info!(target = target.as_str(), "restart requested");
                ("ok", "restart_requested".to_owned())
            }
            Err(e) => {
                warn!(target = target.as_str(), error = %e, "restart failed");
                ("error", "restart_failed".to_owned())
            }
        }
    }

    async fn run_activate(
        &self,
        state: &mut BridgeState,
        key: &str,
        profile_id: &str,
        chat: Option<&str>,
    ) -> Result<Outcome> {
        let (status, outcome) = match self.local.activate_profile(profile_id).await {
            Ok(()) => {
                mark(state, key)?;
                ("ok", Outcome::Processed)
            }
            Err(e) => {
                warn!(profile_id, error = %e, "profile activation failed");
                ("error", Outcome::Failed)
            }
        };
        self.ack(chat, command::profile_ack(profile_id, status)).await;
        self.hub.emit(
            EventKind::BridgeProfileActivated,
            json!({"profile_id": profile_id, "status": status}),
        );
        Ok(outcome)
    }

    async fn report_duplicate(&self, parsed: &BridgeCommand, key: &str, chat: Option<&str>) {
        debug!(command = parsed.label(), key, "duplicate command");
        if let BridgeCommand::Speak(cmd) = parsed {
            let session = cmd.session_id.as_deref();
            self.ack(chat, command::spoken_ack("duplicate", session))
                .await;
            self.hub.emit(
                EventKind::BridgeSpoken,
                json!({"session_id": session, "turn": cmd.turn, "status": "duplicate"}),
            );
            return;
        }
        self.hub.emit(
            EventKind::BridgeDuplicate,
            json!({
                "name": parsed.label(),
                "session_id": parsed.session_id(),
                "status": "duplicate",
                "reason": key,
            }),
        );
    }

    async fn ack(&self, chat: Option<&str>, text: String) {
        let Some(chat_id) = chat.or(self.config.chat_id.as_deref()) else {
            debug!(%text, "no chat to acknowledge to");
            return;
        };
        if let Err(e) = self.transport.send_message(chat_id, &text).await {
            warn!(error = %e, %text, "failed to send bridge acknowledgment");
        }
    }
}

/// Mark `key` processed. A failed write aborts the batch before the ack;
/// the key stays marked in memory so a redelivery skips the side effect.
fn mark(state: &mut BridgeState, key: &str) -> Result<()> {
    state.mark_processed(key).inspect_err(|e| {
        warn!(key, error = %e, "failed to persist processed key");
    })
}

/// Single-token reason for a health ack, from the summary's `status`.
fn health_reason(summary: &Value) -> String {
    summary
        .get("status")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.contains(char::is_whitespace))
        .unwrap_or("ok")
        .to_owned()
}
