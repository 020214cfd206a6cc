//! Per-turn watchdog and retry coordination.
//!
//! One [`RoundTripCoordinator`] follows every voice turn from wake word to
//! spoken reply. A transcription arms a watchdog; if the assistant has not
//! answered by the deadline the pending text is resent once through a
//! [`RetrySender`], and a second miss ends the round trip with a
//! `session_timeout` event.
//!
//! Out-of-order events never fail: an event for an unknown session implies
//! a fresh one (logged), and sessions whose terminal event never arrives are
//! swept after `stale_ms`.

pub mod retry;

use crate::config::RoundTripConfig;
use crate::events::{Event, EventHub, EventKind, Subscription, now_epoch_millis};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use retry::{ChatRetrySender, NoRetrySender, RetryDelivery, RetrySender};

/// Live round-trip states. Completion and timeout remove the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundTripState {
    WakeDetected,
    AwaitingSpeak,
    SpeakReceived,
}

impl RoundTripState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WakeDetected => "wake_detected",
            Self::AwaitingSpeak => "awaiting_speak",
            Self::SpeakReceived => "speak_received",
        }
    }
}

/// Why a round trip was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    /// Deadline passed with no retries left.
    Watchdog,
    /// The resend itself failed.
    RetrySendFailed,
    /// No destination or credentials to resend through.
    RetryUnavailable,
}

impl TimeoutReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Watchdog => "watchdog",
            Self::RetrySendFailed => "retry_send_failed",
            Self::RetryUnavailable => "retry_unavailable",
        }
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoundTripTotals {
    pub started: u64,
    pub retries_sent: u64,
    pub completed: u64,
    pub timeouts: u64,
    pub stale_swept: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSummary {
    pub session_id: String,
    pub state: RoundTripState,
    pub retry_count: u32,
    pub updated_at_ms: u64,
    pub watchdog_armed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionSummary {
    pub session_id: String,
    pub status: String,
    pub retry_count: u32,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeoutSummary {
    pub session_id: String,
    pub reason: TimeoutReason,
    pub retry_count: u32,
    pub at_ms: u64,
}

/// Point-in-time view for dashboards and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundTripSnapshot {
    pub totals: RoundTripTotals,
    pub active_sessions: usize,
    /// Most recently updated first, bounded by `pending_list_limit`.
    pub pending: Vec<PendingSummary>,
    pub last_completed: Option<CompletionSummary>,
    pub last_timeout: Option<TimeoutSummary>,
}

/// Cheap per-session lookup for external polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub pending: bool,
    pub state: Option<RoundTripState>,
    pub retry_count: u32,
    pub updated_at_ms: Option<u64>,
}

struct Watchdog {
    generation: u64,
    task: tokio::task::JoinHandle<()>,
}

struct RoundTripSession {
    state: RoundTripState,
    created_at_ms: u64,
    updated_at_ms: u64,
    retry_count: u32,
    pending_text: Option<String>,
    watchdog: Option<Watchdog>,
}

impl RoundTripSession {
    fn new(now_ms: u64) -> Self {
        Self {
            state: RoundTripState::WakeDetected,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            retry_count: 0,
            pending_text: None,
            watchdog: None,
        }
    }

    fn clear_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.task.abort();
        }
    }
}

#[derive(Default)]
struct CoordinatorState {
    sessions: HashMap<String, RoundTripSession>,
    totals: RoundTripTotals,
    last_completed: Option<CompletionSummary>,
    last_timeout: Option<TimeoutSummary>,
    next_generation: u64,
}

impl CoordinatorState {
    fn sweep_stale(&mut self, now_ms: u64, stale_ms: u64) {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now_ms.saturating_sub(s.updated_at_ms) > stale_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(mut session) = self.sessions.remove(&id) {
                session.clear_watchdog();
                self.totals.stale_swept += 1;
                warn!(
                    session_id = %id,
                    state = session.state.as_str(),
                    age_ms = now_ms.saturating_sub(session.created_at_ms),
                    "sweeping stale round trip"
                );
            }
        }
    }

    /// Look up a session, implying a new one if the event arrived out of order.
    fn session_or_implied(
        &mut self,
        session_id: &str,
        kind: EventKind,
        now_ms: u64,
    ) -> &mut RoundTripSession {
        if !self.sessions.contains_key(session_id) {
            warn!(
                session_id,
                event = kind.as_str(),
                "event for unknown round trip; implying session"
            );
            self.totals.started += 1;
        }
        self.sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| RoundTripSession::new(now_ms))
    }

    fn record_timeout(
        &mut self,
        session_id: &str,
        reason: TimeoutReason,
        now_ms: u64,
    ) -> Option<u32> {
        let mut session = self.sessions.remove(session_id)?;
        session.clear_watchdog();
        self.totals.timeouts += 1;
        self.last_timeout = Some(TimeoutSummary {
            session_id: session_id.to_owned(),
            reason,
            retry_count: session.retry_count,
            at_ms: now_ms,
        });
        Some(session.retry_count)
    }
}

struct Shared {
    config: RoundTripConfig,
    hub: EventHub,
    sender: Arc<dyn RetrySender>,
    state: Mutex<CoordinatorState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watchdog_duration(&self) -> Duration {
        Duration::from_millis(self.config.watchdog_ms.max(1))
    }
}

enum WatchdogDecision {
    Retry { text: String, attempt: u32 },
    Timeout(TimeoutReason),
}

/// Watchdog/retry state machine keyed by session id. Cheap to clone.
#[derive(Clone)]
pub struct RoundTripCoordinator {
    shared: Arc<Shared>,
}

impl RoundTripCoordinator {
    #[must_use]
    pub fn new(config: RoundTripConfig, hub: EventHub, sender: Arc<dyn RetrySender>) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                hub,
                sender,
                state: Mutex::new(CoordinatorState::default()),
            }),
        }
    }

    /// Subscribe this coordinator to its hub.
    pub fn attach(&self) -> Subscription {
        let coordinator = self.clone();
        self.shared.hub.subscribe(move |event| {
            coordinator.handle_event(event);
            Ok(())
        })
    }

    pub fn handle_event(&self, event: &Event) {
        self.handle_event_at(event, now_epoch_millis());
    }

    /// Apply one event at the given epoch-millisecond time.
    pub fn handle_event_at(&self, event: &Event, now_ms: u64) {
        let Some(kind) = event.kind() else {
            return;
        };
        if !matches!(
            kind,
            EventKind::WakeDetected
                | EventKind::MessageTranscribed
                | EventKind::BridgeSpeakReceived
                | EventKind::BridgeSpoken
        ) {
            return;
        }

        let fields = event.fields();
        let Some(session_id) = fields.session_id else {
            debug!(event = kind.as_str(), "round trip event without session id");
            return;
        };

        let mut state = self.shared.lock();
        state.sweep_stale(now_ms, self.shared.config.stale_ms);

        match kind {
            EventKind::WakeDetected => {
                if let Some(mut previous) = state.sessions.remove(&session_id) {
                    previous.clear_watchdog();
                    warn!(
                        session_id = %session_id,
                        state = previous.state.as_str(),
                        "wake detected while round trip still live; previous turn never finished"
                    );
                }
                state
                    .sessions
                    .insert(session_id.clone(), RoundTripSession::new(now_ms));
                state.totals.started += 1;
                debug!(session_id = %session_id, "round trip started");
            }
            EventKind::MessageTranscribed => {
                let generation = state.next_generation;
                let session = state.session_or_implied(&session_id, kind, now_ms);
                if !matches!(
                    session.state,
                    RoundTripState::WakeDetected | RoundTripState::AwaitingSpeak
                ) {
                    warn!(
                        session_id = %session_id,
                        state = session.state.as_str(),
                        "ignoring stale or duplicate transcription"
                    );
                    return;
                }
                if fields.text.is_some() {
                    session.pending_text = fields.text;
                }
                session.state = RoundTripState::AwaitingSpeak;
                session.updated_at_ms = now_ms;
                session.clear_watchdog();
                session.watchdog = self.arm_watchdog(&session_id, generation);
                if session.watchdog.is_some() {
                    state.next_generation = generation.wrapping_add(1);
                }
            }
            EventKind::BridgeSpeakReceived => {
                let session = state.session_or_implied(&session_id, kind, now_ms);
                match session.state {
                    RoundTripState::WakeDetected => warn!(
                        session_id = %session_id,
                        "speak received before transcription; tolerating"
                    ),
                    RoundTripState::SpeakReceived => {
                        debug!(session_id = %session_id, "duplicate speak received")
                    }
                    RoundTripState::AwaitingSpeak => {}
                }
                session.clear_watchdog();
                session.state = RoundTripState::SpeakReceived;
                session.updated_at_ms = now_ms;
            }
            EventKind::BridgeSpoken => {
                let retry_count = {
                    let session = state.session_or_implied(&session_id, kind, now_ms);
                    session.clear_watchdog();
                    session.retry_count
                };
                state.sessions.remove(&session_id);
                let status = fields.status.unwrap_or_else(|| "ok".to_owned());
                state.totals.completed += 1;
                info!(
                    session_id = %session_id,
                    status = %status,
                    retry_count,
                    "round trip completed"
                );
                state.last_completed = Some(CompletionSummary {
                    session_id,
                    status,
                    retry_count,
                    at_ms: now_ms,
                });
            }
            _ => {}
        }
    }

    fn arm_watchdog(&self, session_id: &str, generation: u64) -> Option<Watchdog> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id, "no async runtime; watchdog not armed");
            return None;
        };
        let coordinator = self.clone();
        let id = session_id.to_owned();
        let delay = self.shared.watchdog_duration();
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.on_watchdog(id, generation).await;
        });
        Some(Watchdog { generation, task })
    }

    async fn on_watchdog(&self, session_id: String, generation: u64) {
        let decision = {
            let mut state = self.shared.lock();
            let limit = self.shared.config.retry_limit;
            let Some(session) = state.sessions.get_mut(&session_id) else {
                return;
            };
            match &session.watchdog {
                Some(watchdog) if watchdog.generation == generation => {}
                _ => return,
            }
            // Detach rather than abort: this task is the one running.
            session.watchdog = None;
            if session.state != RoundTripState::AwaitingSpeak {
                return;
            }
            match (&session.pending_text, session.retry_count < limit) {
                (Some(text), true) => WatchdogDecision::Retry {
                    text: text.clone(),
                    attempt: session.retry_count + 1,
                },
                _ => WatchdogDecision::Timeout(TimeoutReason::Watchdog),
            }
        };

        let (text, attempt) = match decision {
            WatchdogDecision::Timeout(reason) => {
                self.time_out(&session_id, reason);
                return;
            }
            WatchdogDecision::Retry { text, attempt } => (text, attempt),
        };

        info!(session_id = %session_id, attempt, "watchdog fired; resending pending text");
        let delivery = self.shared.sender.resend(&session_id, &text).await;

        let outcome = {
            let mut state = self.shared.lock();
            let next_generation = state.next_generation;
            let Some(session) = state.sessions.get_mut(&session_id) else {
                debug!(session_id = %session_id, "round trip ended while resending");
                return;
            };
            if session.state != RoundTripState::AwaitingSpeak || session.watchdog.is_some() {
                debug!(session_id = %session_id, "round trip progressed while resending");
                return;
            }
            match delivery {
                Ok(RetryDelivery::Sent) => {
                    session.retry_count += 1;
                    session.updated_at_ms = now_epoch_millis();
                    session.watchdog = self.arm_watchdog(&session_id, next_generation);
                    let retry_count = session.retry_count;
                    state.next_generation = next_generation.wrapping_add(1);
                    state.totals.retries_sent += 1;
                    Ok(retry_count)
                }
                Ok(RetryDelivery::Unavailable(why)) => {
                    warn!(session_id = %session_id, "retry unavailable: {why}");
                    Err(TimeoutReason::RetryUnavailable)
                }
                Err(err) => {
                    warn!(session_id = %session_id, "retry send failed: {err:#}");
                    Err(TimeoutReason::RetrySendFailed)
                }
            }
        };

        match outcome {
            Ok(retry_count) => {
                self.shared.hub.emit(
                    EventKind::SessionRetry,
                    json!({"session_id": session_id, "attempt": retry_count}),
                );
            }
            Err(reason) => self.time_out(&session_id, reason),
        }
    }

    fn time_out(&self, session_id: &str, reason: TimeoutReason) {
        let retry_count = {
            let mut state = self.shared.lock();
            state.record_timeout(session_id, reason, now_epoch_millis())
        };
        let Some(retry_count) = retry_count else {
            return;
        };
        warn!(session_id, reason = reason.as_str(), retry_count, "round trip timed out");
        // Published after the lock is released: our own subscriber sees it.
        self.shared.hub.emit(
            EventKind::SessionTimeout,
            json!({
                "session_id": session_id,
                "reason": reason.as_str(),
                "retry_count": retry_count,
                "wait_result": "timeout",
            }),
        );
    }

    #[must_use]
    pub fn snapshot(&self) -> RoundTripSnapshot {
        let state = self.shared.lock();
        let mut pending: Vec<PendingSummary> = state
            .sessions
            .iter()
            .map(|(id, s)| PendingSummary {
                session_id: id.clone(),
                state: s.state,
                retry_count: s.retry_count,
                updated_at_ms: s.updated_at_ms,
                watchdog_armed: s.watchdog.is_some(),
            })
            .collect();
        pending.sort_by(|a, b| {
            b.updated_at_ms
                .cmp(&a.updated_at_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        pending.truncate(self.shared.config.pending_list_limit);

        RoundTripSnapshot {
            totals: state.totals,
            active_sessions: state.sessions.len(),
            pending,
            last_completed: state.last_completed.clone(),
            last_timeout: state.last_timeout.clone(),
        }
    }

    #[must_use]
    pub fn session_status(&self, session_id: &str) -> SessionStatus {
        let state = self.shared.lock();
        match state.sessions.get(session_id) {
            Some(session) => SessionStatus {
                session_id: session_id.to_owned(),
                pending: true,
                state: Some(session.state),
                retry_count: session.retry_count,
                updated_at_ms: Some(session.updated_at_ms),
            },
            None => SessionStatus {
                session_id: session_id.to_owned(),
                pending: false,
                state: None,
                retry_count: 0,
                updated_at_ms: None,
            },
        }
    }
}
