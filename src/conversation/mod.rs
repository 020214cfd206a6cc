//! Multi-turn conversation sessions.
//!
//! [`ConversationSessionManager`] projects the event stream into sessions of
//! numbered turns:
//!
//! ```text
//! awaiting_user -> awaiting_assistant -> agent_responding -> awaiting_user
//!        \______________________ any _______________________/-> ended
//! ```
//!
//! Sessions expire `ttl_ms` after their last activity (purged lazily on the
//! next access) and are evicted least-recently-updated first, ended ones
//! preferred, beyond `max_sessions`. Each session retains its most recent
//! `max_turns_per_session` turns while `total_turns` keeps counting.

pub mod context;
pub mod policy;

use crate::config::ConversationConfig;
use crate::events::{Event, EventFields, EventHub, EventKind, Subscription, now_epoch_millis};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub use context::{ContextMessage, ContextOptions, ConversationContext, MessageRole};
pub use policy::{TurnLimit, TurnLimitPolicy};

/// Highest turn number a transcription may declare.
const MAX_DECLARED_TURN: i64 = 500;

pub const END_REASON_TTL_EXPIRED: &str = "ttl_expired";
pub const END_REASON_CAPACITY_PRUNED: &str = "capacity_pruned";
pub const END_REASON_SESSION_TIMEOUT: &str = "session_timeout";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    AwaitingUser,
    AwaitingAssistant,
    AgentResponding,
    Ended,
}

impl ConversationState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingUser => "awaiting_user",
            Self::AwaitingAssistant => "awaiting_assistant",
            Self::AgentResponding => "agent_responding",
            Self::Ended => "ended",
        }
    }
}

/// One user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationTurn {
    pub turn: u32,
    pub user_text: Option<String>,
    pub user_at_ms: Option<u64>,
    pub assistant_text: Option<String>,
    pub assistant_at_ms: Option<u64>,
    /// `ok`, `error` or `duplicate` once spoken.
    pub assistant_status: Option<String>,
}

impl ConversationTurn {
    fn new(turn: u32) -> Self {
        Self {
            turn,
            user_text: None,
            user_at_ms: None,
            assistant_text: None,
            assistant_at_ms: None,
            assistant_status: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionNoteKind {
    Requested,
    Blocked,
    Executed,
}

impl ActionNoteKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Blocked => "blocked",
            Self::Executed => "executed",
        }
    }
}

/// A bridge action observed during a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionNote {
    pub kind: ActionNoteKind,
    pub name: String,
    pub status: Option<String>,
    pub reason: Option<String>,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndedSummary {
    pub session_id: String,
    pub reason: String,
    pub total_turns: u32,
    pub at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: ConversationState,
    pub total_turns: u32,
    pub retained_turns: usize,
    pub turn_limit: u32,
    pub updated_at_ms: u64,
    pub expires_at_ms: u64,
    pub end_reason: Option<String>,
}

/// Manager-wide view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSnapshot {
    pub active_sessions: usize,
    pub tracked_sessions: usize,
    /// Most recently updated first.
    pub sessions: Vec<SessionSummary>,
    pub end_reasons: BTreeMap<String, u64>,
    pub last_ended: Option<EndedSummary>,
}

/// Full view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub state: ConversationState,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub expires_at_ms: u64,
    pub total_turns: u32,
    pub turn_limit: u32,
    pub extensions_used: u32,
    pub turns_remaining: u32,
    pub end_reason: Option<String>,
    pub turns: Vec<ConversationTurn>,
    pub notes: Vec<ActionNote>,
}

struct ConversationSession {
    state: ConversationState,
    created_at_ms: u64,
    updated_at_ms: u64,
    expires_at_ms: u64,
    total_turns: u32,
    limit: TurnLimit,
    end_reason: Option<String>,
    turns: VecDeque<ConversationTurn>,
    notes: VecDeque<ActionNote>,
}

impl ConversationSession {
    fn new(limit: TurnLimit, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            state: ConversationState::AwaitingUser,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
            total_turns: 0,
            limit,
            end_reason: None,
            turns: VecDeque::new(),
            notes: VecDeque::new(),
        }
    }

    fn touch(&mut self, now_ms: u64, ttl_ms: u64) {
        self.updated_at_ms = now_ms;
        self.expires_at_ms = now_ms.saturating_add(ttl_ms);
    }

    fn is_ended(&self) -> bool {
        self.state == ConversationState::Ended
    }

    /// Leave `ended` when the user speaks again.
    fn reopen(&mut self, session_id: &str) {
        if self.is_ended() {
            info!(
                session_id,
                previous_reason = ?self.end_reason,
                "reopening ended conversation"
            );
            self.state = ConversationState::AwaitingUser;
            self.end_reason = None;
        }
    }

    /// Move to `next` unless the session has ended.
    fn transition(&mut self, next: ConversationState) {
        if !self.is_ended() {
            self.state = next;
        }
    }

    fn turn_mut(&mut self, turn: u32) -> Option<&mut ConversationTurn> {
        self.turns.iter_mut().find(|t| t.turn == turn)
    }

    /// Append a turn, keeping ascending order and the retention bound.
    fn push_turn(&mut self, turn: ConversationTurn, max_turns: usize) -> u32 {
        let number = turn.turn;
        self.total_turns = self.total_turns.max(number);
        self.turns.push_back(turn);
        while self.turns.len() > max_turns.max(1) {
            self.turns.pop_front();
        }
        number
    }

    /// Turn an assistant event applies to: the declared turn if retained,
    /// else the newest turn matching `pending`, else a new one.
    fn assistant_target(
        &mut self,
        declared: Option<u32>,
        pending: impl Fn(&ConversationTurn) -> bool,
        max_turns: usize,
    ) -> u32 {
        if let Some(turn) = declared
            && self.turns.iter().any(|t| t.turn == turn)
        {
            return turn;
        }
        if let Some(turn) = self.turns.iter().rev().find(|t| pending(t)) {
            return turn.turn;
        }
        let next = self.total_turns.saturating_add(1);
        let number = declared.filter(|d| *d > self.total_turns).unwrap_or(next);
        self.push_turn(ConversationTurn::new(number), max_turns)
    }

    fn summary(&self, session_id: &str) -> SessionSummary {
        SessionSummary {
            session_id: session_id.to_owned(),
            state: self.state,
            total_turns: self.total_turns,
            retained_turns: self.turns.len(),
            turn_limit: self.limit.limit,
            updated_at_ms: self.updated_at_ms,
            expires_at_ms: self.expires_at_ms,
            end_reason: self.end_reason.clone(),
        }
    }
}

fn declared_turn(fields: &EventFields) -> Option<u32> {
    fields
        .turn
        .map(|t| t.clamp(1, MAX_DECLARED_TURN))
        .and_then(|t| u32::try_from(t).ok())
}

#[derive(Default)]
struct ManagerState {
    sessions: HashMap<String, ConversationSession>,
    end_reasons: BTreeMap<String, u64>,
    last_ended: Option<EndedSummary>,
}

impl ManagerState {
    fn record_end(&mut self, session_id: &str, reason: &str, total_turns: u32, now_ms: u64) {
        *self.end_reasons.entry(reason.to_owned()).or_insert(0) += 1;
        self.last_ended = Some(EndedSummary {
            session_id: session_id.to_owned(),
            reason: reason.to_owned(),
            total_turns,
            at_ms: now_ms,
        });
    }

    /// Mark a live session ended. Returns `false` if missing or already ended.
    fn end(&mut self, session_id: &str, reason: &str, now_ms: u64) -> bool {
        let Some(session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        if session.is_ended() {
            return false;
        }
        session.state = ConversationState::Ended;
        session.end_reason = Some(reason.to_owned());
        session.updated_at_ms = now_ms;
        let total_turns = session.total_turns;
        self.record_end(session_id, reason, total_turns, now_ms);
        info!(session_id, reason, total_turns, "conversation ended");
        true
    }

    /// Drop sessions past their expiry, tagging live ones `ttl_expired`.
    fn purge_expired(&mut self, now_ms: u64) {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| now_ms > s.expires_at_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            let Some(session) = self.sessions.remove(&id) else {
                continue;
            };
            if !session.is_ended() {
                self.record_end(&id, END_REASON_TTL_EXPIRED, session.total_turns, now_ms);
            }
            debug!(session_id = %id, "conversation expired");
        }
    }

    /// Evict down to `max_sessions`, never the session just touched.
    fn enforce_capacity(&mut self, max_sessions: usize, keep: &str, now_ms: u64) {
        while self.sessions.len() > max_sessions.max(1) {
            let victim = self
                .sessions
                .iter()
                .filter(|(id, _)| id.as_str() != keep)
                .min_by_key(|(_, s)| (!s.is_ended(), s.updated_at_ms))
                .map(|(id, _)| id.clone());
            let Some(victim) = victim else {
                break;
            };
            if let Some(session) = self.sessions.remove(&victim)
                && !session.is_ended()
            {
                self.record_end(
                    &victim,
                    END_REASON_CAPACITY_PRUNED,
                    session.total_turns,
                    now_ms,
                );
                warn!(session_id = %victim, "conversation evicted at capacity");
            }
        }
    }
}

struct Shared {
    config: ConversationConfig,
    policy: TurnLimitPolicy,
    hub: EventHub,
    state: Mutex<ManagerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Conversation session state machine. Cheap to clone.
#[derive(Clone)]
pub struct ConversationSessionManager {
    shared: Arc<Shared>,
}

impl ConversationSessionManager {
    #[must_use]
    pub fn new(config: ConversationConfig, hub: EventHub) -> Self {
        let policy = TurnLimitPolicy::from_config(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                policy,
                hub,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    #[must_use]
    pub fn policy(&self) -> TurnLimitPolicy {
        self.shared.policy
    }

    /// Subscribe this manager to its hub.
    pub fn attach(&self) -> Subscription {
        let manager = self.clone();
        self.shared.hub.subscribe(move |event| {
            manager.handle_event(event);
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
        let fields = event.fields();
        let mut state = self.shared.lock();
        state.purge_expired(now_ms);

        match kind {
            EventKind::WakeDetected => {
                if let Some(id) = fields.session_id.as_deref() {
                    self.open(&mut state, id, fields.max_turns, false, now_ms);
                }
            }
            EventKind::ListenerStatus => self.on_listener_status(&mut state, &fields, now_ms),
            EventKind::MessageTranscribed => self.on_transcribed(&mut state, &fields, now_ms),
            EventKind::BridgeSpeakReceived => self.on_speak_received(&mut state, &fields, now_ms),
            EventKind::BridgeSpoken => self.on_spoken(&mut state, &fields, now_ms),
            EventKind::SessionTimeout => {
                if let Some(id) = fields.session_id.as_deref()
                    && !state.end(id, END_REASON_SESSION_TIMEOUT, now_ms)
                {
                    debug!(session_id = id, "timeout for unknown or ended conversation");
                }
            }
            EventKind::BridgeActionRequested => {
                self.on_action(&mut state, ActionNoteKind::Requested, fields, now_ms);
            }
            EventKind::BridgeActionBlocked => {
                self.on_action(&mut state, ActionNoteKind::Blocked, fields, now_ms);
            }
            EventKind::BridgeActionExecuted => {
                self.on_action(&mut state, ActionNoteKind::Executed, fields, now_ms);
            }
            _ => {}
        }
    }

    /// Open or refresh a session and apply the turn-limit policy.
    fn open(
        &self,
        state: &mut ManagerState,
        session_id: &str,
        max_turns: Option<i64>,
        extend: bool,
        now_ms: u64,
    ) {
        let policy = self.shared.policy;
        let ttl_ms = self.shared.config.ttl_ms;
        let created = !state.sessions.contains_key(session_id);
        let session = state
            .sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| ConversationSession::new(policy.initial(), now_ms, ttl_ms));
        session.reopen(session_id);
        session.touch(now_ms, ttl_ms);
        session.limit = match (max_turns, extend) {
            (Some(declared), _) => policy.declared(declared),
            (None, true) => policy.extended(session.limit.limit),
            (None, false) if created => policy.initial(),
            (None, false) => session.limit,
        };
        debug!(
            session_id,
            created,
            turn_limit = session.limit.limit,
            extensions_used = session.limit.extensions_used,
            "conversation opened"
        );
        if created {
            state.enforce_capacity(self.shared.config.max_sessions, session_id, now_ms);
        }
    }

    /// Session for an in-loop event, implied if it arrived out of order.
    fn session_or_implied<'a>(
        &self,
        state: &'a mut ManagerState,
        session_id: &str,
        kind: EventKind,
        now_ms: u64,
    ) -> &'a mut ConversationSession {
        if !state.sessions.contains_key(session_id) {
            warn!(
                session_id,
                event = kind.as_str(),
                "event for unknown conversation; implying session"
            );
            let session = ConversationSession::new(
                self.shared.policy.initial(),
                now_ms,
                self.shared.config.ttl_ms,
            );
            state.sessions.insert(session_id.to_owned(), session);
            state.enforce_capacity(self.shared.config.max_sessions, session_id, now_ms);
        }
        // Present: inserted above when missing, and capacity never evicts it.
        state
            .sessions
            .entry(session_id.to_owned())
            .or_insert_with(|| {
                ConversationSession::new(
                    self.shared.policy.initial(),
                    now_ms,
                    self.shared.config.ttl_ms,
                )
            })
    }

    fn on_listener_status(&self, state: &mut ManagerState, fields: &EventFields, now_ms: u64) {
        let Some(id) = fields.session_id.as_deref() else {
            return;
        };
        let Some(status) = fields.status.as_deref().or(fields.name.as_deref()) else {
            return;
        };
        match status {
            "conversation_loop_started" => self.open(state, id, fields.max_turns, false, now_ms),
            "conversation_loop_extended" => self.open(state, id, fields.max_turns, true, now_ms),
            "conversation_loop_ended" | "conversation_ended" => {
                let reason = fields.reason.as_deref().unwrap_or(status);
                state.end(id, reason, now_ms);
            }
            other => debug!(session_id = id, status = other, "unhandled listener status"),
        }
    }

    fn on_transcribed(&self, state: &mut ManagerState, fields: &EventFields, now_ms: u64) {
        let Some(id) = fields.session_id.as_deref() else {
            return;
        };
        let ttl_ms = self.shared.config.ttl_ms;
        let max_turns = self.shared.config.max_turns_per_session;
        let session = self.session_or_implied(state, id, EventKind::MessageTranscribed, now_ms);
        session.reopen(id);
        session.touch(now_ms, ttl_ms);

        let declared = declared_turn(fields);
        // A declared turn created ahead of its transcription is filled in place.
        let existing = declared.filter(|turn| {
            session
                .turns
                .iter()
                .any(|t| t.turn == *turn && t.user_text.is_none())
        });
        let number = match existing {
            Some(turn) => turn,
            None => {
                let next = session.total_turns.saturating_add(1);
                let number = declared.map_or(next, |d| d.max(next));
                session.push_turn(ConversationTurn::new(number), max_turns)
            }
        };
        if let Some(turn) = session.turn_mut(number) {
            turn.user_text = fields.text.clone();
            turn.user_at_ms = Some(now_ms);
        }
        session.state = ConversationState::AwaitingAssistant;
        debug!(session_id = id, turn = number, "user turn recorded");
    }

    fn on_speak_received(&self, state: &mut ManagerState, fields: &EventFields, now_ms: u64) {
        let Some(id) = fields.session_id.as_deref() else {
            return;
        };
        let ttl_ms = self.shared.config.ttl_ms;
        let max_turns = self.shared.config.max_turns_per_session;
        let session = self.session_or_implied(state, id, EventKind::BridgeSpeakReceived, now_ms);
        session.touch(now_ms, ttl_ms);

        let number = session.assistant_target(
            declared_turn(fields),
            |t| t.assistant_text.is_none(),
            max_turns,
        );
        if let Some(turn) = session.turn_mut(number) {
            turn.assistant_text = fields.text.clone();
            turn.assistant_at_ms = Some(now_ms);
        }
        if session.is_ended() {
            debug!(session_id = id, turn = number, "late assistant text on ended conversation");
        }
        session.transition(ConversationState::AgentResponding);
    }

    fn on_spoken(&self, state: &mut ManagerState, fields: &EventFields, now_ms: u64) {
        let Some(id) = fields.session_id.as_deref() else {
            return;
        };
        let ttl_ms = self.shared.config.ttl_ms;
        let max_turns = self.shared.config.max_turns_per_session;
        let status = fields.status.clone().unwrap_or_else(|| "ok".to_owned());
        let session = self.session_or_implied(state, id, EventKind::BridgeSpoken, now_ms);
        session.touch(now_ms, ttl_ms);

        let declared = declared_turn(fields);
        let unresolved = |t: &ConversationTurn| t.assistant_status.is_none();
        let has_target = declared.is_some_and(|d| session.turns.iter().any(|t| t.turn == d))
            || session.turns.iter().any(unresolved);
        if status == "duplicate" && !has_target {
            // Re-acknowledgment of a turn already finalized.
            session.transition(ConversationState::AwaitingUser);
            return;
        }
        let number = session.assistant_target(declared, unresolved, max_turns);
        if let Some(turn) = session.turn_mut(number)
            && (turn.assistant_status.is_none() || status != "duplicate")
        {
            turn.assistant_status = Some(status.clone());
            turn.assistant_at_ms.get_or_insert(now_ms);
        }
        session.transition(ConversationState::AwaitingUser);
        debug!(session_id = id, turn = number, status = %status, "assistant turn finalized");
    }

    fn on_action(
        &self,
        state: &mut ManagerState,
        kind: ActionNoteKind,
        fields: EventFields,
        now_ms: u64,
    ) {
        let Some(name) = fields.name else {
            return;
        };
        // Actions without a session belong to the most recent live one.
        let target = fields.session_id.or_else(|| {
            state
                .sessions
                .iter()
                .filter(|(_, s)| !s.is_ended())
                .max_by_key(|(_, s)| s.updated_at_ms)
                .map(|(id, _)| id.clone())
        });
        let Some(target) = target else {
            return;
        };
        let Some(session) = state.sessions.get_mut(&target) else {
            debug!(session_id = %target, action = %name, "action for unknown conversation");
            return;
        };
        session.notes.push_back(ActionNote {
            kind,
            name,
            status: fields.status,
            reason: fields.reason,
            at_ms: now_ms,
        });
        while session.notes.len() > self.shared.config.max_notes_per_session.max(1) {
            session.notes.pop_front();
        }
    }

    /// End a session explicitly. No-op (returns `false`) if missing or ended.
    pub fn end_session(&self, session_id: &str, reason: &str) -> bool {
        self.end_session_at(session_id, reason, now_epoch_millis())
    }

    pub fn end_session_at(&self, session_id: &str, reason: &str, now_ms: u64) -> bool {
        let mut state = self.shared.lock();
        state.purge_expired(now_ms);
        state.end(session_id, reason, now_ms)
    }

    #[must_use]
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.snapshot_at(now_epoch_millis())
    }

    #[must_use]
    pub fn snapshot_at(&self, now_ms: u64) -> ConversationSnapshot {
        let mut state = self.shared.lock();
        state.purge_expired(now_ms);
        let mut sessions: Vec<SessionSummary> = state
            .sessions
            .iter()
            .map(|(id, s)| s.summary(id))
            .collect();
        sessions.sort_by(|a, b| {
            b.updated_at_ms
                .cmp(&a.updated_at_ms)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        ConversationSnapshot {
            active_sessions: sessions
                .iter()
                .filter(|s| s.state != ConversationState::Ended)
                .count(),
            tracked_sessions: sessions.len(),
            sessions,
            end_reasons: state.end_reasons.clone(),
            last_ended: state.last_ended.clone(),
        }
    }

    #[must_use]
    pub fn session_snapshot(&self, session_id: &str) -> Option<SessionSnapshot> {
        self.session_snapshot_at(session_id, now_epoch_millis())
    }

    #[must_use]
    pub fn session_snapshot_at(&self, session_id: &str, now_ms: u64) -> Option<SessionSnapshot> {
        let mut state = self.shared.lock();
        state.purge_expired(now_ms);
        let session = state.sessions.get(session_id)?;
        let used = session
            .turns
            .iter()
            .filter(|t| t.user_text.is_some())
            .count();
        Some(SessionSnapshot {
            session_id: session_id.to_owned(),
            state: session.state,
            created_at_ms: session.created_at_ms,
            updated_at_ms: session.updated_at_ms,
            expires_at_ms: session.expires_at_ms,
            total_turns: session.total_turns,
            turn_limit: session.limit.limit,
            extensions_used: session.limit.extensions_used,
            turns_remaining: session
                .limit
                .limit
                .saturating_sub(session.total_turns.max(u32::try_from(used).unwrap_or(u32::MAX))),
            end_reason: session.end_reason.clone(),
            turns: session.turns.iter().cloned().collect(),
            notes: session.notes.iter().cloned().collect(),
        })
    }

    /// Role-tagged message history for a session.
    #[must_use]
    pub fn context(&self, session_id: &str, options: ContextOptions) -> Option<ConversationContext> {
        self.context_at(session_id, options, now_epoch_millis())
    }

    #[must_use]
    pub fn context_at(
        &self,
        session_id: &str,
        options: ContextOptions,
        now_ms: u64,
    ) -> Option<ConversationContext> {
        let mut state = self.shared.lock();
        state.purge_expired(now_ms);
        let session = state.sessions.get(session_id)?;
        let turns: Vec<ConversationTurn> = session.turns.iter().cloned().collect();
        let notes: Vec<ActionNote> = session.notes.iter().cloned().collect();
        drop(state);

        let limit = options
            .limit
            .unwrap_or(self.shared.config.context_message_limit)
            .max(1);
        let (messages, truncated) =
            context::build_messages(&turns, &notes, options.include_pending, limit);
        Some(ConversationContext {
            session_id: session_id.to_owned(),
            messages,
            truncated,
        })
    }
}
