//! Canonical event types and payload field normalization.
//!
//! Producers are loose about payload keys (`session_id` vs `sessionId`,
//! numeric vs string turns). Everything is normalized here once so session
//! logic only ever sees [`EventFields`].

use serde_json::{Map, Value};

/// Known event types flowing through the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WakeDetected,
    MessageTranscribed,
    BridgeSpeakReceived,
    BridgeSpoken,
    SessionRetry,
    SessionTimeout,
    ListenerStatus,
    BridgeActionRequested,
    BridgeActionBlocked,
    BridgeActionExecuted,
    BridgeProfileActivated,
    BridgePing,
    BridgeDuplicate,
}

impl EventKind {
    /// Render the event type to its wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WakeDetected => "wake_detected",
            Self::MessageTranscribed => "message_transcribed",
            Self::BridgeSpeakReceived => "bridge_speak_received",
            Self::BridgeSpoken => "bridge_spoken",
            Self::SessionRetry => "session_retry",
            Self::SessionTimeout => "session_timeout",
            Self::ListenerStatus => "listener_status",
            Self::BridgeActionRequested => "bridge_action_requested",
            Self::BridgeActionBlocked => "bridge_action_blocked",
            Self::BridgeActionExecuted => "bridge_action_executed",
            Self::BridgeProfileActivated => "bridge_profile_activated",
            Self::BridgePing => "bridge_ping",
            Self::BridgeDuplicate => "bridge_duplicate",
        }
    }

    /// Parse an event type from its wire name.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "wake_detected" => Some(Self::WakeDetected),
            "message_transcribed" => Some(Self::MessageTranscribed),
            "bridge_speak_received" => Some(Self::BridgeSpeakReceived),
            "bridge_spoken" => Some(Self::BridgeSpoken),
            "session_retry" => Some(Self::SessionRetry),
            "session_timeout" => Some(Self::SessionTimeout),
            "listener_status" => Some(Self::ListenerStatus),
            "bridge_action_requested" => Some(Self::BridgeActionRequested),
            "bridge_action_blocked" => Some(Self::BridgeActionBlocked),
            "bridge_action_executed" => Some(Self::BridgeActionExecuted),
            "bridge_profile_activated" => Some(Self::BridgeProfileActivated),
            "bridge_ping" => Some(Self::BridgePing),
            "bridge_duplicate" => Some(Self::BridgeDuplicate),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload fields in their canonical shape.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFields {
    pub session_id: Option<String>,
    pub text: Option<String>,
    /// Declared turn number, unclamped.
    pub turn: Option<i64>,
    pub status: Option<String>,
    pub max_turns: Option<i64>,
    pub reason: Option<String>,
    pub wait_result: Option<String>,
    /// Action name for `bridge_action_*` events.
    pub name: Option<String>,
    pub nonce: Option<String>,
}

impl EventFields {
    /// Normalize a raw payload map.
    #[must_use]
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        Self {
            session_id: string_field(payload, &["session_id", "sessionId"]),
            text: text_field(payload, "text"),
            turn: integer_field(payload, &["turn"]),
            status: string_field(payload, &["status"]),
            max_turns: integer_field(payload, &["max_turns", "maxTurns"]),
            reason: string_field(payload, &["reason"]),
            wait_result: string_field(payload, &["wait_result", "waitResult"]),
            name: string_field(payload, &["name"]),
            nonce: string_field(payload, &["nonce"]),
        }
    }
}

fn first<'a>(payload: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .find(|value| !value.is_null())
}

fn string_field(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    let raw = match first(payload, keys)? {
        Value::String(s) => s.trim().to_owned(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!raw.is_empty()).then_some(raw)
}

/// Text keeps inner whitespace; only fully blank text is dropped.
fn text_field(payload: &Map<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn integer_field(payload: &Map<String, Value>, keys: &[&str]) -> Option<i64> {
    match first(payload, keys)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}
