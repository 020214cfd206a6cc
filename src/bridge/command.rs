//! Tagged chat commands and their acknowledgments.
//!
//! ```text
//! #faye_speak [session=ID] [turn=N] text=...
//! #faye_speak {"session_id": "...", "turn": 2, "text": "..."}
//! #faye_action name=... [session=...] [confirm=yes|no] [nonce=...]
//! #faye_profile_activate id=...
//! #faye_ping
//! ```
//!
//! [`parse_command`] is total: malformed input yields `None`.

use serde_json::Value;

/// Actions that restart a process and therefore need `confirm=yes`.
pub const DESTRUCTIVE_ACTIONS: &[&str] = &["listener_restart", "bridge_restart"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakCommand {
    pub session_id: Option<String>,
    pub turn: Option<u32>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCommand {
    pub name: String,
    pub session_id: Option<String>,
    pub confirm: bool,
    pub nonce: Option<String>,
}

impl ActionCommand {
    #[must_use]
    pub fn is_destructive(&self) -> bool {
        DESTRUCTIVE_ACTIONS.contains(&self.name.as_str())
    }
}

/// A command parsed from an external chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCommand {
    Speak(SpeakCommand),
    Action(ActionCommand),
    ActivateProfile { profile_id: String },
    Ping,
}

impl BridgeCommand {
    /// Short command name for logs and events.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Speak(_) => "speak",
            Self::Action(_) => "action",
            Self::ActivateProfile { .. } => "activate_profile",
            Self::Ping => "ping",
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Speak(cmd) => cmd.session_id.as_deref(),
            Self::Action(cmd) => cmd.session_id.as_deref(),
            Self::ActivateProfile { .. } | Self::Ping => None,
        }
    }

    /// Key under which this command's side effect is recorded as done.
    ///
    /// Actions carrying a nonce key on the nonce alone, so a retried request
    /// delivered under a new update id still deduplicates.
    #[must_use]
    pub fn idempotency_key(&self, update_id: i64) -> String {
        match self {
            Self::Speak(cmd) => format!(
                "speak:{}:{update_id}",
                cmd.session_id.as_deref().unwrap_or("-")
            ),
            Self::Action(cmd) => match &cmd.nonce {
                Some(nonce) => format!("action:nonce:{nonce}"),
                None => format!(
                    "action:{}:{}:{update_id}",
                    cmd.name,
                    cmd.session_id.as_deref().unwrap_or("-")
                ),
            },
            Self::ActivateProfile { profile_id } => format!("profile:{profile_id}:{update_id}"),
            Self::Ping => format!("ping:{update_id}"),
        }
    }
}

/// Parse a chat message into a command.
#[must_use]
pub fn parse_command(raw: &str) -> Option<BridgeCommand> {
    let trimmed = raw.trim();
    let (tag, rest) = split_first_token(trimmed);
    if !tag.starts_with('#') {
        return None;
    }
    match tag.to_ascii_lowercase().as_str() {
        "#faye_speak" => parse_speak(rest).map(BridgeCommand::Speak),
        "#faye_action" => parse_action(rest).map(BridgeCommand::Action),
        "#faye_profile_activate" => parse_profile_activate(rest),
        "#faye_ping" => Some(BridgeCommand::Ping),
        _ => None,
    }
}

fn split_first_token(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(idx) => (&input[..idx], input[idx..].trim_start()),
        None => (input, ""),
    }
}

fn unquote(value: &str) -> &str {
    let v = value.trim();
    if v.len() >= 2
        && ((v.starts_with('"') && v.ends_with('"')) || (v.starts_with('\'') && v.ends_with('\'')))
    {
        &v[1..v.len() - 1]
    } else {
        v
    }
}

fn non_empty(value: &str) -> Option<String> {
    let v = unquote(value).trim();
    (!v.is_empty()).then(|| v.to_owned())
}

fn parse_turn(value: &str) -> Option<u32> {
    unquote(value).parse::<u32>().ok().filter(|t| *t > 0)
}

fn is_session_key(key: &str) -> bool {
    key.eq_ignore_ascii_case("session") || key.eq_ignore_ascii_case("session_id")
}

fn parse_speak(rest: &str) -> Option<SpeakCommand> {
    if rest.starts_with('{') {
        return parse_speak_json(rest);
    }

    let mut session_id = None;
    let mut turn = None;
    let mut remaining = rest.trim_start();
    let text = loop {
        if remaining.is_empty() {
            break None;
        }
        if let Some(text) = remaining.strip_prefix("text=") {
            break non_empty(text);
        }
        let (token, tail) = split_first_token(remaining);
        match token.split_once('=') {
            Some((key, value)) if is_session_key(key) => session_id = non_empty(value),
            Some((key, value)) if key.eq_ignore_ascii_case("turn") => turn = parse_turn(value),
            // Anything else starts free text.
            _ => break non_empty(remaining),
        }
        remaining = tail;
    }?;

    Some(SpeakCommand {
        session_id,
        turn,
        text,
    })
}

fn parse_speak_json(rest: &str) -> Option<SpeakCommand> {
    let value: Value = serde_json::from_str(rest).ok()?;
    let object = value.as_object()?;
    let text = object
        .get("text")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())?
        .trim()
        .to_owned();
    let session_id = ["session_id", "sessionId", "session"]
        .iter()
        .filter_map(|k| object.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_owned()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
    let turn = object.get("turn").and_then(|v| match v {
        Value::Number(n) => n.as_u64().and_then(|t| u32::try_from(t).ok()),
        Value::String(s) => parse_turn(s),
        _ => None,
    });
    Some(SpeakCommand {
        session_id,
        turn: turn.filter(|t| *t > 0),
        text,
    })
}

fn key_values(rest: &str) -> impl Iterator<Item = (&str, &str)> {
    rest.split_whitespace()
        .filter_map(|token| token.split_once('='))
        .map(|(k, v)| (k, unquote(v)))
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "yes" | "y" | "true" | "1" | "confirm" | "confirmed"
    )
}

fn is_valid_action_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_action(rest: &str) -> Option<ActionCommand> {
    let mut name = None;
    let mut session_id = None;
    let mut confirm = false;
    let mut nonce = None;
    for (key, value) in key_values(rest) {
        match key.to_ascii_lowercase().as_str() {
            "name" => name = non_empty(value).map(|n| n.to_ascii_lowercase()),
            "session" | "session_id" => session_id = non_empty(value),
            "confirm" => confirm = is_truthy(value),
            "nonce" => nonce = non_empty(value),
            _ => {}
        }
    }
    let name = name.filter(|n| is_valid_action_name(n))?;
    Some(ActionCommand {
        name,
        session_id,
        confirm,
        nonce,
    })
}

fn parse_profile_activate(rest: &str) -> Option<BridgeCommand> {
    let profile_id = key_values(rest)
        .find(|(key, _)| key.eq_ignore_ascii_case("id"))
        .and_then(|(_, value)| non_empty(value))?;
    Some(BridgeCommand::ActivateProfile { profile_id })
}

/// `#faye_spoken status=... [session=ID]`
#[must_use]
pub fn spoken_ack(status: &str, session_id: Option<&str>) -> String {
    let mut ack = format!("#faye_spoken status={status}");
    if let Some(session) = session_id {
        ack.push_str(&format!(" session={session}"));
    }
    ack
}

/// `#faye_action_result name=... status=... reason=... [session=ID]`
#[must_use]
pub fn action_result_ack(
    name: &str,
    status: &str,
    reason: &str,
    session_id: Option<&str>,
) -> String {
    let mut ack = format!("#faye_action_result name={name} status={status} reason={reason}");
    if let Some(session) = session_id {
        ack.push_str(&format!(" session={session}"));
    }
    ack
}

/// `#faye_pong status=online`
#[must_use]
pub fn pong_ack() -> String {
    "#faye_pong status=online".to_owned()
}

/// `#faye_profile_activated id=... status=...`
#[must_use]
pub fn profile_ack(profile_id: &str, status: &str) -> String {
    format!("#faye_profile_activated id={profile_id} status={status}")
}
