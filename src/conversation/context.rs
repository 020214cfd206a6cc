//! Role-tagged message view of a conversation.

use super::{ActionNote, ActionNoteKind, ConversationTurn};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMessage {
    pub role: MessageRole,
    pub text: String,
    pub turn: Option<u32>,
    pub at_ms: u64,
    /// Delivery status for assistant messages, `None` while pending.
    pub status: Option<String>,
}

/// Options for [`super::ConversationSessionManager::context`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextOptions {
    /// Keep only the most recent N messages (`None` = configured default).
    pub limit: Option<usize>,
    /// Include assistant text that has not been confirmed spoken yet.
    pub include_pending: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub messages: Vec<ContextMessage>,
    /// Older messages were dropped to honor the limit.
    pub truncated: bool,
}

fn note_text(note: &ActionNote) -> String {
    let mut text = format!("action {} {}", note.name, note.kind.as_str());
    match (&note.status, &note.reason) {
        (Some(status), Some(reason)) => text.push_str(&format!(": {status} ({reason})")),
        (Some(status), None) => text.push_str(&format!(": {status}")),
        (None, Some(reason)) => text.push_str(&format!(" ({reason})")),
        (None, None) => {}
    }
    text
}

/// Merge turns and action notes into one time-ordered list, then keep the
/// most recent `limit`.
pub(super) fn build_messages(
    turns: &[ConversationTurn],
    notes: &[ActionNote],
    include_pending: bool,
    limit: usize,
) -> (Vec<ContextMessage>, bool) {
    let mut messages = Vec::with_capacity(turns.len().saturating_mul(2) + notes.len());

    for turn in turns {
        if let Some(text) = &turn.user_text {
            messages.push(ContextMessage {
                role: MessageRole::User,
                text: text.clone(),
                turn: Some(turn.turn),
                at_ms: turn.user_at_ms.unwrap_or(0),
                status: None,
            });
        }
        if let Some(text) = &turn.assistant_text {
            if turn.assistant_status.is_none() && !include_pending {
                continue;
            }
            messages.push(ContextMessage {
                role: MessageRole::Assistant,
                text: text.clone(),
                turn: Some(turn.turn),
                at_ms: turn.assistant_at_ms.unwrap_or(0),
                status: turn.assistant_status.clone(),
            });
        }
    }

    for note in notes {
        if note.kind == ActionNoteKind::Requested && !include_pending {
            continue;
        }
        messages.push(ContextMessage {
            role: MessageRole::System,
            text: note_text(note),
            turn: None,
            at_ms: note.at_ms,
            status: note.status.clone(),
        });
    }

    // Stable: ties keep turn order ahead of notes.
    messages.sort_by_key(|m| m.at_ms);

    let truncated = messages.len() > limit;
    if truncated {
        messages.drain(..messages.len() - limit);
    }
    (messages, truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(n: u32, user: &str, assistant: Option<(&str, Option<&str>)>, at: u64) -> ConversationTurn {
        ConversationTurn {
            turn: n,
            user_text: Some(user.to_owned()),
            user_at_ms: Some(at),
            assistant_text: assistant.map(|(t, _)| t.to_owned()),
            assistant_at_ms: assistant.map(|_| at + 1),
            assistant_status: assistant.and_then(|(_, s)| s.map(str::to_owned)),
        }
    }

    #[test]
    fn pending_assistant_text_is_opt_in() {
        let turns = [turn(1, "hi", Some(("hello", None)), 10)];
        let (without, _) = build_messages(&turns, &[], false, 10);
        assert_eq!(without.len(), 1);
        let (with, _) = build_messages(&turns, &[], true, 10);
        assert_eq!(with.len(), 2);
        assert_eq!(with[1].role, MessageRole::Assistant);
        assert!(with[1].status.is_none());
    }

    #[test]
    fn notes_interleave_by_time_and_limit_keeps_tail() {
        let turns = [
            turn(1, "one", Some(("uno", Some("ok"))), 10),
            turn(2, "two", Some(("dos", Some("ok"))), 30),
        ];
        let notes = [ActionNote {
            kind: ActionNoteKind::Executed,
            name: "health".to_owned(),
            status: Some("ok".to_owned()),
            reason: Some("degraded".to_owned()),
            at_ms: 20,
        }];
        let (messages, truncated) = build_messages(&turns, &notes, false, 3);
        assert!(truncated);
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["action health executed: ok (degraded)", "two", "dos"]);
        assert_eq!(messages[0].role, MessageRole::System);
    }
}
