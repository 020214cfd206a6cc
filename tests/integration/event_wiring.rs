//! Bridge results flowing through the hub into both session consumers.

use crate::helpers::{bridge_in, update};
use faye::config::{ConversationConfig, RoundTripConfig};
use faye::conversation::{ContextOptions, ConversationSessionManager, ConversationState, MessageRole};
use faye::events::{EventHub, EventKind};
use faye::roundtrip::{NoRetrySender, RoundTripCoordinator};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn spoken_command_completes_round_trip_and_conversation_turn() {
    let dir = tempfile::tempdir().unwrap();
    let hub = EventHub::new(100);
    let coordinator =
        RoundTripCoordinator::new(RoundTripConfig::default(), hub.clone(), Arc::new(NoRetrySender));
    let conversations = ConversationSessionManager::new(ConversationConfig::default(), hub.clone());
    let _rt = coordinator.attach();
    let _conv = conversations.attach();
    let h = bridge_in(dir.path(), hub.clone());

    hub.emit(EventKind::WakeDetected, json!({"session_id": "s1"}));
    hub.emit(
        EventKind::MessageTranscribed,
        json!({"session_id": "s1", "text": "what time is it"}),
    );
    assert!(coordinator.session_status("s1").pending);

    h.bridge
        .process_updates(&[update(1, "#faye_speak session=s1 turn=1 text=It is noon.")])
        .await
        .unwrap();

    let totals = coordinator.snapshot().totals;
    assert_eq!((totals.started, totals.completed, totals.timeouts), (1, 1, 0));
    assert!(!coordinator.session_status("s1").pending);

    let session = conversations.session_snapshot("s1").unwrap();
    assert_eq!(session.state, ConversationState::AwaitingUser);
    assert_eq!(session.total_turns, 1);
    assert_eq!(session.turns[0].assistant_text.as_deref(), Some("It is noon."));
    assert_eq!(session.turns[0].assistant_status.as_deref(), Some("ok"));

    let context = conversations
        .context("s1", ContextOptions::default())
        .unwrap();
    let roles: Vec<MessageRole> = context.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
}

#[tokio::test(start_paused = true)]
async fn watchdog_timeout_ends_the_conversation() {
    let hub = EventHub::new(100);
    let coordinator = RoundTripCoordinator::new(
        RoundTripConfig {
            watchdog_ms: 20,
            ..RoundTripConfig::default()
        },
        hub.clone(),
        Arc::new(NoRetrySender),
    );
    let conversations = ConversationSessionManager::new(ConversationConfig::default(), hub.clone());
    let _rt = coordinator.attach();
    let _conv = conversations.attach();

    hub.emit(EventKind::WakeDetected, json!({"session_id": "s1"}));
    hub.emit(
        EventKind::MessageTranscribed,
        json!({"session_id": "s1", "text": "hello?"}),
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }

    assert_eq!(coordinator.snapshot().totals.timeouts, 1);
    let snapshot = conversations.snapshot();
    assert_eq!(snapshot.end_reasons.get("session_timeout"), Some(&1));
    assert_eq!(
        conversations.session_snapshot("s1").unwrap().state,
        ConversationState::Ended
    );
}

#[tokio::test]
async fn action_results_appear_in_conversation_context() {
    let dir = tempfile::tempdir().unwrap();
    let hub = EventHub::new(100);
    let conversations = ConversationSessionManager::new(ConversationConfig::default(), hub.clone());
    let _conv = conversations.attach();
    let h = bridge_in(dir.path(), hub.clone());

    hub.emit(
        EventKind::MessageTranscribed,
        json!({"session_id": "s1", "text": "restart the listener"}),
    );
    h.bridge
        .process_updates(&[update(1, "#faye_action name=listener_restart session=s1")])
        .await
        .unwrap();

    let context = conversations
        .context("s1", ContextOptions::default())
        .unwrap();
    let system: Vec<&str> = context
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::System)
        .map(|m| m.text.as_str())
        .collect();
    assert_eq!(
        system,
        vec!["action listener_restart blocked: needs_confirm (confirmation_required)"]
    );
}
