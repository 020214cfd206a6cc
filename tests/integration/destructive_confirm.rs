//! Confirmation gate for destructive bridge actions.

use crate::helpers::{bridge_in, event_statuses, update};
use faye::events::EventHub;

#[tokio::test]
async fn unconfirmed_then_confirmed_nonce_restarts_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let h = bridge_in(dir.path(), EventHub::new(100));

    let blocked = h
        .bridge
        .process_updates(&[update(
            1,
            "#faye_action name=listener_restart session=s1 nonce=n-1",
        )])
        .await
        .unwrap();
    assert_eq!(blocked.blocked, 1);
    assert_eq!(h.local.count("restart:"), 0);

    let confirmed = h
        .bridge
        .process_updates(&[update(
            2,
            "#faye_action name=listener_restart session=s1 nonce=n-1 confirm=yes",
        )])
        .await
        .unwrap();
    assert_eq!(confirmed.processed, 1);
    assert_eq!(h.local.calls(), vec!["restart:listener"]);

    // Same confirmed nonce under a new update id and as an exact replay.
    let replay = h
        .bridge
        .process_updates(&[
            update(
                3,
                "#faye_action name=listener_restart session=s1 nonce=n-1 confirm=yes",
            ),
            update(
                2,
                "#faye_action name=listener_restart session=s1 nonce=n-1 confirm=yes",
            ),
        ])
        .await
        .unwrap();
    assert_eq!(replay.duplicates, 2);
    assert_eq!(h.local.count("restart:"), 1);
    assert_eq!(h.bridge.offset().await, Some(3));

    assert_eq!(
        h.transport.sent(),
        vec![
            "#faye_action_result name=listener_restart status=needs_confirm reason=confirmation_required session=s1",
            "#faye_action_result name=listener_restart status=ok reason=restart_requested session=s1",
        ]
    );
    let kinds: Vec<String> = event_statuses(&h.hub)
        .into_iter()
        .map(|(kind, _)| kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            "bridge_action_requested",
            "bridge_action_blocked",
            "bridge_action_requested",
            "bridge_action_executed",
            "bridge_duplicate",
            "bridge_duplicate",
        ]
    );
}

#[tokio::test]
async fn unconfirmed_destructive_actions_never_restart() {
    let dir = tempfile::tempdir().unwrap();
    let h = bridge_in(dir.path(), EventHub::new(100));
    let report = h
        .bridge
        .process_updates(&[
            update(1, "#faye_action name=bridge_restart"),
            update(2, "#faye_action name=bridge_restart confirm=no nonce=x"),
            update(3, "#faye_action name=listener_restart confirm=maybe"),
        ])
        .await
        .unwrap();
    assert_eq!(report.blocked, 3);
    assert!(h.local.calls().is_empty());
    // Blocked requests still consume their updates.
    assert_eq!(report.offset, Some(3));
}

#[tokio::test]
async fn non_destructive_action_needs_no_confirmation() {
    let dir = tempfile::tempdir().unwrap();
    let h = bridge_in(dir.path(), EventHub::new(100));
    let report = h
        .bridge
        .process_updates(&[update(1, "#faye_action name=health")])
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(
        h.transport.sent(),
        vec!["#faye_action_result name=health status=ok reason=ok"]
    );
}
