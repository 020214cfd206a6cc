//! Redelivery and crash-recovery behavior of the command bridge.

use crate::helpers::{bridge_in, bridge_with_config, event_statuses, update};
use faye::bridge::{RuntimeState, RuntimeStatusStore};
use faye::config::BridgeConfig;
use faye::events::EventHub;
use faye::faye_dirs;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn identical_batch_twice_executes_once_and_reports_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let h = bridge_in(dir.path(), EventHub::new(100));
    let batch = vec![update(100, "#faye_speak session=s1 turn=1 text=hello")];

    let first = h.bridge.process_updates(&batch).await.unwrap();
    assert_eq!(first.processed, 1);
    let second = h.bridge.process_updates(&batch).await.unwrap();
    assert_eq!(second.duplicates, 1);

    assert_eq!(h.local.calls(), vec!["speak:s1:hello"]);
    assert_eq!(
        h.transport.sent(),
        vec![
            "#faye_spoken status=ok session=s1",
            "#faye_spoken status=duplicate session=s1"
        ]
    );
    let spoken: Vec<Option<String>> = event_statuses(&h.hub)
        .into_iter()
        .filter(|(kind, _)| kind == "bridge_spoken")
        .map(|(_, status)| status)
        .collect();
    assert_eq!(
        spoken,
        vec![Some("ok".to_owned()), Some("duplicate".to_owned())]
    );
    assert_eq!(h.bridge.offset().await, Some(100));
}

#[tokio::test]
async fn crash_before_offset_write_never_repeats_side_effect() {
    let dir = tempfile::tempdir().unwrap();
    let offset_path = faye_dirs::offset_file(dir.path());
    // A directory where the offset file belongs makes the offset write fail
    // after the side effect and key mark have succeeded.
    std::fs::create_dir_all(&offset_path).unwrap();

    let batch = vec![update(7, "#faye_speak session=s1 text=only once")];
    let crashed = bridge_in(dir.path(), EventHub::new(100));
    assert!(crashed.bridge.process_updates(&batch).await.is_err());
    assert_eq!(crashed.local.count("speak:"), 1);
    assert_eq!(crashed.bridge.offset().await, None);

    // Restart with the offset store repaired; the update is redelivered.
    std::fs::remove_dir(&offset_path).unwrap();
    let restarted = bridge_in(dir.path(), EventHub::new(100));
    let report = restarted.bridge.process_updates(&batch).await.unwrap();

    assert_eq!(restarted.local.count("speak:"), 0);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.offset, Some(7));
    assert_eq!(restarted.bridge.offset().await, Some(7));
}

#[tokio::test]
async fn failed_key_write_aborts_before_ack_and_offset() {
    let dir = tempfile::tempdir().unwrap();
    let keys_path = faye_dirs::processed_keys_file(dir.path());
    std::fs::create_dir_all(&keys_path).unwrap();

    let confirmed = "#faye_action name=listener_restart nonce=n-1 confirm=yes";
    let h = bridge_in(dir.path(), EventHub::new(100));
    assert!(h.bridge.process_updates(&[update(1, confirmed)]).await.is_err());
    assert_eq!(h.local.count("restart:"), 1);
    assert!(h.transport.sent().is_empty());
    assert_eq!(h.bridge.offset().await, None);

    // Redelivered in the same process: the key is still marked in memory, so
    // the restart is skipped and the key file is written before the offset.
    std::fs::remove_dir(&keys_path).unwrap();
    let report = h.bridge.process_updates(&[update(1, confirmed)]).await.unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(h.local.count("restart:"), 1);
    assert_eq!(h.bridge.offset().await, Some(1));

    // After a restart the same nonce under a new update id is still a duplicate.
    let restarted = bridge_in(dir.path(), EventHub::new(100));
    let report = restarted
        .bridge
        .process_updates(&[update(2, confirmed)])
        .await
        .unwrap();
    assert_eq!(report.duplicates, 1);
    assert_eq!(restarted.local.count("restart:"), 0);
}

#[tokio::test]
async fn poll_once_resumes_after_persisted_offset() {
    let dir = tempfile::tempdir().unwrap();
    let h = bridge_in(dir.path(), EventHub::new(100));
    h.transport.push_batch(vec![
        update(1, "#faye_ping"),
        update(2, "not a command"),
        update(3, "#faye_speak text=hi"),
    ]);

    let report = h.bridge.poll_once().await.unwrap();
    assert_eq!((report.processed, report.skipped), (2, 1));
    assert_eq!(report.offset, Some(3));

    // The transport redelivers everything; only update 4 is past the offset.
    h.transport.push_batch(vec![
        update(1, "#faye_ping"),
        update(3, "#faye_speak text=hi"),
        update(4, "#faye_speak text=again"),
    ]);
    let report = h.bridge.poll_once().await.unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(report.duplicates, 0);
    assert_eq!(h.local.count("speak:"), 2);
    assert_eq!(h.bridge.offset().await, Some(4));
}

#[tokio::test]
async fn runtime_status_file_tracks_the_poll_loop() {
    let dir = tempfile::tempdir().unwrap();
    let h = bridge_in(dir.path(), EventHub::new(100));
    h.transport.push_batch(vec![update(5, "#faye_ping")]);

    let cancel = CancellationToken::new();
    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
    });
    h.bridge.run(cancel).await.unwrap();

    let on_disk = RuntimeStatusStore::read(dir.path());
    assert_eq!(on_disk.state, RuntimeState::Idle);
    assert_eq!(on_disk.consecutive_errors, 0);
    assert_eq!(on_disk.offset, Some(5));
    assert_eq!(h.transport.sent(), vec!["#faye_pong status=online"]);
}

#[tokio::test(start_paused = true)]
async fn failing_polls_back_off_then_recover() {
    let dir = tempfile::tempdir().unwrap();
    let h = bridge_with_config(
        BridgeConfig {
            state_dir: Some(dir.path().to_path_buf()),
            max_backoff_ms: 2_500,
            ..BridgeConfig::default()
        },
        EventHub::new(100),
    );
    // Fetches fail at t=0, 1000 and 3000 ms; the fourth, at 5500 ms, succeeds.
    h.transport.fail_fetches(3);
    h.transport.push_batch(vec![update(9, "#faye_ping")]);

    let cancel = CancellationToken::new();
    let observe = async {
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        let failing = RuntimeStatusStore::read(dir.path());
        assert_eq!(failing.state, RuntimeState::Error);
        assert_eq!(failing.consecutive_errors, 3);
        assert_eq!(failing.backoff_ms, 2_500);
        assert!(
            failing
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("chat API unavailable"))
        );

        tokio::time::sleep(Duration::from_millis(2_000)).await;
        let recovered = RuntimeStatusStore::read(dir.path());
        assert_eq!(recovered.state, RuntimeState::Idle);
        assert_eq!(recovered.consecutive_errors, 0);
        assert_eq!(recovered.backoff_ms, 0);
        assert_eq!(recovered.offset, Some(9));
        cancel.cancel();
    };

    let (result, ()) = tokio::join!(h.bridge.run(cancel.clone()), observe);
    result.unwrap();
    assert_eq!(h.transport.sent(), vec!["#faye_pong status=online"]);
}
