//! Shared fakes for integration tests.

use async_trait::async_trait;
use faye::bridge::{ChatTransport, CommandBridge, ExternalUpdate, LocalServices, RestartTarget};
use faye::config::BridgeConfig;
use faye::events::EventHub;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Transport that serves queued batches and records outgoing messages.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    batches: Mutex<Vec<Vec<ExternalUpdate>>>,
    sent: Mutex<Vec<String>>,
    failing_fetches: AtomicU32,
}

impl ScriptedTransport {
    /// Make the next `n` fetches fail.
    pub(crate) fn fail_fetches(&self, n: u32) {
        self.failing_fetches.store(n, Ordering::SeqCst);
    }

    pub(crate) fn push_batch(&self, batch: Vec<ExternalUpdate>) {
        self.batches.lock().unwrap().push(batch);
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    fn id(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_updates(
        &self,
        after: Option<i64>,
        _timeout_secs: u64,
    ) -> anyhow::Result<Vec<ExternalUpdate>> {
        if self
            .failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("chat API unavailable");
        }
        let mut batches = self.batches.lock().unwrap();
        if batches.is_empty() {
            return Ok(Vec::new());
        }
        let batch = batches.remove(0);
        Ok(batch
            .into_iter()
            .filter(|u| after.is_none_or(|a| u.update_id > a))
            .collect())
    }

    async fn latest_update(&self) -> anyhow::Result<Option<ExternalUpdate>> {
        Ok(None)
    }

    async fn send_message(&self, _chat_id: &str, text: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(text.to_owned());
        Ok(())
    }
}

/// Local services that record every side-effecting call.
#[derive(Default)]
pub(crate) struct RecordingLocal {
    calls: Mutex<Vec<String>>,
}

impl RecordingLocal {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl LocalServices for RecordingLocal {
    async fn speak(&self, text: &str, session_id: Option<&str>) -> anyhow::Result<()> {
        self.record(format!("speak:{}:{text}", session_id.unwrap_or("-")));
        Ok(())
    }

    async fn activate_profile(&self, profile_id: &str) -> anyhow::Result<()> {
        self.record(format!("activate:{profile_id}"));
        Ok(())
    }

    async fn restart(&self, target: RestartTarget) -> anyhow::Result<()> {
        self.record(format!("restart:{}", target.as_str()));
        Ok(())
    }

    async fn health_summary(&self) -> anyhow::Result<Value> {
        Ok(json!({"status": "ok"}))
    }
}

pub(crate) struct BridgeHarness {
    pub(crate) hub: EventHub,
    pub(crate) transport: Arc<ScriptedTransport>,
    pub(crate) local: Arc<RecordingLocal>,
    pub(crate) bridge: CommandBridge,
}

/// Bridge over fakes, with state kept in `state_dir`.
pub(crate) fn bridge_in(state_dir: &Path, hub: EventHub) -> BridgeHarness {
    bridge_with_config(
        BridgeConfig {
            state_dir: Some(state_dir.to_path_buf()),
            ..BridgeConfig::default()
        },
        hub,
    )
}

pub(crate) fn bridge_with_config(config: BridgeConfig, hub: EventHub) -> BridgeHarness {
    let transport = Arc::new(ScriptedTransport::default());
    let local = Arc::new(RecordingLocal::default());
    let bridge = CommandBridge::new(config, hub.clone(), transport.clone(), local.clone());
    BridgeHarness {
        hub,
        transport,
        local,
        bridge,
    }
}

pub(crate) fn update(update_id: i64, text: &str) -> ExternalUpdate {
    ExternalUpdate::text(update_id, "42", text)
}

/// `(type, status)` for every recent event.
pub(crate) fn event_statuses(hub: &EventHub) -> Vec<(String, Option<String>)> {
    hub.recent_events()
        .iter()
        .map(|e| (e.event_type().to_owned(), e.fields().status))
        .collect()
}
