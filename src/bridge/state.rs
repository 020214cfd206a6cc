//! Durable bridge state: processed idempotency keys, the consumed-update
//! offset, and the runtime status file.
//!
//! Every file is written via tmp + rename and restricted to the owner.
//! Unreadable or malformed files are logged and replaced by defaults; they
//! never stop the bridge.

use crate::error::{BridgeError, Result};
use crate::faye_dirs;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::warn;

pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| BridgeError::State(format!("create state dir: {e}")))?;
    }

    let json = serde_json::to_string_pretty(value)
        .map_err(|e| BridgeError::State(format!("serialize {}: {e}", path.display())))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &json)
        .map_err(|e| BridgeError::State(format!("write {}: {e}", tmp_path.display())))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| BridgeError::State(format!("rename {}: {e}", path.display())))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(path, perms);
    }

    Ok(())
}

fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return T::default(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable bridge state, using defaults");
            return T::default();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "malformed bridge state, using defaults");
            T::default()
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ProcessedKeysFile {
    keys: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct OffsetFile {
    offset: Option<i64>,
    updated_at: Option<DateTime<Utc>>,
}

/// Processed idempotency keys plus the consumed-update offset.
///
/// Loaded lazily on first use. Keys are kept in insertion order and evicted
/// oldest-first beyond `capacity`. The offset only moves forward and names
/// the last update fully consumed.
#[derive(Debug)]
pub struct BridgeState {
    keys_path: PathBuf,
    offset_path: PathBuf,
    capacity: usize,
    loaded: bool,
    /// Set while the key file lags behind the in-memory key set.
    keys_dirty: bool,
    order: VecDeque<String>,
    keys: HashSet<String>,
    offset: Option<i64>,
}

impl BridgeState {
    #[must_use]
    pub fn new(state_dir: &Path, capacity: usize) -> Self {
        Self {
            keys_path: faye_dirs::processed_keys_file(state_dir),
            offset_path: faye_dirs::offset_file(state_dir),
            capacity: capacity.max(1),
            loaded: false,
            keys_dirty: false,
            order: VecDeque::new(),
            keys: HashSet::new(),
            offset: None,
        }
    }

    fn ensure_loaded(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;

        let file: ProcessedKeysFile = read_json_or_default(&self.keys_path);
        for key in file.keys {
            if self.keys.insert(key.clone()) {
                self.order.push_back(key);
            }
        }
        self.evict_overflow();

        let offset: OffsetFile = read_json_or_default(&self.offset_path);
        self.offset = offset.offset;
    }

    fn evict_overflow(&mut self) {
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    pub fn is_processed(&mut self, key: &str) -> bool {
        self.ensure_loaded();
        self.keys.contains(key)
    }

    /// Record `key` as processed and persist the key set.
    ///
    /// The key stays marked in memory even if the write fails; the next
    /// [`Self::flush_keys`] retries the write.
    pub fn mark_processed(&mut self, key: &str) -> Result<()> {
        self.ensure_loaded();
        if !self.keys.insert(key.to_owned()) {
            return Ok(());
        }
        self.order.push_back(key.to_owned());
        self.evict_overflow();
        self.keys_dirty = true;
        self.flush_keys()
    }

    /// Write the key set if an earlier write failed. No-op when in sync.
    pub fn flush_keys(&mut self) -> Result<()> {
        if !self.keys_dirty {
            return Ok(());
        }
        let file = ProcessedKeysFile {
            keys: self.order.iter().cloned().collect(),
        };
        write_json_atomic(&self.keys_path, &file)?;
        self.keys_dirty = false;
        Ok(())
    }

    pub fn processed_count(&mut self) -> usize {
        self.ensure_loaded();
        self.order.len()
    }

    pub fn offset(&mut self) -> Option<i64> {
        self.ensure_loaded();
        self.offset
    }

    /// Move the offset forward to `offset`. Returns `false` without writing
    /// when `offset` is not ahead of the current one.
    pub fn advance_offset(&mut self, offset: i64) -> Result<bool> {
        self.ensure_loaded();
        if self.offset.is_some_and(|current| offset <= current) {
            return Ok(false);
        }
        let file = OffsetFile {
            offset: Some(offset),
            updated_at: Some(Utc::now()),
        };
        write_json_atomic(&self.offset_path, &file)?;
        self.offset = Some(offset);
        Ok(true)
    }
}

/// Coarse poll-loop state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    #[default]
    Starting,
    Idle,
    Processing,
    Error,
}

/// Contents of `bridge-runtime-status.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeStatus {
    pub state: RuntimeState,
    pub consecutive_errors: u32,
    pub backoff_ms: u64,
    pub last_error: Option<String>,
    pub offset: Option<i64>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Error backoff: 0 with no errors, else `min(1000 * 2^(n-1), max_ms)`.
#[must_use]
pub fn backoff_ms(consecutive_errors: u32, max_ms: u64) -> u64 {
    if consecutive_errors == 0 {
        return 0;
    }
    let mut backoff: u64 = 1_000;
    for _ in 1..consecutive_errors {
        backoff = backoff.saturating_mul(2);
        if backoff >= max_ms {
            break;
        }
    }
    backoff.min(max_ms)
}

/// Runtime status kept in memory and mirrored to disk on every change.
#[derive(Debug)]
pub struct RuntimeStatusStore {
    path: PathBuf,
    current: RuntimeStatus,
}

impl RuntimeStatusStore {
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: faye_dirs::runtime_status_file(state_dir),
            current: RuntimeStatus::default(),
        }
    }

    /// Read a status file written by a (possibly other) bridge process.
    #[must_use]
    pub fn read(state_dir: &Path) -> RuntimeStatus {
        read_json_or_default(&faye_dirs::runtime_status_file(state_dir))
    }

    #[must_use]
    pub fn current(&self) -> &RuntimeStatus {
        &self.current
    }

    /// Apply `change` and persist. Write failures are logged only.
    pub fn update(&mut self, change: impl FnOnce(&mut RuntimeStatus)) {
        change(&mut self.current);
        self.current.updated_at = Some(Utc::now());
        if let Err(e) = write_json_atomic(&self.path, &self.current) {
            warn!(error = %e, "failed to persist bridge runtime status");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn keys_and_offset_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = BridgeState::new(dir.path(), 10);
        assert!(!state.is_processed("speak:s1:1"));
        state.mark_processed("speak:s1:1").unwrap();
        assert!(state.advance_offset(1).unwrap());

        let mut reloaded = BridgeState::new(dir.path(), 10);
        assert!(reloaded.is_processed("speak:s1:1"));
        assert_eq!(reloaded.offset(), Some(1));
    }

    #[test]
    fn key_set_is_bounded_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = BridgeState::new(dir.path(), 2);
        state.mark_processed("a").unwrap();
        state.mark_processed("b").unwrap();
        state.mark_processed("a").unwrap();
        state.mark_processed("c").unwrap();
        assert!(!state.is_processed("a"));
        assert!(state.is_processed("b"));
        assert!(state.is_processed("c"));
        assert_eq!(state.processed_count(), 2);

        let mut reloaded = BridgeState::new(dir.path(), 2);
        assert!(!reloaded.is_processed("a"));
        assert!(reloaded.is_processed("c"));
    }

    #[test]
    fn offset_never_moves_backwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = BridgeState::new(dir.path(), 10);
        assert!(state.advance_offset(7).unwrap());
        assert!(!state.advance_offset(7).unwrap());
        assert!(!state.advance_offset(3).unwrap());
        assert_eq!(state.offset(), Some(7));
    }

    #[test]
    fn malformed_files_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(faye_dirs::processed_keys_file(dir.path()), "{oops").unwrap();
        std::fs::write(faye_dirs::offset_file(dir.path()), "[1,2]").unwrap();

        let mut state = BridgeState::new(dir.path(), 10);
        assert_eq!(state.processed_count(), 0);
        assert_eq!(state.offset(), None);
        state.mark_processed("x").unwrap();
        assert!(BridgeState::new(dir.path(), 10).is_processed("x"));
    }

    #[test]
    fn failed_offset_write_keeps_previous_offset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(faye_dirs::offset_file(dir.path())).unwrap();
        let mut state = BridgeState::new(dir.path(), 10);
        assert!(state.advance_offset(5).is_err());
        assert_eq!(state.offset(), None);
    }

    #[test]
    fn failed_key_write_is_retried_by_flush() {
        let dir = tempfile::tempdir().unwrap();
        let keys_path = faye_dirs::processed_keys_file(dir.path());
        std::fs::create_dir_all(&keys_path).unwrap();

        let mut state = BridgeState::new(dir.path(), 10);
        assert!(state.mark_processed("k").is_err());
        assert!(state.is_processed("k"));
        assert!(state.flush_keys().is_err());

        std::fs::remove_dir(&keys_path).unwrap();
        state.flush_keys().unwrap();
        assert!(BridgeState::new(dir.path(), 10).is_processed("k"));
    }

    #[cfg(unix)]
    #[test]
    fn state_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let mut state = BridgeState::new(dir.path(), 10);
        state.mark_processed("k").unwrap();
        let mode = std::fs::metadata(faye_dirs::processed_keys_file(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        assert_eq!(backoff_ms(0, 30_000), 0);
        assert_eq!(backoff_ms(1, 30_000), 1_000);
        assert_eq!(backoff_ms(2, 30_000), 2_000);
        assert_eq!(backoff_ms(5, 30_000), 16_000);
        assert_eq!(backoff_ms(6, 30_000), 30_000);
        assert_eq!(backoff_ms(u32::MAX, 30_000), 30_000);
    }

    #[test]
    fn runtime_status_is_mirrored_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RuntimeStatusStore::new(dir.path());
        store.update(|s| {
            s.state = RuntimeState::Error;
            s.consecutive_errors = 2;
            s.backoff_ms = 2_000;
            s.last_error = Some("boom".to_owned());
        });

        let on_disk = RuntimeStatusStore::read(dir.path());
        assert_eq!(on_disk.state, RuntimeState::Error);
        assert_eq!(on_disk.consecutive_errors, 2);
        assert_eq!(on_disk.last_error.as_deref(), Some("boom"));
        assert_eq!(&on_disk, store.current());
    }
}
