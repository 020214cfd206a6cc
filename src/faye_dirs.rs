//! Centralized filesystem paths for the bridge.
//!
//! Uses the [`dirs`] crate for platform-appropriate directory resolution.
//!
//! # Directory Layout
//!
//! | Purpose | macOS | Linux |
//! |---------|-------|-------|
//! | Config | `~/Library/Application Support/faye/` | `~/.config/faye/` |
//! | State | `~/Library/Application Support/faye/state/` | `~/.local/share/faye/state/` |
//!
//! # Environment Overrides
//!
//! - `FAYE_CONFIG_DIR` overrides [`config_dir`]
//! - `FAYE_STATE_DIR` overrides [`state_dir`]

use std::path::PathBuf;

/// Application config directory.
///
/// Resolves to `dirs::config_dir()/faye/` by default.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("FAYE_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("faye"))
        .unwrap_or_else(|| PathBuf::from("/tmp/faye-config"))
}

/// Bridge state directory (offset watermark, processed keys, runtime status).
///
/// Resolves to `dirs::data_dir()/faye/state/` by default.
#[must_use]
pub fn state_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("FAYE_STATE_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("faye").join("state"))
        .unwrap_or_else(|| PathBuf::from("/tmp/faye-state"))
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// Profile store file path (`config_dir()/profiles.json`).
#[must_use]
pub fn profiles_file() -> PathBuf {
    config_dir().join("profiles.json")
}

/// Offset watermark file inside a state directory.
#[must_use]
pub fn offset_file(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("bridge-offset.json")
}

/// Processed idempotency keys file inside a state directory.
#[must_use]
pub fn processed_keys_file(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("bridge-processed-keys.json")
}

/// Runtime status file inside a state directory.
#[must_use]
pub fn runtime_status_file(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("bridge-runtime-status.json")
}
