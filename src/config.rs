//! Configuration types for the bridge and its session consumers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FayeConfig {
    /// In-process event hub settings.
    pub events: EventsConfig,
    /// Per-turn watchdog / retry settings.
    pub roundtrip: RoundTripConfig,
    /// Multi-turn conversation session settings.
    pub conversation: ConversationConfig,
    /// External command bridge settings.
    pub bridge: BridgeConfig,
    /// Profile store location.
    pub profiles: ProfilesConfig,
}

/// Event hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Number of recent events retained in memory (oldest dropped).
    pub history_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
        }
    }
}

/// Round-trip watchdog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundTripConfig {
    /// How long to wait for the assistant after a transcription, in ms.
    pub watchdog_ms: u64,
    /// Maximum automatic resends per round trip.
    pub retry_limit: u32,
    /// Sessions untouched for longer than this are swept, in ms.
    pub stale_ms: u64,
    /// Maximum pending sessions reported in snapshots.
    pub pending_list_limit: usize,
}

impl Default for RoundTripConfig {
    fn default() -> Self {
        Self {
            watchdog_ms: 12_000,
            retry_limit: 1,
            stale_ms: 120_000,
            pending_list_limit: 20,
        }
    }
}

/// Conversation session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Idle time before a session is purged, in ms.
    pub ttl_ms: u64,
    /// Maximum tracked sessions before capacity eviction.
    pub max_sessions: usize,
    /// Retained turns per session (older turns are dropped).
    pub max_turns_per_session: usize,
    /// Turn limit granted to a fresh conversation loop.
    pub base_turns: u32,
    /// Turns added per extension.
    pub extend_by: u32,
    /// Absolute turn limit.
    pub hard_cap: u32,
    /// Default number of messages returned by context views.
    pub context_message_limit: usize,
    /// Retained action notes per session.
    pub max_notes_per_session: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 15 * 60 * 1000,
            max_sessions: 32,
            max_turns_per_session: 24,
            base_turns: 8,
            extend_by: 4,
            hard_cap: 16,
            context_message_limit: 40,
            max_notes_per_session: 32,
        }
    }
}

/// Command bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL of the local synthesis / activation / restart API.
    pub local_api_url: String,
    /// Base URL of the Telegram Bot API.
    pub telegram_api_url: String,
    /// Only messages from this chat are executed (None = any chat).
    pub chat_id: Option<String>,
    /// Long-poll timeout for update fetches, in seconds.
    pub poll_timeout_secs: u64,
    /// A latest update younger than this is replayed on first start.
    pub bootstrap_recent_secs: u64,
    /// Processed idempotency keys retained on disk.
    pub processed_key_capacity: usize,
    /// Ceiling for the poll error backoff, in ms.
    pub max_backoff_ms: u64,
    /// State directory override (None = platform default).
    pub state_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            local_api_url: "http://127.0.0.1:8765".to_owned(),
            telegram_api_url: "https://api.telegram.org".to_owned(),
            chat_id: None,
            poll_timeout_secs: 25,
            bootstrap_recent_secs: 120,
            processed_key_capacity: 500,
            max_backoff_ms: 30_000,
            state_dir: None,
        }
    }
}

impl BridgeConfig {
    /// Resolved state directory.
    #[must_use]
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(crate::faye_dirs::state_dir)
    }
}

/// Profile store location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesConfig {
    /// Profile store file override (None = `config_dir()/profiles.json`).
    pub path: Option<PathBuf>,
}

impl ProfilesConfig {
    /// Resolved profile store path.
    #[must_use]
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(crate::faye_dirs::profiles_file)
    }
}

impl FayeConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::error::BridgeError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::BridgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path (`config_dir()/config.toml`).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::faye_dirs::config_file()
    }
}
