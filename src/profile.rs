//! Read-only access to the profile store and secret files.
//!
//! Profiles are created and edited elsewhere; the bridge only needs the
//! active profile's bound chat and the path of its bot token file.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The subset of a profile the bridge consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeProfile {
    pub id: String,
    /// Chat the agent listens on for this profile.
    #[serde(default, alias = "chatId")]
    pub chat_id: Option<String>,
    /// File holding the bot token.
    #[serde(default, alias = "tokenPath")]
    pub token_path: Option<PathBuf>,
}

/// Source of the currently active profile.
pub trait ProfileStore: Send + Sync {
    fn active_profile(&self) -> Result<Option<BridgeProfile>>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProfileFile {
    active: Option<String>,
    profiles: Vec<BridgeProfile>,
}

/// Profile store backed by a JSON file, re-read on every lookup.
///
/// ```json
/// {"active": "home", "profiles": [{"id": "home", "chat_id": "42", "token_path": "/etc/faye/bot.token"}]}
/// ```
#[derive(Debug, Clone)]
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProfileStore for JsonProfileStore {
    fn active_profile(&self) -> Result<Option<BridgeProfile>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BridgeError::Profile(format!(
                    "failed to read profile store {}: {e}",
                    self.path.display()
                )));
            }
        };
        let file: ProfileFile = serde_json::from_slice(&bytes).map_err(|e| {
            BridgeError::Profile(format!(
                "malformed profile store {}: {e}",
                self.path.display()
            ))
        })?;
        let Some(active) = file.active else {
            return Ok(None);
        };
        Ok(file.profiles.into_iter().find(|p| p.id == active))
    }
}

/// Read a secret from a file. Missing or blank files yield `None`.
pub fn read_secret_file(path: &Path) -> Result<Option<String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(BridgeError::Profile(format!(
                "failed to read secret file {}: {e}",
                path.display()
            )));
        }
    };
    let secret = raw.trim();
    if secret.is_empty() {
        return Ok(None);
    }
    Ok(Some(secret.to_owned()))
}
