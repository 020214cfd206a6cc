//! Error types for the faye bridge.

/// Top-level error type for session orchestration and the command bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Persisted bridge state (offset, processed keys, runtime status) error.
    #[error("state error: {0}")]
    State(String),

    /// External chat transport error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Profile store or secret file error.
    #[error("profile error: {0}")]
    Profile(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BridgeError>;
