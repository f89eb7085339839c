//! Error types for the Kaeva voice engine

use thiserror::Error;

/// Result type alias for voice engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Agent audio could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Playback failed or was blocked by the output device
    #[error("playback error: {0}")]
    Playback(String),

    /// Microphone or speech permission denied (terminal, never retried)
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Another component already holds the microphone
    #[error("microphone busy: held by {0}")]
    MicrophoneBusy(String),

    /// Speech recognition stream error
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Agent channel error
    #[error("channel error: {0}")]
    Channel(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Tool execution error
    #[error("tool error: {0}")]
    Tool(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
