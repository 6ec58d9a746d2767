use std::path::PathBuf;

use thiserror::Error;

/// Unified error type for entity sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    // Provider errors
    #[error("Provider failed to start for '{key}': {message}")]
    Provider { key: String, message: String },

    // CRDT errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Host callback errors
    #[error("Record handler error: {0}")]
    Handler(String),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to read config '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl SyncError {
    /// Build a provider error for the given entity key.
    pub fn provider(key: impl ToString, message: impl ToString) -> Self {
        SyncError::Provider {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

/// Result type alias for entity sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
