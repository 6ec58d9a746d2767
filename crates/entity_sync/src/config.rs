//! Configuration for the entity sync engine.
//!
//! [`EngineConfig`] holds the few tuning knobs the engine exposes. It can be
//! built in code or parsed from TOML:
//!
//! ```toml
//! local_editor_origin = "block-editor"
//! undo_capture_timeout_ms = 750
//! ```
//!
//! Missing keys fall back to their defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SyncError};
use crate::types::LOCAL_EDITOR_ORIGIN;

/// Default window in which consecutive local edits merge into one undo step.
pub const DEFAULT_UNDO_CAPTURE_TIMEOUT_MS: u64 = 500;

/// Engine-wide settings shared by the sync manager and the undo coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Origin tag the host editor attaches to its own edits.
    /// Only transactions carrying this origin are captured into undo history.
    pub local_editor_origin: String,

    /// Consecutive local edits closer together than this are merged into a
    /// single undo step.
    pub undo_capture_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_editor_origin: LOCAL_EDITOR_ORIGIN.to_string(),
            undo_capture_timeout_ms: DEFAULT_UNDO_CAPTURE_TIMEOUT_MS,
        }
    }
}

impl EngineConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load a config from a TOML file on disk.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| SyncError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Set the local editor origin.
    pub fn with_local_editor_origin(mut self, origin: impl Into<String>) -> Self {
        self.local_editor_origin = origin.into();
        self
    }

    /// Set the undo capture window.
    pub fn with_undo_capture_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.undo_capture_timeout_ms = timeout_ms;
        self
    }
}
