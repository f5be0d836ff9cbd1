//! Engine configuration.
//!
//! Loaded from RON; every field is optional and falls back to the values in
//! [`crate::constants`].
//!
//! ```ron
//! (
//!     debounce_ms: 600,
//!     presence_coalesce_ms: 250,
//!     refetch_displayed: true,
//! )
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_DEBOUNCE, DEFAULT_EVENT_BUFFER, DEFAULT_NOTICE_BUFFER, DEFAULT_PRESENCE_COALESCE,
};

/// Tuning knobs for a [`SyncEngine`](crate::SyncEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Idle window for the write coalescer, in milliseconds.
    pub debounce_ms: u64,
    /// Presence burst window, in milliseconds.
    pub presence_coalesce_ms: u64,
    /// Capacity of cache-event broadcasts.
    pub event_buffer: usize,
    /// Capacity of the notice broadcast.
    pub notice_buffer: usize,
    /// Refetch invalidated keys that have at least one subscriber.
    pub refetch_displayed: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            presence_coalesce_ms: DEFAULT_PRESENCE_COALESCE.as_millis() as u64,
            event_buffer: DEFAULT_EVENT_BUFFER,
            notice_buffer: DEFAULT_NOTICE_BUFFER,
            refetch_displayed: true,
        }
    }
}

impl SyncConfig {
    /// Parse a RON document.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Read and parse a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn presence_coalesce(&self) -> Duration {
        Duration::from_millis(self.presence_coalesce_ms)
    }

    /// Builder-style override of the debounce window.
    pub fn with_debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = window.as_millis() as u64;
        self
    }
}

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce(), DEFAULT_DEBOUNCE);
        assert_eq!(config.presence_coalesce(), DEFAULT_PRESENCE_COALESCE);
        assert!(config.refetch_displayed);
    }

    #[test]
    fn test_partial_ron_keeps_defaults() {
        let config = SyncConfig::from_ron_str("(debounce_ms: 500)").unwrap();
        assert_eq!(config.debounce(), Duration::from_millis(500));
        assert_eq!(config.event_buffer, DEFAULT_EVENT_BUFFER);
    }

    #[test]
    fn test_bad_ron_is_an_error() {
        let err = SyncConfig::from_ron_str("(debounce_ms: \"soon\")").unwrap_err();
        assert!(matches!(err, ConfigError::Ron(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "(refetch_displayed: false, notice_buffer: 8)").unwrap();
        let config = SyncConfig::load(file.path()).unwrap();
        assert!(!config.refetch_displayed);
        assert_eq!(config.notice_buffer, 8);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = SyncConfig::load("/nonexistent/roadmap-sync.ron").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
