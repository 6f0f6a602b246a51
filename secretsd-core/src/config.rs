//! Daemon configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Settings the daemon is constructed with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path of the metadata database. `None` selects an in-memory store.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Directory holding the master and device-lock key files.
    #[serde(default)]
    pub keys_dir: Option<PathBuf>,
    /// When set, only test-mode plugins may be registered.
    #[serde(default)]
    pub test_mode: bool,
    /// Wall-clock budget of one drive pass before yielding to the event
    /// loop.
    #[serde(default = "default_yield_window_ms")]
    pub yield_window_ms: u64,
    /// Override of the request-id space. Production leaves this unset
    /// (full 64-bit space); tests shrink it to exercise queue exhaustion.
    #[serde(default)]
    pub request_id_space: Option<u64>,
}

fn default_yield_window_ms() -> u64 {
    100
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            keys_dir: None,
            test_mode: false,
            yield_window_ms: default_yield_window_ms(),
            request_id_space: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert!(config.database_path.is_none());
        assert!(!config.test_mode);
        assert_eq!(config.yield_window_ms, 100);
        assert!(config.request_id_space.is_none());
    }
}
