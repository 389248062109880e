//! Player configuration, loadable from a JSON file and overridable from
//! the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Fit;

/// Default number of external output buffers. The decoder needs at least
/// 16 outstanding buffers; 20+ is recommended for reordering headroom.
pub const DEFAULT_POOL_CAPACITY: usize = 24;

/// Smallest pool the decoder can run with.
pub const MIN_POOL_CAPACITY: usize = 16;

/// Read size for the elementary stream.
pub const DEFAULT_PACKET_SIZE: usize = 1024 * 1024;

/// Delay between retries while the decoder input queue is full.
pub const DEFAULT_SUBMIT_BACKOFF_MS: u64 = 10;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level player configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    /// DRM device node.
    pub device: PathBuf,
    /// Number of buffers in the external output pool.
    pub pool_capacity: usize,
    /// Bytes read from the input per decoder packet.
    pub packet_size: usize,
    /// Backoff between packet submissions while the decoder is full.
    pub submit_backoff_ms: u64,
    /// How the picture is placed on the display.
    pub fit: Fit,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/dri/card0"),
            pool_capacity: DEFAULT_POOL_CAPACITY,
            packet_size: DEFAULT_PACKET_SIZE,
            submit_backoff_ms: DEFAULT_SUBMIT_BACKOFF_MS,
            fit: Fit::Aspect,
        }
    }
}

impl PlayerConfig {
    /// Load a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn submit_backoff(&self) -> Duration {
        Duration::from_millis(self.submit_backoff_ms)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_capacity < MIN_POOL_CAPACITY {
            return Err(ConfigError::Invalid(format!(
                "pool_capacity {} is below the decoder minimum of {MIN_POOL_CAPACITY}",
                self.pool_capacity
            )));
        }
        if self.packet_size == 0 {
            return Err(ConfigError::Invalid("packet_size must be > 0".into()));
        }
        if self.submit_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "submit_backoff_ms must be > 0 (retry would spin)".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PlayerConfig::default();
        assert_eq!(config.pool_capacity, 24);
        assert_eq!(config.packet_size, 1 << 20);
        assert_eq!(config.submit_backoff(), Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = PlayerConfig::from_json(r#"{ "pool_capacity": 32, "fit": "fullscreen" }"#)
            .unwrap();
        assert_eq!(config.pool_capacity, 32);
        assert_eq!(config.fit, Fit::Fullscreen);
        assert_eq!(config.device, PathBuf::from("/dev/dri/card0"));
    }

    #[test]
    fn small_pool_is_rejected() {
        let config = PlayerConfig {
            pool_capacity: 8,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pool_capacity"));
    }

    #[test]
    fn zero_backoff_is_rejected() {
        let config = PlayerConfig {
            submit_backoff_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = PlayerConfig::load(Path::new("/nonexistent/rkplay.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
