//! Timing and retry knobs, persisted as JSON

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provisioning configuration
///
/// Durations are stored in milliseconds so the file stays hand-editable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// How long a human gets to type the PIN shown on the device
    pub pin_timeout_ms: u64,
    /// Require MITM-protected (passkey / numeric comparison) pairing
    pub require_mitm: bool,
    /// Remove any existing bond before pairing
    pub clear_stale_bond: bool,
    /// Pause after removing a stale bond so the OS finishes tearing it down
    pub bond_settle_ms: u64,
    pub connect_timeout_ms: u64,
    /// Upper bound for any single discovery, read or write
    pub gatt_timeout_ms: u64,
    /// Attempts per characteristic write
    pub write_retries: u32,
    /// Pause between consecutive credential writes
    pub settle_delay_ms: u64,
    /// Pause before retrying a write that failed transiently
    pub retry_backoff_ms: u64,
    pub status_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            pin_timeout_ms: 60_000,
            require_mitm: true,
            clear_stale_bond: false,
            bond_settle_ms: 5_000,
            connect_timeout_ms: 15_000,
            gatt_timeout_ms: 10_000,
            write_retries: 3,
            settle_delay_ms: 400,
            retry_backoff_ms: 500,
            status_timeout_ms: 30_000,
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ProvisioningConfig {
    /// Load config from file, or write the defaults there if it is missing
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            return serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            });
        }

        let config = Self::default();
        config.save(path)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        // serializing a struct of plain integers and bools cannot fail
        let data = serde_json::to_string_pretty(self).unwrap_or_default();
        std::fs::write(path, data).map_err(write_err)
    }

    pub fn pin_timeout(&self) -> Duration {
        Duration::from_millis(self.pin_timeout_ms)
    }

    pub fn bond_settle(&self) -> Duration {
        Duration::from_millis(self.bond_settle_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn gatt_timeout(&self) -> Duration {
        Duration::from_millis(self.gatt_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
