//! Connector configuration.
//!
//! Loaded from JSON by the embedding agent; every field has a default so an
//! empty object (or no file at all) yields a working single-path setup.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConnectorError, Result};

pub const DEVICE_SCAN_ATTEMPTS_DEFAULT: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Aggregate paths through dm-multipath.
    pub use_multipath: bool,
    /// Rescans performed before a device is declared missing.
    pub device_scan_attempts: u32,
    /// iSCSI iface name (`default`, `iser`, or an offload iface).
    pub transport: String,
    /// Command prefix used to elevate privileged tools.
    pub root_helper: Vec<String>,
    /// Time unit of the quadratic iSCSI rescan backoff.
    pub backoff_unit_ms: u64,
    /// Fixed interval between Fibre Channel rescans.
    pub fc_scan_interval_ms: u64,
    /// Interval between SCSI state polls (removal, read-write).
    pub scsi_retry_interval_ms: u64,
    /// Fail host property collection when multipathd is down.
    pub enforce_multipath: bool,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            use_multipath: false,
            device_scan_attempts: DEVICE_SCAN_ATTEMPTS_DEFAULT,
            transport: "default".to_string(),
            root_helper: vec!["sudo".to_string()],
            backoff_unit_ms: 1000,
            fc_scan_interval_ms: 2000,
            scsi_retry_interval_ms: 2000,
            enforce_multipath: false,
        }
    }
}

impl ConnectorConfig {
    /// Load a JSON config file. A missing file yields the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            ConnectorError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| ConnectorError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.device_scan_attempts == 0 {
            return Err(ConnectorError::Config(
                "device_scan_attempts must be at least 1".to_string(),
            ));
        }
        if self.transport.trim().is_empty() {
            return Err(ConnectorError::Config("transport must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn fc_scan_interval(&self) -> Duration {
        Duration::from_millis(self.fc_scan_interval_ms)
    }

    pub fn scsi_retry_interval(&self) -> Duration {
        Duration::from_millis(self.scsi_retry_interval_ms)
    }
}
