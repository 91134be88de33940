//! The connector contract shared by every attachment protocol.

use std::path::{Path, PathBuf};

use brick_host::{CommandRunner, Exec};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::Result;
use crate::lock::LockRegistry;
use crate::metrics::OperationTimer;
use crate::properties::ConnectionProperties;
use crate::protocol::Protocol;

/// Lock shared by connectors that mutate the SCSI device list and the
/// multipath table.
pub const CONNECT_VOLUME_LOCK: &str = "connect_volume";

pub const DEVICE_TYPE_BLOCK: &str = "block";

/// Local device produced by a successful connect.
///
/// Handed back unchanged to the matching disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "type")]
    pub device_type: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multipath_id: Option<String>,
}

impl DeviceInfo {
    pub fn block(path: impl Into<PathBuf>) -> Self {
        Self {
            device_type: DEVICE_TYPE_BLOCK.to_string(),
            path: path.into(),
            multipath_id: None,
        }
    }

    pub fn with_multipath_id(mut self, id: impl Into<String>) -> Self {
        self.multipath_id = Some(id.into());
        self
    }
}

pub trait Connector: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Name of the process-wide lock serializing connect and disconnect.
    fn lock_name(&self) -> &str;

    /// Attach the volume and return a local device path that exists.
    ///
    /// Safe to call again for an attached volume; the existing session and
    /// device are reused.
    fn connect_volume(&self, properties: &ConnectionProperties) -> Result<DeviceInfo>;

    /// Detach the volume. A device that is already gone is not an error.
    fn disconnect_volume(
        &self,
        properties: &ConnectionProperties,
        device_info: Option<&DeviceInfo>,
    ) -> Result<()>;

    /// Whether one block can be read from `path`.
    fn check_valid_device(&self, path: &Path) -> bool;
}

/// Read one block from `path` with `dd`; false on any failure.
pub fn check_valid_device(runner: &dyn CommandRunner, path: &Path) -> bool {
    let exec = Exec::new("dd")
        .args([
            format!("if={}", path.display()),
            "of=/dev/null".to_string(),
            "count=1".to_string(),
        ])
        .root();
    match runner.run(&exec) {
        Ok(_) => true,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to access the device");
            false
        }
    }
}

/// Run a mutating connector operation under its named lock, recording
/// metrics and logging the outcome.
pub(crate) fn locked_operation<T>(
    locks: &LockRegistry,
    lock_name: &str,
    protocol: Protocol,
    operation: &'static str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    locks.with_lock(lock_name, || {
        let timer = OperationTimer::new(protocol, operation);
        let result = f();
        timer.finish(&result);
        match &result {
            Ok(_) => info!(protocol = %protocol, operation, "Connector operation completed"),
            Err(e) => error!(protocol = %protocol, operation, error = %e, "Connector operation failed"),
        }
        result
    })
}
