//! Enumeration of the block devices currently exposed on this host.
//!
//! Connectors use it purely for reference counting during disconnect: a
//! session is only torn down when no other by-path device still uses it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::devices::{BY_PATH_DIR, DeviceTree};

pub trait HostDriver: Send + Sync {
    fn get_all_block_devices(&self) -> Vec<PathBuf>;
}

/// Lists the entries of `/dev/disk/by-path`.
pub struct ByPathHostDriver {
    devices: Arc<dyn DeviceTree>,
}

impl ByPathHostDriver {
    pub fn new(devices: Arc<dyn DeviceTree>) -> Self {
        Self { devices }
    }
}

impl HostDriver for ByPathHostDriver {
    fn get_all_block_devices(&self) -> Vec<PathBuf> {
        let dir = Path::new(BY_PATH_DIR);
        self.devices
            .list_dir(dir)
            .into_iter()
            .map(|name| dir.join(name))
            .collect()
    }
}
