//! SCSI device helpers.
//!
//! Resolves by-path symlinks to kernel devices, queries WWNs, removes device
//! nodes through sysfs and looks up the multipath maps that own a device.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::devices::{DeviceTree, MAPPER_DIR, kernel_name};
use crate::error::{HostError, Result};
use crate::executor::{CommandRunner, Exec};
use crate::multipath::{self, MultipathDevice};

/// SCSI address of a block device as reported by `sg_scan`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScsiDeviceInfo {
    pub device: PathBuf,
    pub host: Option<u32>,
    pub channel: Option<u32>,
    pub id: Option<u32>,
    pub lun: Option<u32>,
}

pub trait ScsiUtil: Send + Sync {
    /// Kernel device (`/dev/sdX`) behind a by-path symlink.
    fn get_name_from_path(&self, path: &Path) -> Option<PathBuf>;

    /// SCSI WWN (page 0x83 identifier) of a device.
    fn get_scsi_wwn(&self, path: &Path) -> Result<String>;

    fn get_device_info(&self, device: &Path) -> Result<ScsiDeviceInfo>;

    /// Remove a SCSI device node from the kernel.
    fn remove_scsi_device(&self, device: &Path) -> Result<()>;

    /// Wait (bounded) for a device path to disappear.
    fn wait_for_volume_removal(&self, path: &Path) -> Result<()>;

    /// Existing multipath device path keyed by WWN.
    fn find_multipath_device_path(&self, wwn: &str) -> Option<PathBuf>;

    /// Multipath map owning a kernel device.
    fn find_multipath_device(&self, device: &Path) -> Result<Option<MultipathDevice>>;

    /// Remove every member of the map owning `device`, then flush the map.
    fn remove_multipath_device(&self, device: &Path) -> Result<()>;

    fn flush_multipath_device(&self, wwn: &str) -> Result<()>;

    /// Wait (bounded) for the device to become writable.
    fn wait_for_rw(&self, wwn: &str, device_path: &Path) -> Result<()>;
}

/// Linux implementation backed by sysfs, udev and the multipath tools.
pub struct LinuxScsi {
    runner: Arc<dyn CommandRunner>,
    devices: Arc<dyn DeviceTree>,
    retry_interval: Duration,
    attempts: u32,
}

impl LinuxScsi {
    pub fn new(runner: Arc<dyn CommandRunner>, devices: Arc<dyn DeviceTree>) -> Self {
        Self {
            runner,
            devices,
            retry_interval: Duration::from_secs(2),
            attempts: 3,
        }
    }

    /// Interval between polls while waiting on device state.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    fn echo_scsi_command(&self, path: &str, content: &str) -> Result<()> {
        self.runner
            .run(&Exec::new("tee").args(["-a", path]).root().input(content))?;
        Ok(())
    }

    fn flush_device_io(&self, device: &Path) {
        let exec = Exec::new("blockdev")
            .args(["--flushbufs", &device.to_string_lossy()])
            .root()
            .attempts(3);
        if let Err(e) = self.runner.run(&exec) {
            warn!(device = %device.display(), error = %e, "Failed to flush device buffers");
        }
    }

    fn wait_for_path(&self, path: &Path) -> bool {
        for attempt in 0..self.attempts {
            if self.devices.exists(path) {
                return true;
            }
            debug!(path = %path.display(), attempt, "Waiting for multipath device");
            thread::sleep(self.retry_interval);
        }
        self.devices.exists(path)
    }
}

fn parse_sg_scan(device: &Path, output: &str) -> ScsiDeviceInfo {
    // "/dev/sdb: scsi2 channel=0 id=0 lun=1 [em]"
    let mut info = ScsiDeviceInfo {
        device: device.to_path_buf(),
        host: None,
        channel: None,
        id: None,
        lun: None,
    };
    for token in output.split_whitespace() {
        if let Some(host) = token.strip_prefix("scsi") {
            info.host = host.parse().ok();
        } else if let Some((key, value)) = token.split_once('=') {
            let value = value.parse().ok();
            match key {
                "channel" => info.channel = value,
                "id" => info.id = value,
                "lun" => info.lun = value,
                _ => {}
            }
        }
    }
    info
}

/// True when any `lsblk -o NAME,RO` row naming `wwn` is read-only.
fn has_read_only_row(output: &str, wwn: &str) -> bool {
    output.lines().any(|row| {
        let name = row.split_whitespace().next().unwrap_or("");
        let ro = row.split_whitespace().last().unwrap_or("0");
        name.contains(wwn) && ro == "1"
    })
}

impl ScsiUtil for LinuxScsi {
    fn get_name_from_path(&self, path: &Path) -> Option<PathBuf> {
        if !self.devices.exists(path) {
            return None;
        }
        let name = self.devices.realpath(path);
        name.starts_with("/dev/").then_some(name)
    }

    fn get_scsi_wwn(&self, path: &Path) -> Result<String> {
        let out = self.runner.run(
            &Exec::new("/lib/udev/scsi_id")
                .args(["--page", "0x83", "--whitelisted", &path.to_string_lossy()])
                .root(),
        )?;
        Ok(out.stdout.trim().to_string())
    }

    fn get_device_info(&self, device: &Path) -> Result<ScsiDeviceInfo> {
        let out = self
            .runner
            .run(&Exec::new("sg_scan").arg(device.to_string_lossy()).root())?;
        Ok(parse_sg_scan(device, &out.stdout))
    }

    #[instrument(skip(self))]
    fn remove_scsi_device(&self, device: &Path) -> Result<()> {
        let Some(name) = kernel_name(device) else {
            return Ok(());
        };
        let delete = format!("/sys/block/{}/device/delete", name);
        if self.devices.exists(Path::new(&delete)) {
            self.flush_device_io(device);
            info!(device = %device.display(), "Removing SCSI device");
            self.echo_scsi_command(&delete, "1")?;
        }
        Ok(())
    }

    fn wait_for_volume_removal(&self, path: &Path) -> Result<()> {
        for attempt in 0..self.attempts {
            if !self.devices.exists(path) {
                return Ok(());
            }
            debug!(path = %path.display(), attempt, "Device path still present");
            thread::sleep(self.retry_interval);
        }
        if self.devices.exists(path) {
            return Err(HostError::VolumePathNotRemoved(path.to_path_buf()));
        }
        Ok(())
    }

    fn find_multipath_device_path(&self, wwn: &str) -> Option<PathBuf> {
        let by_id = PathBuf::from(format!("/dev/disk/by-id/dm-uuid-mpath-{}", wwn));
        if self.wait_for_path(&by_id) {
            return Some(by_id);
        }
        let mapper = Path::new(MAPPER_DIR).join(wwn);
        if self.wait_for_path(&mapper) {
            return Some(mapper);
        }
        None
    }

    fn find_multipath_device(&self, device: &Path) -> Result<Option<MultipathDevice>> {
        let exec = Exec::new("multipath")
            .args(["-l", &device.to_string_lossy()])
            .root()
            .ok_codes(&[0, 1]);
        let out = match self.runner.run(&exec) {
            Ok(out) => out,
            Err(e @ HostError::ProcessExecution { .. }) => {
                warn!(device = %device.display(), error = %e, "multipath call failed");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(multipath::parse_device(&out.stdout))
    }

    #[instrument(skip(self))]
    fn remove_multipath_device(&self, device: &Path) -> Result<()> {
        let Some(mpath) = self.find_multipath_device(device)? else {
            debug!(device = %device.display(), "No multipath map owns device");
            return Ok(());
        };
        info!(multipath = %mpath.device.display(), "Removing multipath device");
        for member in &mpath.devices {
            self.remove_scsi_device(&member.device)?;
        }
        self.flush_multipath_device(&mpath.id)
    }

    fn flush_multipath_device(&self, wwn: &str) -> Result<()> {
        self.runner
            .run(&Exec::new("multipath").args(["-f", wwn]).root())?;
        Ok(())
    }

    fn wait_for_rw(&self, wwn: &str, device_path: &Path) -> Result<()> {
        // An empty WWN would match every lsblk row.
        if wwn.is_empty() {
            debug!(device = %device_path.display(), "No WWN for device, skipping read-only check");
            return Ok(());
        }
        for attempt in 0..self.attempts {
            let out = self
                .runner
                .run(&Exec::new("lsblk").args(["-o", "NAME,RO", "-l", "-n"]))?;
            if !has_read_only_row(&out.stdout, wwn) {
                debug!(device = %device_path.display(), "Block device is not read-only");
                return Ok(());
            }
            debug!(device = %device_path.display(), attempt, "Block device is read-only");
            self.runner.run(
                &Exec::new("multipath")
                    .arg("-r")
                    .root()
                    .ok_codes(&[0, 1, 21]),
            )?;
            thread::sleep(self.retry_interval);
        }
        Err(HostError::BlockDeviceReadOnly(device_path.to_path_buf()))
    }
}
