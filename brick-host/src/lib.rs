//! Host-side collaborators for block volume attachment.
//!
//! This library wraps the Linux tools and kernel interfaces the connectors
//! drive:
//! - `executor`: external command execution with root-helper elevation
//! - `devices`: the `/dev` device tree (existence, symlinks, globbing)
//! - `multipath`: parsers for multipath tool output
//! - `scsi`: SCSI device resolution, removal and multipath lookups
//! - `fc`: Fibre Channel HBA enumeration, rescans and zfcp units
//! - `host_driver`: in-use block device enumeration

pub mod devices;
pub mod error;
pub mod executor;
pub mod fc;
pub mod host_driver;
pub mod multipath;
pub mod scsi;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use devices::{DeviceTree, LinuxDeviceTree};
pub use error::{HostError, Result};
pub use executor::{CommandRunner, Exec, ExecOutput, ProcessRunner};
pub use fc::{Hba, HbaEnumerator, LinuxFibreChannel, ZfcpUnits};
pub use host_driver::{ByPathHostDriver, HostDriver};
pub use multipath::{MultipathDevice, MultipathMap};
pub use scsi::{LinuxScsi, ScsiDeviceInfo, ScsiUtil};
