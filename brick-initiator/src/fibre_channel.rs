//! Fibre Channel volume attachment.
//!
//! Every local HBA is crossed with every target WWN to build the space of
//! possible device paths; most of them never exist. The connector rescans
//! the HBAs until one appears.
//!
//! Device naming (and, on s390/s390x, explicit LUN provisioning) is a
//! [`FcPathLayout`] strategy:
//!
//! ```text
//! PciLayout   /dev/disk/by-path/pci-0000:05:00.3-fc-0x5000abc1-lun-1
//! ZfcpLayout  /dev/disk/by-path/ccw-0.0.1234-zfcp-0x5000abc1:0x0001000000000000
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use brick_host::devices::BY_PATH_DIR;
use brick_host::{Hba, HostError, ScsiDeviceInfo, ScsiUtil, ZfcpUnits};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConnectorConfig;
use crate::connector::{self, CONNECT_VOLUME_LOCK, Connector, DeviceInfo, locked_operation};
use crate::error::{ConnectorError, Result};
use crate::factory::HostContext;
use crate::metrics;
use crate::properties::ConnectionProperties;
use crate::protocol::Protocol;
use crate::retry::{Backoff, poll_with_rescan};

/// `(adapter bus address, 0x-prefixed lowercase target WWN)`
pub type PossibleDevice = (String, String);

/// Cross every HBA with every target WWN.
///
/// HBAs without a recognizable bus address are skipped.
pub fn get_possible_devices(hbas: &[Hba], wwns: &[String]) -> Vec<PossibleDevice> {
    hbas.iter()
        .filter_map(Hba::pci_address)
        .flat_map(|pci| {
            wwns.iter()
                .map(move |wwn| (pci.to_string(), format!("0x{}", wwn.to_lowercase())))
        })
        .collect()
}

/// Device naming and provisioning for one family of FC adapters.
pub trait FcPathLayout: Send + Sync {
    fn device_paths(&self, possible: &[PossibleDevice], lun: u64) -> Result<Vec<PathBuf>>;

    /// Prepare the paths before polling for them.
    fn provision(&self, _possible: &[PossibleDevice], _lun: u64) -> Result<()> {
        Ok(())
    }

    /// Remove the kernel devices backing a volume.
    fn remove_devices(
        &self,
        devices: &[ScsiDeviceInfo],
        possible: &[PossibleDevice],
        lun: u64,
    ) -> Result<()>;
}

/// PCI-attached HBAs (and FCoE).
pub struct PciLayout {
    scsi: Arc<dyn ScsiUtil>,
}

impl PciLayout {
    pub fn new(scsi: Arc<dyn ScsiUtil>) -> Self {
        Self { scsi }
    }
}

impl FcPathLayout for PciLayout {
    fn device_paths(&self, possible: &[PossibleDevice], lun: u64) -> Result<Vec<PathBuf>> {
        Ok(possible
            .iter()
            .map(|(pci, wwn)| {
                PathBuf::from(format!("{}/pci-{}-fc-{}-lun-{}", BY_PATH_DIR, pci, wwn, lun))
            })
            .collect())
    }

    fn remove_devices(
        &self,
        devices: &[ScsiDeviceInfo],
        _possible: &[PossibleDevice],
        _lun: u64,
    ) -> Result<()> {
        // The kernel may have created more than one device for the volume.
        for device in devices {
            self.scsi.remove_scsi_device(&device.device)?;
        }
        Ok(())
    }
}

/// Encode a LUN the way zfcp expects it in sysfs and by-path names.
pub fn zfcp_lun_string(lun: u64) -> Result<String> {
    if lun <= 0xffff {
        Ok(format!("0x{:04x}000000000000", lun))
    } else if lun <= 0xffff_ffff {
        Ok(format!("0x{:08x}00000000", lun))
    } else {
        Err(ConnectorError::InvalidProperties(format!(
            "target_lun {} is out of range for zfcp",
            lun
        )))
    }
}

/// zfcp adapters on s390/s390x, where every LUN has to be added to the
/// adapter port before its device shows up.
pub struct ZfcpLayout {
    units: Arc<dyn ZfcpUnits>,
}

impl ZfcpLayout {
    pub fn new(units: Arc<dyn ZfcpUnits>) -> Self {
        Self { units }
    }
}

impl FcPathLayout for ZfcpLayout {
    fn device_paths(&self, possible: &[PossibleDevice], lun: u64) -> Result<Vec<PathBuf>> {
        let lun = zfcp_lun_string(lun)?;
        Ok(possible
            .iter()
            .map(|(device_number, wwn)| {
                PathBuf::from(format!(
                    "{}/ccw-{}-zfcp-{}:{}",
                    BY_PATH_DIR, device_number, wwn, lun
                ))
            })
            .collect())
    }

    fn provision(&self, possible: &[PossibleDevice], lun: u64) -> Result<()> {
        let lun = zfcp_lun_string(lun)?;
        for (device_number, wwn) in possible {
            self.units.configure_scsi_device(device_number, wwn, &lun);
        }
        Ok(())
    }

    fn remove_devices(
        &self,
        _devices: &[ScsiDeviceInfo],
        possible: &[PossibleDevice],
        lun: u64,
    ) -> Result<()> {
        let lun = zfcp_lun_string(lun)?;
        for (device_number, wwn) in possible {
            self.units.deconfigure_scsi_device(device_number, wwn, &lun);
        }
        Ok(())
    }
}

pub struct FibreChannelConnector {
    ctx: HostContext,
    layout: Box<dyn FcPathLayout>,
    use_multipath: bool,
    device_scan_attempts: u32,
    scan_interval: Duration,
}

impl FibreChannelConnector {
    pub fn new(ctx: HostContext, config: &ConnectorConfig, layout: Box<dyn FcPathLayout>) -> Self {
        Self {
            ctx,
            layout,
            use_multipath: config.use_multipath,
            device_scan_attempts: config.device_scan_attempts.max(1),
            scan_interval: config.fc_scan_interval(),
        }
    }

    fn possible_volume_paths(
        &self,
        props: &ConnectionProperties,
        hbas: &[Hba],
    ) -> Result<(Vec<PossibleDevice>, Vec<PathBuf>)> {
        let possible = get_possible_devices(hbas, &props.target_wwns()?);
        let lun = props.target_lun()?;
        let paths = self.layout.device_paths(&possible, lun)?;
        Ok((possible, paths))
    }

    /// Paths of the volume that currently exist on this host.
    pub fn get_volume_paths(&self, props: &ConnectionProperties) -> Result<Vec<PathBuf>> {
        let hbas = self.ctx.fc.get_fc_hbas_info()?;
        let (_, paths) = self.possible_volume_paths(props, &hbas)?;
        Ok(paths
            .into_iter()
            .filter(|path| self.ctx.devices.exists(path))
            .collect())
    }

    fn wait_for_device(&self, hbas: &[Hba], host_devices: &[PathBuf]) -> Result<(PathBuf, PathBuf)> {
        let found = poll_with_rescan(
            self.device_scan_attempts,
            Backoff::Fixed(self.scan_interval),
            || {
                host_devices.iter().find_map(|device| {
                    debug!(device = %device.display(), "Looking for Fibre Channel device");
                    self.ctx
                        .devices
                        .exists(device)
                        .then(|| (device.clone(), self.ctx.devices.realpath(device)))
                })
            },
            |attempt| -> Result<()> {
                warn!(attempt, "Fibre Channel volume device not yet found, will rescan and retry");
                metrics::record_rescan(Protocol::FibreChannel);
                self.ctx.fc.rescan_hosts(hbas)?;
                Ok(())
            },
        )?;

        found.ok_or_else(|| {
            error!(candidates = ?host_devices, "Fibre Channel volume device not found");
            ConnectorError::NoFibreChannelVolumeDeviceFound
        })
    }

    #[instrument(skip(self, props))]
    fn do_connect(&self, props: &ConnectionProperties) -> Result<DeviceInfo> {
        let hbas = self.ctx.fc.get_fc_hbas_info()?;
        let (possible, host_devices) = self.possible_volume_paths(props, &hbas)?;
        if host_devices.is_empty() {
            warn!("Unable to locate any Fibre Channel devices");
            return Err(ConnectorError::NoFibreChannelHostsFound);
        }
        self.layout.provision(&possible, props.target_lun()?)?;

        let (host_device, device_name) = self.wait_for_device(&hbas, &host_devices)?;
        info!(
            device = %host_device.display(),
            name = %device_name.display(),
            "Found Fibre Channel volume"
        );

        let device_wwn = self.ctx.scsi.get_scsi_wwn(&host_device)?;
        debug!(wwn = %device_wwn, "Device WWN");

        if !self.use_multipath {
            return Ok(DeviceInfo::block(host_device));
        }

        let (device_path, multipath_id) =
            if let Some(path) = self.ctx.scsi.find_multipath_device_path(&device_wwn) {
                debug!(device = %path.display(), "Multipath device path discovered");
                (path, Some(device_wwn.clone()))
            } else if let Some(mpath) = self.ctx.scsi.find_multipath_device(&device_name)? {
                (mpath.device, Some(device_wwn.clone()))
            } else {
                debug!(
                    device = %host_device.display(),
                    "Unable to find multipath device name for volume, using single path"
                );
                (host_device, None)
            };

        if !props.is_read_only() {
            // Multipath devices can show up read-only and need time or a
            // rescan to turn read-write.
            match self.ctx.scsi.wait_for_rw(&device_wwn, &device_path) {
                Ok(()) => {}
                Err(HostError::BlockDeviceReadOnly(_)) => {
                    warn!(device = %device_path.display(), "Block device is still read-only, continuing anyway");
                }
                Err(e) => return Err(e.into()),
            }
        }

        let info = DeviceInfo::block(device_path);
        Ok(match multipath_id {
            Some(id) => info.with_multipath_id(id),
            None => info,
        })
    }

    #[instrument(skip(self, props))]
    fn do_disconnect(&self, props: &ConnectionProperties) -> Result<()> {
        let hbas = self.ctx.fc.get_fc_hbas_info()?;
        let (possible, paths) = self.possible_volume_paths(props, &hbas)?;

        let mut devices = Vec::new();
        let mut wwn: Option<String> = None;
        for path in paths.iter().filter(|path| self.ctx.devices.exists(path)) {
            if wwn.is_none() {
                wwn = Some(self.ctx.scsi.get_scsi_wwn(path)?);
            }
            if let Some(real_path) = self.ctx.scsi.get_name_from_path(path) {
                devices.push(self.ctx.scsi.get_device_info(&real_path)?);
            }
        }

        debug!(devices = ?devices, "Fibre Channel devices to remove");
        self.layout
            .remove_devices(&devices, &possible, props.target_lun()?)?;

        if self.use_multipath
            && let Some(wwn) = wwn
            && let Err(e) = self.ctx.scsi.flush_multipath_device(&wwn)
        {
            // multipath -f does not always drop maps with friendly names.
            warn!(wwn = %wwn, error = %e, "Failed to flush multipath device");
        }
        Ok(())
    }
}

impl Connector for FibreChannelConnector {
    fn protocol(&self) -> Protocol {
        Protocol::FibreChannel
    }

    fn lock_name(&self) -> &str {
        CONNECT_VOLUME_LOCK
    }

    fn connect_volume(&self, properties: &ConnectionProperties) -> Result<DeviceInfo> {
        locked_operation(
            &self.ctx.locks,
            self.lock_name(),
            Protocol::FibreChannel,
            "connect_volume",
            || self.do_connect(properties),
        )
    }

    fn disconnect_volume(
        &self,
        properties: &ConnectionProperties,
        _device_info: Option<&DeviceInfo>,
    ) -> Result<()> {
        locked_operation(
            &self.ctx.locks,
            self.lock_name(),
            Protocol::FibreChannel,
            "disconnect_volume",
            || self.do_disconnect(properties),
        )
    }

    fn check_valid_device(&self, path: &Path) -> bool {
        connector::check_valid_device(self.ctx.runner.as_ref(), path)
    }
}
