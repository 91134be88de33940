//! Fibre Channel host bus adapters.
//!
//! HBAs are enumerated from `systool -c fc_host -v`. Each adapter port is
//! identified by its WWPN/WWNN and by the sysfs device path it hangs off,
//! from which the PCI (or, on s390x, CCW) address is taken.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{HostError, Result};
use crate::executor::{CommandRunner, Exec};

/// One local Fibre Channel adapter port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Hba {
    /// SCSI host name, e.g. `host2`.
    pub host_device: String,
    /// WWPN without the `0x` prefix.
    pub port_name: String,
    /// WWNN without the `0x` prefix.
    pub node_name: String,
    pub port_state: String,
    /// sysfs path of the fc_host class device.
    pub device_path: String,
}

impl Hba {
    /// Bus address of the adapter.
    ///
    /// The sysfs path looks like
    /// `/sys/devices/pci0000:00/0000:00:03.0/0000:05:00.3/host2/fc_host/host2`
    /// (FC) or `.../0000:21:00.2/net/ens2f2/ctlr_2/host3/fc_host/host3`
    /// (FCoE); the address is the component right before the first `host*`
    /// or `net*` component.
    pub fn pci_address(&self) -> Option<&str> {
        let components: Vec<&str> = self.device_path.split('/').collect();
        let index = components
            .iter()
            .position(|c| c.starts_with("net") || c.starts_with("host"))?;
        if index == 0 {
            return None;
        }
        components
            .get(index - 1)
            .copied()
            .filter(|address| !address.is_empty())
    }

    pub fn is_online(&self) -> bool {
        self.port_state == "Online"
    }
}

pub trait HbaEnumerator: Send + Sync {
    /// Local adapter ports; empty when the host has no FC support.
    fn get_fc_hbas_info(&self) -> Result<Vec<Hba>>;

    /// Ask the SCSI layer to rescan every given adapter.
    fn rescan_hosts(&self, hbas: &[Hba]) -> Result<()>;

    /// WWPNs of the online adapter ports.
    fn get_fc_wwpns(&self) -> Result<Vec<String>> {
        Ok(self
            .get_fc_hbas_info()?
            .into_iter()
            .filter(Hba::is_online)
            .map(|hba| hba.port_name)
            .collect())
    }

    /// WWNNs of the online adapter ports.
    fn get_fc_wwnns(&self) -> Result<Vec<String>> {
        Ok(self
            .get_fc_hbas_info()?
            .into_iter()
            .filter(Hba::is_online)
            .map(|hba| hba.node_name)
            .collect())
    }
}

/// Explicit LUN provisioning on zfcp (s390/s390x) adapters.
pub trait ZfcpUnits: Send + Sync {
    fn configure_scsi_device(&self, device_number: &str, target_wwn: &str, lun: &str);

    fn deconfigure_scsi_device(&self, device_number: &str, target_wwn: &str, lun: &str);
}

/// Parse `systool -c fc_host -v` output into adapter descriptors.
pub fn parse_systool(output: &str) -> Vec<Hba> {
    let mut hbas: Vec<Hba> = Vec::new();
    let mut current: Option<Hba> = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key: String = key.split_whitespace().collect();
        let value = value.trim().trim_matches('"');

        if key == "ClassDevice" {
            if let Some(hba) = current.take() {
                hbas.push(hba);
            }
            current = Some(Hba {
                host_device: value.to_string(),
                ..Default::default()
            });
            continue;
        }

        let Some(hba) = current.as_mut() else {
            continue;
        };
        match key.as_str() {
            "ClassDevicepath" => hba.device_path = value.to_string(),
            "port_name" => hba.port_name = value.trim_start_matches("0x").to_string(),
            "node_name" => hba.node_name = value.trim_start_matches("0x").to_string(),
            "port_state" => hba.port_state = value.to_string(),
            _ => {}
        }
    }
    if let Some(hba) = current {
        hbas.push(hba);
    }

    hbas.retain(|hba| !hba.port_name.is_empty());
    hbas
}

/// systool exit code when it is not installed or the class is unknown.
const SYSTOOL_NOT_FOUND: i32 = 96;

pub struct LinuxFibreChannel {
    runner: Arc<dyn CommandRunner>,
}

impl LinuxFibreChannel {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn echo_scsi_command(&self, path: &str, content: &str) -> Result<()> {
        self.runner
            .run(&Exec::new("tee").args(["-a", path]).root().input(content))?;
        Ok(())
    }
}

impl HbaEnumerator for LinuxFibreChannel {
    fn get_fc_hbas_info(&self) -> Result<Vec<Hba>> {
        let exec = Exec::new("systool").args(["-c", "fc_host", "-v"]).root();
        match self.runner.run(&exec) {
            Ok(out) => {
                let hbas = parse_systool(&out.stdout);
                debug!(count = hbas.len(), "Enumerated Fibre Channel HBAs");
                Ok(hbas)
            }
            Err(e) if e.has_exit_code(&[SYSTOOL_NOT_FOUND]) => {
                warn!(error = %e, "systool reported no fc_host class");
                Ok(Vec::new())
            }
            Err(e @ HostError::CommandSpawn { .. }) => {
                warn!(error = %e, "systool is not installed");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    fn rescan_hosts(&self, hbas: &[Hba]) -> Result<()> {
        for hba in hbas {
            let scan = format!("/sys/class/scsi_host/{}/scan", hba.host_device);
            info!(host = %hba.host_device, "Rescanning Fibre Channel host");
            self.echo_scsi_command(&scan, "- - -")?;
        }
        Ok(())
    }
}

impl ZfcpUnits for LinuxFibreChannel {
    fn configure_scsi_device(&self, device_number: &str, target_wwn: &str, lun: &str) {
        let unit_add = format!(
            "/sys/bus/ccw/drivers/zfcp/{}/{}/unit_add",
            device_number, target_wwn
        );
        if let Err(e) = self.echo_scsi_command(&unit_add, lun) {
            warn!(
                device_number = %device_number,
                target_wwn = %target_wwn,
                lun = %lun,
                exit_code = ?e.exit_code(),
                error = %e,
                "unit_add call failed"
            );
        }
    }

    fn deconfigure_scsi_device(&self, device_number: &str, target_wwn: &str, lun: &str) {
        let unit_remove = format!(
            "/sys/bus/ccw/drivers/zfcp/{}/{}/unit_remove",
            device_number, target_wwn
        );
        if let Err(e) = self.echo_scsi_command(&unit_remove, lun) {
            warn!(
                device_number = %device_number,
                target_wwn = %target_wwn,
                lun = %lun,
                exit_code = ?e.exit_code(),
                error = %e,
                "unit_remove call failed"
            );
        }
    }
}
