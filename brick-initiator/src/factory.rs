//! Connector construction.
//!
//! A [`HostContext`] bundles the host collaborators and the lock registry;
//! it is built once per process and shared by every connector the
//! [`ConnectorFactory`] hands out.

use std::sync::Arc;
use std::time::Duration;

use brick_host::{
    ByPathHostDriver, CommandRunner, DeviceTree, HbaEnumerator, HostDriver, LinuxDeviceTree,
    LinuxFibreChannel, LinuxScsi, ProcessRunner, ScsiUtil, ZfcpUnits,
};
use tracing::debug;

use crate::config::ConnectorConfig;
use crate::connector::Connector;
use crate::error::{ConnectorError, Result};
use crate::fibre_channel::{FibreChannelConnector, PciLayout, ZfcpLayout};
use crate::host_properties::{HostConnectorProperties, get_connector_properties};
use crate::iscsi::IscsiConnector;
use crate::lock::LockRegistry;
use crate::protocol::Protocol;

pub const S390: &str = "s390";
pub const S390X: &str = "s390x";

/// Host collaborators shared by all connectors of a process.
#[derive(Clone)]
pub struct HostContext {
    pub runner: Arc<dyn CommandRunner>,
    pub devices: Arc<dyn DeviceTree>,
    pub scsi: Arc<dyn ScsiUtil>,
    pub fc: Arc<dyn HbaEnumerator>,
    pub zfcp: Arc<dyn ZfcpUnits>,
    pub driver: Arc<dyn HostDriver>,
    pub locks: Arc<LockRegistry>,
}

impl HostContext {
    /// Build the Linux SCSI, FC and driver helpers on top of a runner and
    /// device tree.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        devices: Arc<dyn DeviceTree>,
        scsi_retry_interval: Duration,
    ) -> Self {
        let fc = Arc::new(LinuxFibreChannel::new(runner.clone()));
        Self {
            scsi: Arc::new(
                LinuxScsi::new(runner.clone(), devices.clone())
                    .with_retry_interval(scsi_retry_interval),
            ),
            fc: fc.clone(),
            zfcp: fc,
            driver: Arc::new(ByPathHostDriver::new(devices.clone())),
            locks: Arc::new(LockRegistry::new()),
            runner,
            devices,
        }
    }

    /// Context for the live host, elevating through `config.root_helper`.
    pub fn linux(config: &ConnectorConfig) -> Self {
        Self::new(
            Arc::new(ProcessRunner::new(config.root_helper.clone())),
            Arc::new(LinuxDeviceTree),
            config.scsi_retry_interval(),
        )
    }
}

/// CPU architecture of this host, as the FC connector selection sees it.
pub fn host_arch() -> &'static str {
    std::env::consts::ARCH
}

pub struct ConnectorFactory {
    ctx: HostContext,
    config: ConnectorConfig,
}

impl ConnectorFactory {
    pub fn new(ctx: HostContext, config: ConnectorConfig) -> Self {
        Self { ctx, config }
    }

    pub fn context(&self) -> &HostContext {
        &self.ctx
    }

    /// Connector properties of this host, with multipath as configured.
    pub fn connector_properties(
        &self,
        my_ip: &str,
        host: Option<&str>,
    ) -> Result<HostConnectorProperties> {
        get_connector_properties(
            &self.ctx,
            my_ip,
            self.config.use_multipath,
            self.config.enforce_multipath,
            host,
        )
    }

    /// Build a connector from a protocol tag (case-insensitive).
    ///
    /// `arch` defaults to the host architecture; it only matters for Fibre
    /// Channel, where `s390`/`s390x` select zfcp device naming.
    pub fn create(&self, protocol: &str, arch: Option<&str>) -> Result<Box<dyn Connector>> {
        self.create_for(protocol.parse()?, arch)
    }

    pub fn create_for(&self, protocol: Protocol, arch: Option<&str>) -> Result<Box<dyn Connector>> {
        let arch = arch.unwrap_or_else(|| host_arch());
        debug!(protocol = %protocol, arch = %arch, "Creating connector");

        match protocol {
            Protocol::Iscsi | Protocol::Iser => Ok(Box::new(IscsiConnector::new(
                self.ctx.clone(),
                &self.config,
                protocol,
            ))),
            Protocol::FibreChannel => {
                let connector = if arch == S390 || arch == S390X {
                    FibreChannelConnector::new(
                        self.ctx.clone(),
                        &self.config,
                        Box::new(ZfcpLayout::new(self.ctx.zfcp.clone())),
                    )
                } else {
                    FibreChannelConnector::new(
                        self.ctx.clone(),
                        &self.config,
                        Box::new(PciLayout::new(self.ctx.scsi.clone())),
                    )
                };
                Ok(Box::new(connector))
            }
            other => Err(ConnectorError::UnsupportedProtocol(other.to_string())),
        }
    }
}
