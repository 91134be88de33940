//! Host-side block volume attachment.
//!
//! A storage backend describes how to reach a volume with a set of
//! connection properties; a [`Connector`] turns them into a local block
//! device and tears it down again:
//!
//! ```no_run
//! use brick_initiator::{ConnectionProperties, ConnectorConfig, ConnectorFactory, HostContext};
//!
//! # fn main() -> brick_initiator::Result<()> {
//! let config = ConnectorConfig::default();
//! let factory = ConnectorFactory::new(HostContext::linux(&config), config);
//! let connector = factory.create("iscsi", None)?;
//!
//! let props = ConnectionProperties::from_value(serde_json::json!({
//!     "target_portal": "10.0.0.5:3260",
//!     "target_iqn": "iqn.2010-x:vol1",
//!     "target_lun": 0,
//! }))?;
//! let device = connector.connect_volume(&props)?;
//! connector.disconnect_volume(&props, Some(&device))?;
//! # Ok(())
//! # }
//! ```
//!
//! Modules:
//! - `connector`: the connector contract and device handle
//! - `factory`: host context and connector selection
//! - `iscsi`: iSCSI and iSER
//! - `fibre_channel`: Fibre Channel, with zfcp naming on s390/s390x
//! - `host_properties`: initiator identity reported to backends

pub mod config;
pub mod connector;
pub mod error;
pub mod factory;
pub mod fibre_channel;
pub mod host_properties;
pub mod iscsi;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod properties;
pub mod protocol;
pub mod retry;

pub use config::ConnectorConfig;
pub use connector::{Connector, DeviceInfo};
pub use error::{ConnectorError, Result};
pub use factory::{ConnectorFactory, HostContext};
pub use fibre_channel::{FcPathLayout, FibreChannelConnector, PciLayout, ZfcpLayout};
pub use host_properties::{HostConnectorProperties, get_connector_properties};
pub use iscsi::IscsiConnector;
pub use lock::LockRegistry;
pub use properties::{ConnectionProperties, IscsiTarget};
pub use protocol::Protocol;
