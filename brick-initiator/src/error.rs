use std::path::PathBuf;

use brick_host::HostError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("invalid connector protocol specified: {0}")]
    InvalidProtocol(String),

    #[error("connector protocol {0} is not supported on this host")]
    UnsupportedProtocol(String),

    #[error("invalid connection properties: {0}")]
    InvalidProperties(String),

    #[error("unable to find iSCSI target portal {0}")]
    TargetPortalNotFound(String),

    #[error("volume device not found at {}", format_paths(.0))]
    VolumeDeviceNotFound(Vec<PathBuf>),

    #[error("unable to locate any Fibre Channel host bus adapters")]
    NoFibreChannelHostsFound,

    #[error("unable to find a Fibre Channel volume device")]
    NoFibreChannelVolumeDeviceFound,

    #[error("multipathd is not running: {0}")]
    MultipathdNotRunning(#[source] HostError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

fn format_paths(paths: &[PathBuf]) -> String {
    let paths: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    format!("[{}]", paths.join(", "))
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_device_not_found_lists_candidates() {
        let err = ConnectorError::VolumeDeviceNotFound(vec![
            PathBuf::from("/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.2010-x:vol1-lun-0"),
            PathBuf::from("/dev/disk/by-path/ip-10.0.0.6:3260-iscsi-iqn.2010-x:vol1-lun-0"),
        ]);
        assert_eq!(
            err.to_string(),
            "volume device not found at [/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.2010-x:vol1-lun-0, \
             /dev/disk/by-path/ip-10.0.0.6:3260-iscsi-iqn.2010-x:vol1-lun-0]"
        );
    }

    #[test]
    fn test_host_error_is_transparent() {
        let err: ConnectorError = HostError::VolumePathNotRemoved("/dev/sdb".into()).into();
        assert_eq!(err.to_string(), "volume path /dev/sdb was not removed in time");
    }
}
