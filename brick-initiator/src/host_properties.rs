//! Properties describing this host to a storage backend.
//!
//! The backend uses them to export a volume to this initiator: the iSCSI
//! initiator name, the FC port and node names, and whether multipath can be
//! used.

use brick_host::Exec;
use serde::Serialize;
use tracing::error;

use crate::error::{ConnectorError, Result};
use crate::factory::HostContext;
use crate::iscsi::read_initiator_name;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostConnectorProperties {
    pub ip: String,
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wwpns: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub wwnns: Vec<String>,
    pub multipath: bool,
    pub platform: String,
    pub os_type: String,
}

/// Whether multipathd answers; with `enforce` a failure is an error.
fn check_multipathd_running(ctx: &HostContext, enforce: bool) -> Result<bool> {
    let exec = Exec::new("multipathd").args(["show", "status"]).root();
    match ctx.runner.run(&exec) {
        Ok(_) => Ok(true),
        Err(e) => {
            error!(exit_code = ?e.exit_code(), error = %e, "multipathd is not running");
            if enforce {
                return Err(ConnectorError::MultipathdNotRunning(e));
            }
            Ok(false)
        }
    }
}

/// Collect the connector properties of this host.
///
/// `multipath` is only reported when requested and multipathd is running.
/// `host` defaults to the system hostname.
pub fn get_connector_properties(
    ctx: &HostContext,
    my_ip: &str,
    multipath: bool,
    enforce_multipath: bool,
    host: Option<&str>,
) -> Result<HostConnectorProperties> {
    let host = match host {
        Some(host) => host.to_string(),
        None => hostname::get()
            .map_err(brick_host::HostError::Io)?
            .to_string_lossy()
            .into_owned(),
    };

    let multipath = multipath && check_multipathd_running(ctx, enforce_multipath)?;

    Ok(HostConnectorProperties {
        ip: my_ip.to_string(),
        host,
        initiator: read_initiator_name(ctx.runner.as_ref()),
        wwpns: ctx.fc.get_fc_wwpns()?,
        wwnns: ctx.fc.get_fc_wwnns()?,
        multipath,
        platform: std::env::consts::ARCH.to_string(),
        os_type: std::env::consts::OS.to_string(),
    })
}
