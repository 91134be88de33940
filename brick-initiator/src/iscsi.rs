//! iSCSI (and iSER) volume attachment through open-iscsi.
//!
//! Connect logs in to one or more target portals with `iscsiadm`, then waits
//! for the kernel to publish the by-path device node:
//!
//! ```text
//! /dev/disk/by-path/ip-<portal>-iscsi-<iqn>-lun-<lun>
//! ```
//!
//! Offload transports (bnx2i, cxgb4i, qla4xxx, ...) prefix the name with the
//! adapter's PCI address, so for any transport other than `default` the
//! candidates are globbed as `*ip-<portal>-iscsi-<iqn>-lun-<lun>`.
//!
//! In multipath mode every portal reported by send-targets discovery is
//! logged in and the dm-multipath alias owning the device is returned.
//! Disconnect only logs out of a target once no other local device uses it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use brick_host::devices::BY_PATH_DIR;
use brick_host::multipath::{self, MultipathMap};
use brick_host::{CommandRunner, Exec, ExecOutput, HostError};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ConnectorConfig;
use crate::connector::{self, CONNECT_VOLUME_LOCK, Connector, DeviceInfo, locked_operation};
use crate::error::{ConnectorError, Result};
use crate::factory::HostContext;
use crate::metrics;
use crate::properties::{ChapAuth, ConnectionProperties, IscsiTarget, strip_tpgt};
use crate::protocol::Protocol;
use crate::retry::{Backoff, poll_with_rescan};

pub const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";

/// iface transports usable for sessions.
pub const SUPPORTED_TRANSPORTS: [&str; 8] = [
    "be2iscsi", "bnx2i", "cxgb3i", "default", "cxgb4i", "qla4xxx", "ocs", "iser",
];

// iscsiadm exit codes
const ISCSI_ERR_IDBM: i32 = 6;
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;
const ISCSI_ERR_GENERIC: i32 = 255;

/// `(portal, iqn)` pair as reported by discovery.
pub type PortalIqn = (String, String);

/// Parse send-targets discovery output into `(portal, iqn)` pairs.
///
/// Only lines made of exactly a portal and an IQN are kept; iscsiadm may
/// mix log lines into its output.
pub fn parse_discovery_output(output: &str) -> Vec<PortalIqn> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                [portal, iqn] if iqn.starts_with("iqn.") => {
                    Some((portal.to_string(), iqn.to_string()))
                }
                _ => None,
            }
        })
        .collect()
}

/// Parse `iscsiadm -m session` output into `(portal, iqn)` pairs.
///
/// Session lines look like
/// `tcp: [3] 10.0.0.5:3260,1 iqn.2010-x:vol1 (non-flash)`.
pub fn parse_sessions(output: &str) -> Vec<PortalIqn> {
    output
        .lines()
        .filter(|line| line.starts_with("tcp:") || line.starts_with("iser:"))
        .filter_map(|line| {
            let mut tokens = line.split_whitespace().skip(2);
            let portal = tokens.next()?;
            let iqn = tokens.next()?;
            Some((portal.to_string(), iqn.to_string()))
        })
        .collect()
}

/// Read the local initiator IQN; `None` when it cannot be read.
pub fn read_initiator_name(runner: &dyn CommandRunner) -> Option<String> {
    match runner.run(&Exec::new("cat").arg(INITIATOR_NAME_FILE).root()) {
        Ok(out) => out
            .stdout
            .lines()
            .find_map(|line| line.strip_prefix("InitiatorName="))
            .map(|name| name.trim().to_string()),
        Err(e) => {
            warn!(file = INITIATOR_NAME_FILE, error = %e, "Could not read the iSCSI initiator file");
            None
        }
    }
}

/// Resolve the iface to use, falling back to `default`.
///
/// `default` and `iser` need no iface record. Anything else must exist and
/// name one of [`SUPPORTED_TRANSPORTS`].
pub fn validate_iface_transport(runner: &dyn CommandRunner, iface: &str) -> String {
    if iface == "default" || iface == "iser" {
        return iface.to_string();
    }

    // 6: iface record not found, 2: iscsid not reachable
    let exec = Exec::new("iscsiadm")
        .args(["-m", "iface", "-I", iface])
        .root()
        .ok_codes(&[0, 2, 6]);
    match runner.run(&exec) {
        Ok(out) => {
            debug!(iface = %iface, stdout = %out.stdout, "iscsiadm iface configuration");
            let supported = out.stdout.lines().any(|line| {
                let data: Vec<&str> = line.split_whitespace().collect();
                data.len() >= 3
                    && data[0] == "iface.transport_name"
                    && SUPPORTED_TRANSPORTS.contains(&data[2])
            });
            if supported {
                return iface.to_string();
            }
        }
        Err(e) => debug!(iface = %iface, error = %e, "iscsiadm iface query failed"),
    }

    warn!(
        iface = %iface,
        "No usable transport found for iSCSI iface, falling back to default transport"
    );
    "default".to_string()
}

/// Offset just past the `ip-` marker of an iSCSI by-path entry name.
///
/// Plain entries start with `ip-`; offload entries carry a PCI prefix,
/// `pci-0000:05:00.2-ip-...`.
fn by_path_ip_offset(entry: &str) -> Option<usize> {
    if entry.starts_with("ip-") {
        return Some(3);
    }
    if entry.starts_with("pci-") {
        let window = entry.get(16..21)?;
        return window.find("ip-").map(|i| 16 + i + 3);
    }
    None
}

pub struct IscsiConnector {
    ctx: HostContext,
    protocol: Protocol,
    use_multipath: bool,
    transport: String,
    device_scan_attempts: u32,
    backoff: Backoff,
}

impl IscsiConnector {
    /// iSER connectors always use the `iser` transport.
    pub fn new(ctx: HostContext, config: &ConnectorConfig, protocol: Protocol) -> Self {
        let requested = if protocol == Protocol::Iser {
            "iser"
        } else {
            config.transport.as_str()
        };
        let transport = validate_iface_transport(ctx.runner.as_ref(), requested);
        Self {
            ctx,
            protocol,
            use_multipath: config.use_multipath,
            transport,
            device_scan_attempts: config.device_scan_attempts.max(1),
            backoff: Backoff::Quadratic(config.backoff_unit()),
        }
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn use_multipath(&self) -> bool {
        self.use_multipath
    }

    pub fn get_initiator(&self) -> Option<String> {
        read_initiator_name(self.ctx.runner.as_ref())
    }

    // ========================================================================
    // iscsiadm helpers
    // ========================================================================

    fn iscsiadm_bare(&self, args: &[&str], ok_codes: &[i32]) -> brick_host::Result<ExecOutput> {
        let exec = Exec::new("iscsiadm")
            .args(args.iter().copied())
            .root()
            .ok_codes(ok_codes);
        let out = self.ctx.runner.run(&exec)?;
        debug!(command = %exec.display(), stdout = %out.stdout, stderr = %out.stderr, "iscsiadm");
        Ok(out)
    }

    fn iscsiadm_node(
        &self,
        portal: &str,
        iqn: &str,
        args: &[&str],
        ok_codes: &[i32],
        attempts: u32,
    ) -> brick_host::Result<ExecOutput> {
        let exec = Exec::new("iscsiadm")
            .args(["-m", "node", "-T", iqn, "-p", portal])
            .args(args.iter().copied())
            .root()
            .ok_codes(ok_codes)
            .attempts(attempts);
        let out = self.ctx.runner.run(&exec)?;
        debug!(command = %exec.display(), stdout = %out.stdout, "iscsiadm node");
        Ok(out)
    }

    fn iscsiadm_update(
        &self,
        portal: &str,
        iqn: &str,
        key: &str,
        value: &str,
        ok_codes: &[i32],
    ) -> brick_host::Result<ExecOutput> {
        self.iscsiadm_node(
            portal,
            iqn,
            &["--op", "update", "-n", key, "-v", value],
            ok_codes,
            1,
        )
    }

    fn rescan_iscsi(&self) -> brick_host::Result<()> {
        let ok_codes = [0, 1, ISCSI_ERR_NO_OBJS_FOUND, ISCSI_ERR_GENERIC];
        self.iscsiadm_bare(&["-m", "node", "--rescan"], &ok_codes)?;
        self.iscsiadm_bare(&["-m", "session", "--rescan"], &ok_codes)?;
        Ok(())
    }

    fn rescan_multipath(&self) -> brick_host::Result<()> {
        self.ctx.runner.run(
            &Exec::new("multipath")
                .arg("-r")
                .root()
                .ok_codes(&[0, 1, ISCSI_ERR_NO_OBJS_FOUND]),
        )?;
        Ok(())
    }

    fn run_multipath_ll(&self, device: Option<&Path>) -> brick_host::Result<String> {
        let mut exec = Exec::new("multipath").arg("-ll").root().ok_codes(&[0, 1]);
        if let Some(device) = device {
            exec = exec.arg(device.to_string_lossy());
        }
        let out = self.ctx.runner.run(&exec)?;
        debug!(command = %exec.display(), stdout = %out.stdout, "multipath");
        Ok(out.stdout)
    }

    // ========================================================================
    // Discovery and sessions
    // ========================================================================

    fn update_discoverydb(&self, portal: &str, auth: &ChapAuth) -> brick_host::Result<ExecOutput> {
        self.iscsiadm_bare(
            &[
                "-m",
                "discoverydb",
                "-t",
                "sendtargets",
                "-p",
                portal,
                "--op",
                "update",
                "-n",
                "discovery.sendtargets.auth.authmethod",
                "-v",
                auth.method.as_str(),
                "-n",
                "discovery.sendtargets.auth.username",
                "-v",
                auth.username.as_str(),
                "-n",
                "discovery.sendtargets.auth.password",
                "-v",
                auth.password.as_str(),
            ],
            &[0],
        )
    }

    /// Portals and IQNs of the volume's targets.
    ///
    /// Explicit `target_portals`/`target_iqns` lists are used as given;
    /// otherwise a send-targets discovery is run against `target_portal`.
    pub fn discover_iscsi_portals(&self, props: &ConnectionProperties) -> Result<Vec<PortalIqn>> {
        if let Some(pairs) = props.given_portals()? {
            return Ok(pairs);
        }

        let portal = props.target_portal()?;
        let output = match props.discovery_auth()? {
            Some(auth) => {
                if let Err(e) = self.update_discoverydb(portal, &auth) {
                    if !e.has_exit_code(&[ISCSI_ERR_IDBM]) {
                        error!(target_portal = %portal, error = %e, "Unable to find target portal");
                        return Err(e.into());
                    }
                    info!(target_portal = %portal, "Creating discovery record");
                    self.iscsiadm_bare(
                        &["-m", "discoverydb", "-t", "sendtargets", "-p", portal, "--op", "new"],
                        &[0, ISCSI_ERR_GENERIC],
                    )?;
                    self.update_discoverydb(portal, &auth)?;
                }
                self.iscsiadm_bare(
                    &["-m", "discoverydb", "-t", "sendtargets", "-p", portal, "--discover"],
                    &[0, ISCSI_ERR_GENERIC],
                )?
            }
            None => self.iscsiadm_bare(
                &["-m", "discovery", "-t", "sendtargets", "-p", portal],
                &[0, ISCSI_ERR_GENERIC],
            )?,
        };

        Ok(parse_discovery_output(&output.stdout))
    }

    fn discover_or_not_found(&self, props: &ConnectionProperties) -> Result<Vec<PortalIqn>> {
        self.discover_iscsi_portals(props).map_err(|e| match e {
            ConnectorError::Host(_) => ConnectorError::TargetPortalNotFound(
                props.get_str("target_portal").unwrap_or_default().to_string(),
            ),
            other => other,
        })
    }

    fn active_sessions(&self) -> Result<Vec<PortalIqn>> {
        let out = self.iscsiadm_bare(&["-m", "session"], &[0, 1, ISCSI_ERR_NO_OBJS_FOUND])?;
        Ok(parse_sessions(&out.stdout))
    }

    /// Make sure a node record exists for the target and a session is
    /// logged in. Returns false when the login itself failed.
    #[instrument(skip(self, auth))]
    fn connect_to_iscsi_portal(
        &self,
        portal: &str,
        iqn: &str,
        auth: Option<&ChapAuth>,
    ) -> Result<bool> {
        // 21: no records found, 255: not found on older iscsiadm
        match self.iscsiadm_node(portal, iqn, &[], &[0], 1) {
            Ok(_) => {}
            Err(e) if e.has_exit_code(&[ISCSI_ERR_NO_OBJS_FOUND, ISCSI_ERR_GENERIC]) => {
                info!(portal = %portal, target_iqn = %iqn, transport = %self.transport, "Creating node record");
                self.iscsiadm_node(
                    portal,
                    iqn,
                    &["--interface", self.transport.as_str(), "--op", "new"],
                    &[0],
                    1,
                )?;
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(auth) = auth {
            self.iscsiadm_update(portal, iqn, "node.session.auth.authmethod", &auth.method, &[0])?;
            self.iscsiadm_update(portal, iqn, "node.session.auth.username", &auth.username, &[0])?;
            self.iscsiadm_update(portal, iqn, "node.session.auth.password", &auth.password, &[0])?;
        }

        // Duplicate logins upset iscsiadm, so check the session table first.
        let stripped = strip_tpgt(portal);
        let logged_in = self
            .active_sessions()?
            .iter()
            .any(|(p, i)| strip_tpgt(p) == stripped && i == iqn);
        if logged_in {
            debug!(portal = %portal, target_iqn = %iqn, "Session already established");
            return Ok(true);
        }

        match self.iscsiadm_node(portal, iqn, &["--login"], &[0, ISCSI_ERR_GENERIC], 1) {
            Ok(_) => {}
            Err(e) if e.has_exit_code(&[ISCSI_ERR_SESS_EXISTS]) => {
                debug!(portal = %portal, target_iqn = %iqn, "Session already exists");
            }
            Err(e @ HostError::ProcessExecution { .. }) => {
                warn!(
                    portal = %portal,
                    target_iqn = %iqn,
                    exit_code = ?e.exit_code(),
                    "Failed to login iSCSI target"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        info!(portal = %portal, target_iqn = %iqn, "Logged in to iSCSI target");
        self.iscsiadm_update(portal, iqn, "node.startup", "automatic", &[0])?;
        Ok(true)
    }

    #[instrument(skip(self))]
    fn disconnect_from_iscsi_portal(&self, portal: &str, iqn: &str) -> Result<()> {
        let ok_codes = [0, ISCSI_ERR_NO_OBJS_FOUND, ISCSI_ERR_GENERIC];
        self.iscsiadm_update(portal, iqn, "node.startup", "manual", &ok_codes)?;
        self.iscsiadm_node(portal, iqn, &["--logout"], &ok_codes, 1)?;
        self.iscsiadm_node(portal, iqn, &["--op", "delete"], &ok_codes, 5)?;
        info!(portal = %portal, target_iqn = %iqn, "Logged out of iSCSI target");
        Ok(())
    }

    // ========================================================================
    // Device paths
    // ========================================================================

    /// Candidate by-path nodes for the given targets, in target order.
    pub fn device_paths(&self, targets: &[IscsiTarget]) -> Vec<PathBuf> {
        if self.transport == "default" {
            return targets
                .iter()
                .map(|t| {
                    PathBuf::from(format!(
                        "{}/ip-{}-iscsi-{}-lun-{}",
                        BY_PATH_DIR, t.portal, t.iqn, t.lun
                    ))
                })
                .collect();
        }

        targets
            .iter()
            .flat_map(|t| {
                self.ctx.devices.glob(&format!(
                    "{}/*ip-{}-iscsi-{}-lun-{}",
                    BY_PATH_DIR, t.portal, t.iqn, t.lun
                ))
            })
            .collect()
    }

    fn first_existing(&self, paths: &[PathBuf]) -> Option<PathBuf> {
        paths.iter().find(|p| self.ctx.devices.exists(p)).cloned()
    }

    /// `/dev/mapper/<alias>` owning a single-path device, if any.
    pub fn get_multipath_device_name(&self, single_path_device: &Path) -> Result<Option<PathBuf>> {
        let device = self.ctx.devices.realpath(single_path_device);
        let output = self.run_multipath_ll(Some(&device))?;
        Ok(multipath::first_alias(&output)
            .map(|alias| Path::new(brick_host::devices::MAPPER_DIR).join(alias)))
    }

    fn get_multipath_device_map(&self) -> Result<MultipathMap> {
        let output = self.run_multipath_ll(None)?;
        let map = MultipathMap::parse(&output);
        if map.is_empty() && output.lines().any(|line| !multipath::is_noise_line(line)) {
            warn!("Failed to parse the output of multipath -ll");
        }
        Ok(map)
    }

    /// iSCSI entry names currently under `/dev/disk/by-path`.
    fn iscsi_by_path_entries(&self) -> Vec<String> {
        self.ctx
            .devices
            .list_dir(Path::new(BY_PATH_DIR))
            .into_iter()
            .filter(|entry| by_path_ip_offset(entry).is_some())
            .collect()
    }

    /// IQNs of the by-path entries that belong to one of `multipath_devices`.
    fn get_multipath_iqns(&self, multipath_devices: &[PathBuf], map: &MultipathMap) -> Vec<String> {
        self.iscsi_by_path_entries()
            .into_iter()
            .filter_map(|entry| {
                let real = self.ctx.devices.realpath(&Path::new(BY_PATH_DIR).join(&entry));
                let owner = map.get(&real)?;
                if !multipath_devices.iter().any(|d| d == owner) {
                    return None;
                }
                let (_, rest) = entry.split_once("iscsi-")?;
                rest.split("-lun").next().map(str::to_string)
            })
            .collect()
    }

    // ========================================================================
    // Connect
    // ========================================================================

    fn connect_multipath(&self, props: &ConnectionProperties) -> Result<Vec<IscsiTarget>> {
        let mut ips_iqns = self.discover_or_not_found(props)?;

        if !props.has_target_iqns() {
            // One IQN exposed on every portal, or a distinct IQN per portal?
            // Compare the portals carrying the given IQN with all portals.
            let main_iqn = props.target_iqn()?;
            let mut all_portals: Vec<String> = Vec::new();
            for (portal, _) in &ips_iqns {
                if !all_portals.contains(portal) {
                    all_portals.push(portal.clone());
                }
            }
            let match_portals: HashSet<&str> = ips_iqns
                .iter()
                .filter(|(_, iqn)| iqn == main_iqn)
                .map(|(portal, _)| portal.as_str())
                .collect();
            if all_portals.len() == match_portals.len() {
                ips_iqns = all_portals
                    .into_iter()
                    .map(|portal| (portal, main_iqn.to_string()))
                    .collect();
            }
        }

        let auth = props.session_auth()?;
        for (portal, iqn) in &ips_iqns {
            if !self.connect_to_iscsi_portal(portal, iqn, auth.as_ref())? {
                warn!(portal = %portal, target_iqn = %iqn, "Failed to connect to iSCSI portal");
            }
        }

        self.rescan_iscsi()?;
        props.iscsi_targets()
    }

    /// Log in to the first target that accepts, in the order given.
    fn connect_single_path(&self, props: &ConnectionProperties) -> Result<Vec<IscsiTarget>> {
        let targets = props.iscsi_targets()?;
        let auth = props.session_auth()?;
        for target in &targets {
            if self.connect_to_iscsi_portal(&target.portal, &target.iqn, auth.as_ref())? {
                return Ok(vec![target.clone()]);
            }
            warn!(portal = %target.portal, target_iqn = %target.iqn, "Failed to connect to iSCSI portal");
        }
        Ok(targets)
    }

    fn wait_for_device(&self, targets: &[IscsiTarget]) -> Result<PathBuf> {
        let found = poll_with_rescan(
            self.device_scan_attempts,
            self.backoff,
            || self.first_existing(&self.device_paths(targets)),
            |attempt| -> Result<()> {
                warn!(
                    candidates = ?self.device_paths(targets),
                    attempt,
                    "iSCSI volume not yet found, will rescan and retry"
                );
                metrics::record_rescan(self.protocol);
                if self.use_multipath {
                    self.rescan_iscsi()?;
                } else {
                    for target in targets {
                        self.iscsiadm_node(&target.portal, &target.iqn, &["--rescan"], &[0], 1)?;
                    }
                }
                Ok(())
            },
        )?;

        found.ok_or_else(|| {
            let candidates = self.device_paths(targets);
            error!(candidates = ?candidates, "iSCSI volume device not found");
            ConnectorError::VolumeDeviceNotFound(candidates)
        })
    }

    #[instrument(skip(self, props))]
    fn do_connect(&self, props: &ConnectionProperties) -> Result<DeviceInfo> {
        let targets = if self.use_multipath {
            self.connect_multipath(props)?
        } else {
            self.connect_single_path(props)?
        };

        let mut host_device = self.wait_for_device(&targets)?;
        debug!(device = %host_device.display(), "Found iSCSI node");

        if self.use_multipath {
            self.rescan_multipath()?;
            match self.get_multipath_device_name(&host_device)? {
                Some(mpath) => {
                    info!(device = %host_device.display(), multipath = %mpath.display(), "Using multipath device");
                    host_device = mpath;
                }
                None => warn!(
                    device = %host_device.display(),
                    "Unable to find multipath device name for volume, using single path"
                ),
            }
        }

        Ok(DeviceInfo::block(host_device))
    }

    // ========================================================================
    // Disconnect
    // ========================================================================

    /// Remove the target's device node and log out once no other LUN of the
    /// target is still present.
    fn disconnect_volume_iscsi(&self, target: &IscsiTarget) -> Result<()> {
        let Some(host_device) = self.device_paths(std::slice::from_ref(target)).into_iter().next()
        else {
            return Ok(());
        };

        if let Some(dev_name) = self.ctx.scsi.get_name_from_path(&host_device) {
            self.ctx.scsi.remove_scsi_device(&dev_name)?;
            // The by-path link can outlive the delete briefly; logging out
            // before it is gone would orphan the session.
            self.ctx.scsi.wait_for_volume_removal(&host_device)?;
        }

        let device_byname = format!("ip-{}-iscsi-{}-lun-", target.portal, target.iqn);
        let in_use = self
            .ctx
            .driver
            .get_all_block_devices()
            .into_iter()
            .any(|dev| {
                let name = dev.to_string_lossy();
                name.starts_with(BY_PATH_DIR)
                    && name.contains(&device_byname)
                    && self.ctx.devices.exists(&dev)
            });
        if in_use {
            info!(
                portal = %target.portal,
                target_iqn = %target.iqn,
                "Other LUNs of the target are in use, keeping the session"
            );
            return Ok(());
        }

        self.disconnect_from_iscsi_portal(&target.portal, &target.iqn)
    }

    fn disconnect_mpath(&self, ips_iqns: &[PortalIqn]) -> Result<()> {
        for (portal, iqn) in ips_iqns {
            self.disconnect_from_iscsi_portal(portal, iqn)?;
        }
        self.rescan_multipath()?;
        Ok(())
    }

    fn disconnect_volume_multipath_iscsi(
        &self,
        props: &ConnectionProperties,
        multipath_name: &Path,
    ) -> Result<()> {
        debug!(multipath = %multipath_name.display(), "Disconnecting multipath device");
        let mpath_map = self.get_multipath_device_map()?;

        // Multipath devices still in use on this host.
        let mut devices: Vec<PathBuf> = Vec::new();
        for dev in self.ctx.driver.get_all_block_devices() {
            if !self.ctx.devices.exists(&dev) {
                continue;
            }
            if dev.to_string_lossy().contains("/mapper/") {
                devices.push(dev);
            } else if let Some(mpdev) = mpath_map.get(&self.ctx.devices.realpath(&dev)) {
                devices.push(mpdev.to_path_buf());
            }
        }

        // Discovery can list targets of other volumes; only targets without
        // any remaining by-path entry are candidates for logout.
        let all_ips_iqns = self.discover_or_not_found(props)?;
        let entries: HashSet<String> = self
            .iscsi_by_path_entries()
            .into_iter()
            .filter_map(|entry| {
                let offset = by_path_ip_offset(&entry)?;
                entry[offset..].split("-lun-").next().map(str::to_string)
            })
            .collect();
        let ips_iqns: Vec<PortalIqn> = all_ips_iqns
            .into_iter()
            .filter(|(ip, iqn)| !entries.contains(&format!("{}-iscsi-{}", strip_tpgt(ip), iqn)))
            .collect();

        if devices.is_empty() {
            return self.disconnect_mpath(&ips_iqns);
        }

        let other_iqns = self.get_multipath_iqns(&devices, &mpath_map);
        let in_use = ips_iqns.iter().any(|(_, iqn)| other_iqns.contains(iqn));
        if in_use {
            info!(
                multipath = %multipath_name.display(),
                "Targets are shared with other multipath devices, keeping sessions"
            );
            return Ok(());
        }

        self.disconnect_mpath(&ips_iqns)
    }

    #[instrument(skip(self, props))]
    fn do_disconnect(&self, props: &ConnectionProperties) -> Result<()> {
        let targets = props.iscsi_targets()?;

        if self.use_multipath {
            self.rescan_multipath()?;
            let mut host_device = None;
            let mut multipath_device = None;
            for dev in self.device_paths(&targets) {
                if self.ctx.devices.exists(&dev) {
                    multipath_device = self.get_multipath_device_name(&dev)?;
                    host_device = Some(dev);
                    if multipath_device.is_some() {
                        break;
                    }
                }
            }

            match (host_device, multipath_device) {
                (Some(host_device), Some(multipath_device)) => {
                    let device_realpath = self.ctx.devices.realpath(&host_device);
                    self.ctx.scsi.remove_multipath_device(&device_realpath)?;
                    return self.disconnect_volume_multipath_iscsi(props, &multipath_device);
                }
                (None, _) => {
                    warn!(
                        candidates = ?self.device_paths(&targets),
                        "No accessible volume device, cleaning up target sessions"
                    );
                }
                (Some(_), None) => {}
            }
        }

        // Logging in to one LUN of a multi-LUN target creates devices for the
        // others too, so every listed target is cleaned up.
        for target in &targets {
            self.disconnect_volume_iscsi(target)?;
        }
        Ok(())
    }
}

impl Connector for IscsiConnector {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn lock_name(&self) -> &str {
        CONNECT_VOLUME_LOCK
    }

    fn connect_volume(&self, properties: &ConnectionProperties) -> Result<DeviceInfo> {
        locked_operation(
            &self.ctx.locks,
            self.lock_name(),
            self.protocol,
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
            self.protocol,
            "disconnect_volume",
            || self.do_disconnect(properties),
        )
    }

    fn check_valid_device(&self, path: &Path) -> bool {
        connector::check_valid_device(self.ctx.runner.as_ref(), path)
    }
}
