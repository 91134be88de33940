//! iSCSI connector tests against an in-memory host.
//!
//! Commands are scripted on a `FakeHost`; device nodes appear when the
//! login or rescan that would create them runs, and disappear on the sysfs
//! delete.

use std::sync::Arc;
use std::time::{Duration, Instant};

use brick_host::DeviceTree;
use brick_host::fake::FakeHost;
use brick_initiator::{
    ConnectionProperties, Connector, ConnectorConfig, ConnectorError, DeviceInfo, HostContext,
    IscsiConnector, Protocol,
};
use serde_json::json;

const PORTAL: &str = "10.0.0.5:3260";
const IQN: &str = "iqn.2010-x:vol1";
const DEV_LUN0: &str = "/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.2010-x:vol1-lun-0";
const DEV_LUN1: &str = "/dev/disk/by-path/ip-10.0.0.5:3260-iscsi-iqn.2010-x:vol1-lun-1";
const NODE: &str = "iscsiadm -m node -T iqn.2010-x:vol1 -p 10.0.0.5:3260";

fn config(use_multipath: bool) -> ConnectorConfig {
    ConnectorConfig {
        use_multipath,
        backoff_unit_ms: 0,
        fc_scan_interval_ms: 0,
        scsi_retry_interval_ms: 0,
        ..Default::default()
    }
}

fn connector(host: &Arc<FakeHost>, config: &ConnectorConfig) -> IscsiConnector {
    let ctx = HostContext::new(host.clone(), host.clone(), Duration::ZERO);
    IscsiConnector::new(ctx, config, Protocol::Iscsi)
}

fn props(value: serde_json::Value) -> ConnectionProperties {
    ConnectionProperties::from_value(value).unwrap()
}

fn single(lun: u64) -> ConnectionProperties {
    props(json!({"target_portal": PORTAL, "target_iqn": IQN, "target_lun": lun}))
}

fn logins(host: &FakeHost) -> Vec<String> {
    host.calls()
        .into_iter()
        .filter(|call| call.ends_with("--login"))
        .collect()
}

// ============================================================================
// Connect
// ============================================================================

#[test]
fn test_connect_returns_by_path_device() {
    let host = Arc::new(FakeHost::new());
    host.link_on_run(&format!("{} --login", NODE), DEV_LUN0, "/dev/sdb");
    let iscsi = connector(&host, &config(false));

    let device = iscsi.connect_volume(&single(0)).unwrap();

    assert_eq!(device, DeviceInfo::block(DEV_LUN0));
    assert_eq!(device.device_type, "block");
    assert_eq!(logins(&host), vec![format!("{} --login", NODE)]);
    assert_eq!(
        host.count(&format!("{} --op update -n node.startup -v automatic", NODE)),
        1
    );
    assert_eq!(host.count(&format!("{} --rescan", NODE)), 0);
}

#[test]
fn test_connect_creates_missing_node_record() {
    let host = Arc::new(FakeHost::new());
    host.fail_once(NODE, 21);
    host.link_on_run(&format!("{} --login", NODE), DEV_LUN0, "/dev/sdb");
    let iscsi = connector(&host, &config(false));

    iscsi.connect_volume(&single(0)).unwrap();

    assert_eq!(
        host.count(&format!("{} --interface default --op new", NODE)),
        1
    );
}

#[test]
fn test_connect_pushes_chap_credentials() {
    let host = Arc::new(FakeHost::new());
    host.add_link(DEV_LUN0, "/dev/sdb");
    let iscsi = connector(&host, &config(false));

    let p = props(json!({
        "target_portal": PORTAL,
        "target_iqn": IQN,
        "auth_method": "CHAP",
        "auth_username": "user",
        "auth_password": "secret"
    }));
    iscsi.connect_volume(&p).unwrap();

    let calls = host.calls();
    let auth_updates: Vec<&String> = calls
        .iter()
        .filter(|call| call.contains("node.session.auth"))
        .collect();
    assert_eq!(auth_updates.len(), 3);
    assert!(auth_updates[0].ends_with("node.session.auth.authmethod -v CHAP"));
    assert!(auth_updates[2].ends_with("node.session.auth.password -v secret"));
}

#[test]
fn test_connect_is_idempotent() {
    let host = Arc::new(FakeHost::new());
    host.link_on_run(&format!("{} --login", NODE), DEV_LUN0, "/dev/sdb");
    let iscsi = connector(&host, &config(false));

    let first = iscsi.connect_volume(&single(0)).unwrap();
    host.respond(
        "iscsiadm -m session",
        "tcp: [1] 10.0.0.5:3260,1 iqn.2010-x:vol1 (non-flash)\n",
    );
    let second = iscsi.connect_volume(&single(0)).unwrap();

    assert_eq!(first, second);
    assert_eq!(logins(&host).len(), 1);
}

#[test]
fn test_login_exit_code_15_is_success() {
    let host = Arc::new(FakeHost::new());
    host.add_link(DEV_LUN0, "/dev/sdb");
    host.fail(&format!("{} --login", NODE), 15);
    let iscsi = connector(&host, &config(false));

    let device = iscsi.connect_volume(&single(0)).unwrap();

    assert_eq!(device.path.to_str(), Some(DEV_LUN0));
    assert_eq!(
        host.count(&format!("{} --op update -n node.startup -v automatic", NODE)),
        1
    );
}

#[test]
fn test_connect_tries_targets_in_order() {
    let host = Arc::new(FakeHost::new());
    let second_dev = "/dev/disk/by-path/ip-10.0.0.6:3260-iscsi-iqn.2010-x:vol2-lun-3";
    host.fail(&format!("{} --login", NODE), 8);
    host.link_on_run(
        "iscsiadm -m node -T iqn.2010-x:vol2 -p 10.0.0.6:3260 --login",
        second_dev,
        "/dev/sdc",
    );
    let iscsi = connector(&host, &config(false));

    let p = props(json!({
        "target_portals": [PORTAL, "10.0.0.6:3260"],
        "target_iqns": [IQN, "iqn.2010-x:vol2"],
        "target_luns": [0, 3]
    }));
    let device = iscsi.connect_volume(&p).unwrap();

    assert_eq!(device.path.to_str(), Some(second_dev));
    assert_eq!(logins(&host).len(), 2);
}

#[test]
fn test_device_appears_after_rescan() {
    let host = Arc::new(FakeHost::new());
    host.link_on_run(&format!("{} --rescan", NODE), DEV_LUN0, "/dev/sdb");
    let iscsi = connector(&host, &config(false));

    let device = iscsi.connect_volume(&single(0)).unwrap();

    assert_eq!(device.path.to_str(), Some(DEV_LUN0));
    assert_eq!(host.count(&format!("{} --rescan", NODE)), 1);
}

#[test]
fn test_retry_budget_is_bounded() {
    let host = Arc::new(FakeHost::new());
    let config = ConnectorConfig {
        device_scan_attempts: 3,
        backoff_unit_ms: 5,
        ..config(false)
    };
    let iscsi = connector(&host, &config);

    let start = Instant::now();
    let err = iscsi.connect_volume(&single(0)).unwrap_err();

    match err {
        ConnectorError::VolumeDeviceNotFound(candidates) => {
            assert_eq!(candidates.len(), 1);
            assert_eq!(candidates[0].to_str(), Some(DEV_LUN0));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(host.count(&format!("{} --rescan", NODE)), 3);
    // 0 + 1 + 4 backoff units
    assert!(start.elapsed() >= Duration::from_millis(25));
}

#[test]
fn test_invalid_properties_fail_fast() {
    let host = Arc::new(FakeHost::new());
    let iscsi = connector(&host, &config(false));

    let err = iscsi
        .connect_volume(&props(json!({"target_portal": PORTAL})))
        .unwrap_err();

    assert!(matches!(err, ConnectorError::InvalidProperties(_)));
    assert!(host.calls().is_empty());
}

// ============================================================================
// Multipath connect
// ============================================================================

const MPATHA_HEADER: &str = "mpatha (36e00000000010001) dm-0 IET,VIRTUAL-DISK\n";

#[test]
fn test_multipath_shared_iqn_logs_in_to_every_portal() {
    let host = Arc::new(FakeHost::new());
    host.respond(
        "iscsiadm -m discovery -t sendtargets -p 10.0.0.5:3260",
        "10.0.0.5:3260,1 iqn.2010-x:vol1\n\
         10.0.0.6:3260,1 iqn.2010-x:vol1\n\
         10.0.0.7:3260,1 iqn.2010-x:vol1\n",
    );
    host.add_link(DEV_LUN1, "/dev/sdb");
    host.respond("multipath -ll /dev/sdb", MPATHA_HEADER);
    let iscsi = connector(&host, &config(true));

    let device = iscsi.connect_volume(&single(1)).unwrap();

    assert_eq!(device.path.to_str(), Some("/dev/mapper/mpatha"));
    assert_eq!(
        logins(&host),
        vec![
            "iscsiadm -m node -T iqn.2010-x:vol1 -p 10.0.0.5:3260,1 --login",
            "iscsiadm -m node -T iqn.2010-x:vol1 -p 10.0.0.6:3260,1 --login",
            "iscsiadm -m node -T iqn.2010-x:vol1 -p 10.0.0.7:3260,1 --login",
        ]
    );
    assert_eq!(host.count("iscsiadm -m session --rescan"), 1);
    assert_eq!(host.count("multipath -r"), 1);
}

#[test]
fn test_multipath_distinct_iqns_use_discovered_pairs() {
    let host = Arc::new(FakeHost::new());
    host.respond(
        "iscsiadm -m discovery -t sendtargets -p 10.0.0.5:3260",
        "10.0.0.5:3260,1 iqn.2010-x:vol1\n\
         10.0.0.6:3260,1 iqn.2010-x:vol2\n\
         10.0.0.7:3260,1 iqn.2010-x:vol3\n",
    );
    host.add_link(DEV_LUN1, "/dev/sdb");
    host.respond("multipath -ll /dev/sdb", MPATHA_HEADER);
    let iscsi = connector(&host, &config(true));

    iscsi.connect_volume(&single(1)).unwrap();

    assert_eq!(
        logins(&host),
        vec![
            "iscsiadm -m node -T iqn.2010-x:vol1 -p 10.0.0.5:3260,1 --login",
            "iscsiadm -m node -T iqn.2010-x:vol2 -p 10.0.0.6:3260,1 --login",
            "iscsiadm -m node -T iqn.2010-x:vol3 -p 10.0.0.7:3260,1 --login",
        ]
    );
}

#[test]
fn test_multipath_without_alias_uses_single_path() {
    let host = Arc::new(FakeHost::new());
    host.respond(
        "iscsiadm -m discovery -t sendtargets -p 10.0.0.5:3260",
        "10.0.0.5:3260,1 iqn.2010-x:vol1\n",
    );
    host.add_link(DEV_LUN1, "/dev/sdb");
    host.respond(
        "multipath -ll /dev/sdb",
        "Oct 19 10:01:02 | /etc/multipath.conf does not exist\n",
    );
    let iscsi = connector(&host, &config(true));

    let device = iscsi.connect_volume(&single(1)).unwrap();

    assert_eq!(device.path.to_str(), Some(DEV_LUN1));
}

#[test]
fn test_multipath_discovery_failure() {
    let host = Arc::new(FakeHost::new());
    host.fail("iscsiadm -m discovery", 4);
    let iscsi = connector(&host, &config(true));

    let err = iscsi.connect_volume(&single(0)).unwrap_err();

    assert!(matches!(err, ConnectorError::TargetPortalNotFound(p) if p == PORTAL));
    assert!(logins(&host).is_empty());
}

#[test]
fn test_discovery_with_auth_creates_discoverydb_record() {
    let host = Arc::new(FakeHost::new());
    host.fail_once(
        "iscsiadm -m discoverydb -t sendtargets -p 10.0.0.5:3260 --op update",
        6,
    );
    host.respond(
        "iscsiadm -m discoverydb -t sendtargets -p 10.0.0.5:3260 --discover",
        "10.0.0.5:3260,1 iqn.2010-x:vol1\n",
    );
    let iscsi = connector(&host, &config(true));

    let p = props(json!({
        "target_portal": PORTAL,
        "target_iqn": IQN,
        "discovery_auth_method": "CHAP",
        "discovery_auth_username": "user",
        "discovery_auth_password": "secret"
    }));
    let pairs = iscsi.discover_iscsi_portals(&p).unwrap();

    assert_eq!(
        pairs,
        vec![("10.0.0.5:3260,1".to_string(), IQN.to_string())]
    );
    let discoverydb: Vec<String> = host
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("iscsiadm -m discoverydb"))
        .map(|call| {
            call.trim_start_matches("iscsiadm -m discoverydb -t sendtargets -p 10.0.0.5:3260 ")
                .split(' ')
                .take(2)
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    assert_eq!(
        discoverydb,
        vec!["--op update", "--op new", "--op update", "--discover"]
    );
}

#[test]
fn test_explicit_portal_lists_skip_discovery() {
    let host = Arc::new(FakeHost::new());
    let iscsi = connector(&host, &config(true));

    let p = props(json!({
        "target_portals": [PORTAL, "10.0.0.6:3260"],
        "target_iqns": [IQN, IQN],
        "target_luns": [0, 0]
    }));
    let pairs = iscsi.discover_iscsi_portals(&p).unwrap();

    assert_eq!(pairs.len(), 2);
    assert!(host.calls().is_empty());
}

// ============================================================================
// Disconnect
// ============================================================================

fn attach_lun(host: &FakeHost, by_path: &str, kernel: &str) {
    let device = format!("/dev/{}", kernel);
    host.add_link(by_path, &device);
    let delete = format!("/sys/block/{}/device/delete", kernel);
    host.add_path(&delete);
    host.remove_on_run(&format!("tee -a {}", delete), &[by_path, device.as_str()]);
}

#[test]
fn test_connect_then_disconnect_leaves_no_device() {
    let host = Arc::new(FakeHost::new());
    host.link_on_run(&format!("{} --login", NODE), DEV_LUN0, "/dev/sdb");
    host.add_path("/sys/block/sdb/device/delete");
    host.remove_on_run("tee -a /sys/block/sdb/device/delete", &[DEV_LUN0, "/dev/sdb"]);
    let iscsi = connector(&host, &config(false));

    let device = iscsi.connect_volume(&single(0)).unwrap();
    iscsi.disconnect_volume(&single(0), Some(&device)).unwrap();

    assert!(!host.exists(device.path.as_path()));
    assert!(host.list_dir("/dev/disk/by-path".as_ref()).is_empty());
    assert_eq!(host.count(&format!("{} --logout", NODE)), 1);
    assert_eq!(host.count(&format!("{} --op delete", NODE)), 1);
}

#[test]
fn test_disconnect_keeps_session_shared_with_other_lun() {
    let host = Arc::new(FakeHost::new());
    attach_lun(&host, DEV_LUN0, "sdb");
    attach_lun(&host, DEV_LUN1, "sdc");
    let iscsi = connector(&host, &config(false));

    iscsi.disconnect_volume(&single(0), None).unwrap();
    assert!(!host.exists(DEV_LUN0.as_ref()));
    assert_eq!(host.count(&format!("{} --logout", NODE)), 0);

    iscsi.disconnect_volume(&single(1), None).unwrap();
    assert!(!host.exists(DEV_LUN1.as_ref()));
    assert_eq!(host.count(&format!("{} --logout", NODE)), 1);
}

#[test]
fn test_disconnect_of_missing_device_is_not_an_error() {
    let host = Arc::new(FakeHost::new());
    let iscsi = connector(&host, &config(false));

    iscsi
        .disconnect_volume(&single(0), Some(&DeviceInfo::block(DEV_LUN0)))
        .unwrap();

    assert_eq!(host.count("tee"), 0);
}

const MPATHA_LISTING: &str = "\
mpatha (36e00000000010001) dm-0 IET,VIRTUAL-DISK
size=1.0G features='0' hwhandler='0' wp=rw
`-+- policy='service-time 0' prio=1 status=active
  `- 2:0:0:0 sdb 8:16 active ready running
";

const MPATHB_LISTING: &str = "\
mpathb (36e00000000010002) dm-1 IET,VIRTUAL-DISK
size=1.0G features='0' hwhandler='0' wp=rw
`-+- policy='service-time 0' prio=1 status=active
  `- 2:0:0:1 sdc 8:32 active ready running
";

fn multipath_host() -> Arc<FakeHost> {
    let host = Arc::new(FakeHost::new());
    attach_lun(&host, DEV_LUN0, "sdb");
    host.respond("multipath -ll /dev/sdb", MPATHA_LISTING);
    host.respond("multipath -l /dev/sdb", MPATHA_LISTING);
    host.respond(
        "iscsiadm -m discovery -t sendtargets -p 10.0.0.5:3260",
        "10.0.0.5:3260,1 iqn.2010-x:vol1\n",
    );
    host
}

#[test]
fn test_multipath_disconnect_logs_out_when_unused() {
    let host = multipath_host();
    host.respond("multipath -ll", "");
    let iscsi = connector(&host, &config(true));

    iscsi.disconnect_volume(&single(0), None).unwrap();

    assert!(!host.exists(DEV_LUN0.as_ref()));
    assert_eq!(host.count("multipath -f 36e00000000010001"), 1);
    assert_eq!(
        host.count("iscsiadm -m node -T iqn.2010-x:vol1 -p 10.0.0.5:3260,1 --logout"),
        1
    );
}

#[test]
fn test_multipath_disconnect_keeps_shared_target() {
    let host = multipath_host();
    host.add_link(DEV_LUN1, "/dev/sdc");
    host.respond("multipath -ll", MPATHB_LISTING);
    let iscsi = connector(&host, &config(true));

    iscsi.disconnect_volume(&single(0), None).unwrap();

    assert!(!host.exists(DEV_LUN0.as_ref()));
    assert!(host.exists(DEV_LUN1.as_ref()));
    assert_eq!(host.count("multipath -f 36e00000000010001"), 1);
    assert!(
        host.calls().iter().all(|call| !call.ends_with("--logout")),
        "unexpected logout: {:?}",
        host.calls()
    );
}

#[test]
fn test_multipath_disconnect_keeps_target_shared_through_other_portal() {
    let host = Arc::new(FakeHost::new());
    host.respond(
        "iscsiadm -m discovery -t sendtargets -p 10.0.0.5:3260",
        "10.0.0.5:3260,1 iqn.2010-x:vol1\n10.0.0.6:3260,1 iqn.2010-x:vol1\n",
    );
    attach_lun(&host, DEV_LUN0, "sdb");
    host.respond("multipath -ll /dev/sdb", MPATHA_LISTING);
    host.respond("multipath -l /dev/sdb", MPATHA_LISTING);
    let other_portal_lun1 = "/dev/disk/by-path/ip-10.0.0.6:3260-iscsi-iqn.2010-x:vol1-lun-1";
    host.add_link(other_portal_lun1, "/dev/sdc");
    host.respond("multipath -ll", MPATHB_LISTING);
    let iscsi = connector(&host, &config(true));

    iscsi.disconnect_volume(&single(0), None).unwrap();

    assert!(!host.exists(DEV_LUN0.as_ref()));
    assert!(host.exists(other_portal_lun1.as_ref()));
    assert_eq!(host.count("multipath -f 36e00000000010001"), 1);
    assert!(
        host.calls().iter().all(|call| !call.ends_with("--logout")),
        "unexpected logout: {:?}",
        host.calls()
    );
}

// ============================================================================
// Misc
// ============================================================================

#[test]
fn test_offload_transport_globs_candidates() {
    let host = Arc::new(FakeHost::new());
    host.respond("iscsiadm -m iface -I bnx2i.00:0a", "iface.transport_name = bnx2i\n");
    let offload = "/dev/disk/by-path/pci-0000:05:00.2-ip-10.0.0.5:3260-iscsi-iqn.2010-x:vol1-lun-0";
    host.link_on_run(&format!("{} --login", NODE), offload, "/dev/sdb");
    let config = ConnectorConfig {
        transport: "bnx2i.00:0a".to_string(),
        ..config(false)
    };
    let iscsi = connector(&host, &config);
    assert_eq!(iscsi.transport(), "bnx2i.00:0a");

    let device = iscsi.connect_volume(&single(0)).unwrap();

    assert_eq!(device.path.to_str(), Some(offload));
}

#[test]
fn test_unknown_iface_falls_back_to_default() {
    let host = Arc::new(FakeHost::new());
    host.respond("iscsiadm -m iface -I eth9", "iface.transport_name = tcp\n");
    let config = ConnectorConfig {
        transport: "eth9".to_string(),
        ..config(false)
    };

    assert_eq!(connector(&host, &config).transport(), "default");
}

#[test]
fn test_iser_forces_iser_transport() {
    let host = Arc::new(FakeHost::new());
    let ctx = HostContext::new(host.clone(), host.clone(), Duration::ZERO);
    let iser = IscsiConnector::new(ctx, &config(false), Protocol::Iser);

    assert_eq!(iser.transport(), "iser");
    assert_eq!(iser.protocol(), Protocol::Iser);
    assert!(host.calls().is_empty());
}

#[test]
fn test_get_initiator() {
    let host = Arc::new(FakeHost::new());
    host.respond(
        "cat /etc/iscsi/initiatorname.iscsi",
        "## DO NOT EDIT\nInitiatorName=iqn.1993-08.org.debian:01:abcdef\n",
    );
    let iscsi = connector(&host, &config(false));
    assert_eq!(
        iscsi.get_initiator().as_deref(),
        Some("iqn.1993-08.org.debian:01:abcdef")
    );

    let host = Arc::new(FakeHost::new());
    host.fail("cat", 1);
    assert_eq!(connector(&host, &config(false)).get_initiator(), None);
}
