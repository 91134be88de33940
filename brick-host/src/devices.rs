//! Read-only view of the host device tree.
//!
//! Candidate device paths are predictions; their existence under
//! `/dev/disk/by-path` is the only confirmation that a volume has attached.
//! The tree is read fresh on every call, nothing is cached.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

/// Stable iSCSI/FC device naming directory.
pub const BY_PATH_DIR: &str = "/dev/disk/by-path";

/// Multipath alias directory.
pub const MAPPER_DIR: &str = "/dev/mapper";

pub trait DeviceTree: Send + Sync {
    /// Whether `path` currently exists (following symlinks).
    fn exists(&self, path: &Path) -> bool;

    /// Symlink-resolved path, or `path` itself when it cannot be resolved.
    fn realpath(&self, path: &Path) -> PathBuf;

    /// Paths matching a shell glob pattern, in sorted order.
    fn glob(&self, pattern: &str) -> Vec<PathBuf>;

    /// Entry names of a directory; empty when it does not exist.
    fn list_dir(&self, dir: &Path) -> Vec<String>;
}

/// The live device tree of this host.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxDeviceTree;

impl DeviceTree for LinuxDeviceTree {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn realpath(&self, path: &Path) -> PathBuf {
        fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
    }

    fn glob(&self, pattern: &str) -> Vec<PathBuf> {
        match glob::glob(pattern) {
            Ok(paths) => {
                let mut found: Vec<PathBuf> = paths.flatten().collect();
                found.sort();
                found
            }
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid device glob pattern");
                Vec::new()
            }
        }
    }

    fn list_dir(&self, dir: &Path) -> Vec<String> {
        let Ok(entries) = fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }
}

/// Kernel device name for a path, e.g. `/dev/sdb` -> `sdb`.
pub fn kernel_name(path: &Path) -> Option<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    #[test]
    fn test_linux_tree_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sdb");
        fs::write(&target, b"").unwrap();
        let link = dir.path().join("ip-10.0.0.5:3260-iscsi-iqn.2010-x:vol1-lun-0");
        symlink(&target, &link).unwrap();

        let tree = LinuxDeviceTree;
        assert!(tree.exists(&link));
        assert_eq!(tree.realpath(&link), fs::canonicalize(&target).unwrap());
        assert_eq!(
            tree.list_dir(dir.path()),
            vec![
                "ip-10.0.0.5:3260-iscsi-iqn.2010-x:vol1-lun-0".to_string(),
                "sdb".to_string()
            ]
        );
    }

    #[test]
    fn test_linux_tree_glob_tolerates_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let name = "pci-0000:05:00.2-ip-10.0.0.5:3260-iscsi-iqn.2010-x:vol1-lun-1";
        fs::write(dir.path().join(name), b"").unwrap();

        let pattern = format!(
            "{}/*ip-10.0.0.5:3260-iscsi-iqn.2010-x:vol1-lun-1",
            dir.path().display()
        );
        assert_eq!(LinuxDeviceTree.glob(&pattern), vec![dir.path().join(name)]);
    }

    #[test]
    fn test_missing_paths() {
        let tree = LinuxDeviceTree;
        let missing = Path::new("/nonexistent/brick/device");
        assert!(!tree.exists(missing));
        assert_eq!(tree.realpath(missing), missing.to_path_buf());
        assert!(tree.list_dir(missing).is_empty());
    }

    #[test]
    fn test_kernel_name() {
        assert_eq!(kernel_name(Path::new("/dev/sdb")), Some("sdb".to_string()));
        assert_eq!(kernel_name(Path::new("/")), None);
    }
}
