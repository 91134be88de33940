//! Parsers for `multipath -ll` / `multipath -l` output.
//!
//! The tool interleaves syslog-style noise (`Oct 19 10:01:02 | ...`) with its
//! topology listing, so every parser drops noise lines before reading maps.
//! A map header looks like
//!
//! ```text
//! mpathb (36e00000000010001) dm-4 IET,VIRTUAL-DISK
//! ```
//!
//! or, without friendly names, `36e00000000010001 dm-4 IET,VIRTUAL-DISK`.
//! Member paths carry an `H:C:T:L` address followed by the kernel name:
//!
//! ```text
//! | `- 2:0:0:1 sda 8:0 active undef running
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::devices::MAPPER_DIR;

static NOISE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\w{3} +\d+ \d\d:\d\d:\d\d \|.*$").expect("valid multipath noise pattern")
});

static DEV_CHECK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+dm-\d+\s+").expect("valid multipath map pattern"));

static PATH_CHECK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s+(\d+):(\d+):(\d+):(\d+)\s+(\S+)").expect("valid multipath path pattern")
});

/// True for log/error lines the multipath tool mixes into its listing.
pub fn is_noise_line(line: &str) -> bool {
    NOISE_LINE.is_match(line)
}

fn topology_lines(output: &str) -> impl Iterator<Item = &str> {
    output.lines().filter(|line| !is_noise_line(line))
}

/// Mapping from single-path block device (`/dev/sdX`) to the multipath
/// device (`/dev/mapper/<alias>`) that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipathMap {
    paths: HashMap<PathBuf, PathBuf>,
}

impl MultipathMap {
    /// Build the map from a full `multipath -ll` listing.
    pub fn parse(output: &str) -> Self {
        let mut paths = HashMap::new();
        let mut current: Option<PathBuf> = None;

        for line in topology_lines(output) {
            if let Some(alias) = map_header_alias(line) {
                current = Some(Path::new(MAPPER_DIR).join(alias));
                continue;
            }
            if let Some(caps) = PATH_CHECK.captures(line)
                && let Some(mpath) = &current
            {
                paths.insert(Path::new("/dev").join(&caps[5]), mpath.clone());
            }
        }

        Self { paths }
    }

    /// Multipath device owning `device`, if any.
    pub fn get(&self, device: &Path) -> Option<&Path> {
        self.paths.get(device).map(PathBuf::as_path)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}

/// Alias of a map header line (`mpathb (wwid) dm-4 ...` -> `mpathb`).
fn map_header_alias(line: &str) -> Option<&str> {
    let m = DEV_CHECK.find(line)?;
    line[..m.start()].split_whitespace().next()
}

/// Alias owning the device listed by `multipath -ll <device>`.
///
/// The first non-noise line of a per-device listing is the map header; an
/// empty listing means the device is not part of any map.
pub fn first_alias(output: &str) -> Option<String> {
    let header = topology_lines(output).next()?;
    let alias = header.split(' ').next()?;
    if alias.is_empty() {
        return None;
    }
    Some(alias.to_string())
}

/// One member path of a multipath device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultipathMember {
    pub device: PathBuf,
    pub host: u32,
    pub channel: u32,
    pub id: u32,
    pub lun: u32,
}

/// A multipath device as reported by `multipath -l <device>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MultipathDevice {
    /// `/dev/mapper/<name>`
    pub device: PathBuf,
    /// WWID of the map.
    pub id: String,
    pub name: String,
    pub devices: Vec<MultipathMember>,
}

/// Parse a single map listing into a [`MultipathDevice`].
pub fn parse_device(output: &str) -> Option<MultipathDevice> {
    let mut lines = topology_lines(output);
    let header = lines.find(|line| DEV_CHECK.is_match(line))?;

    let mut tokens = header.split_whitespace();
    let name = tokens.next()?.to_string();
    let id = match tokens.next() {
        Some(token) if token.starts_with('(') && token.ends_with(')') => {
            token.trim_matches(|c| c == '(' || c == ')').to_string()
        }
        _ => name.clone(),
    };

    let devices = lines
        .take_while(|line| !DEV_CHECK.is_match(line))
        .filter_map(|line| {
            let caps = PATH_CHECK.captures(line)?;
            Some(MultipathMember {
                device: Path::new("/dev").join(&caps[5]),
                host: caps[1].parse().ok()?,
                channel: caps[2].parse().ok()?,
                id: caps[3].parse().ok()?,
                lun: caps[4].parse().ok()?,
            })
        })
        .collect();

    Some(MultipathDevice {
        device: Path::new(MAPPER_DIR).join(&name),
        id,
        name,
        devices,
    })
}
