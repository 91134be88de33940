use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectorError, Result};

/// Volume attachment protocols a backend can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Iscsi,
    Iser,
    FibreChannel,
    Aoe,
    Nfs,
    Glusterfs,
    Storpool,
    Local,
    Huaweisdshypervisor,
    Hgst,
    Rbd,
    Scaleio,
    Scality,
}

impl Protocol {
    pub const ALL: [Protocol; 13] = [
        Protocol::Iscsi,
        Protocol::Iser,
        Protocol::FibreChannel,
        Protocol::Aoe,
        Protocol::Nfs,
        Protocol::Glusterfs,
        Protocol::Storpool,
        Protocol::Local,
        Protocol::Huaweisdshypervisor,
        Protocol::Hgst,
        Protocol::Rbd,
        Protocol::Scaleio,
        Protocol::Scality,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Iscsi => "ISCSI",
            Protocol::Iser => "ISER",
            Protocol::FibreChannel => "FIBRE_CHANNEL",
            Protocol::Aoe => "AOE",
            Protocol::Nfs => "NFS",
            Protocol::Glusterfs => "GLUSTERFS",
            Protocol::Storpool => "STORPOOL",
            Protocol::Local => "LOCAL",
            Protocol::Huaweisdshypervisor => "HUAWEISDSHYPERVISOR",
            Protocol::Hgst => "HGST",
            Protocol::Rbd => "RBD",
            Protocol::Scaleio => "SCALEIO",
            Protocol::Scality => "SCALITY",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_uppercase();
        Protocol::ALL
            .into_iter()
            .find(|protocol| protocol.as_str() == upper)
            .ok_or_else(|| ConnectorError::InvalidProtocol(s.to_string()))
    }
}
