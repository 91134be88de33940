//! Connection properties handed over by the storage backend.
//!
//! The descriptor is an untrusted JSON object. Nothing is validated up
//! front; each accessor checks the fields it needs at the point of use and
//! reports [`ConnectorError::InvalidProperties`] when they are missing or
//! malformed.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ConnectorError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionProperties(Map<String, Value>);

/// One path to an iSCSI volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IscsiTarget {
    pub portal: String,
    pub iqn: String,
    pub lun: u64,
}

impl IscsiTarget {
    pub fn new(portal: impl Into<String>, iqn: impl Into<String>, lun: u64) -> Self {
        Self {
            portal: portal.into(),
            iqn: iqn.into(),
            lun,
        }
    }
}

pub(crate) fn strip_tpgt(portal: &str) -> &str {
    portal.split(',').next().unwrap_or(portal)
}

/// CHAP credentials for a node session or a discovery record.
#[derive(Clone, PartialEq, Eq)]
pub struct ChapAuth {
    pub method: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ChapAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChapAuth")
            .field("method", &self.method)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

fn invalid(msg: impl Into<String>) -> ConnectorError {
    ConnectorError::InvalidProperties(msg.into())
}

fn lun_from_value(key: &str, value: &Value) -> Result<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| invalid(format!("{} must be a non-negative integer, got {}", key, n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| invalid(format!("{} must be an integer, got '{}'", key, s))),
        other => Err(invalid(format!("{} must be an integer, got {}", key, other))),
    }
}

fn string_from_value(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(invalid(format!("{} must be a string, got {}", key, other))),
    }
}

impl ConnectionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(invalid(format!(
                "connection properties must be an object, got {}",
                other
            ))),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// String field; `None` when absent or not a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        match self.0.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(invalid(format!("{} must be a string, got {}", key, other))),
            None => Err(invalid(format!("missing required field {}", key))),
        }
    }

    fn require_array(&self, key: &str) -> Result<&Vec<Value>> {
        match self.0.get(key) {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(invalid(format!("{} must be a list, got {}", key, other))),
            None => Err(invalid(format!("missing required field {}", key))),
        }
    }

    fn string_list(&self, key: &str) -> Result<Vec<String>> {
        self.require_array(key)?
            .iter()
            .map(|value| string_from_value(key, value))
            .collect()
    }

    /// `target_lun`, defaulting to 0.
    pub fn target_lun(&self) -> Result<u64> {
        match self.0.get("target_lun") {
            None | Some(Value::Null) => Ok(0),
            Some(value) => lun_from_value("target_lun", value),
        }
    }

    pub fn target_portal(&self) -> Result<&str> {
        self.require_str("target_portal")
    }

    pub fn target_iqn(&self) -> Result<&str> {
        self.require_str("target_iqn")
    }

    /// True when the backend supplied a non-empty `target_iqns` list.
    pub fn has_target_iqns(&self) -> bool {
        matches!(self.0.get("target_iqns"), Some(Value::Array(items)) if !items.is_empty())
    }

    /// Every target of the volume, in the order the backend listed them.
    ///
    /// Uses the parallel `target_portals`/`target_iqns`/`target_luns` lists
    /// when all three are present (they must be of equal length), otherwise
    /// the singular fields.
    pub fn iscsi_targets(&self) -> Result<Vec<IscsiTarget>> {
        if self.contains("target_portals")
            && self.contains("target_iqns")
            && self.contains("target_luns")
        {
            let portals = self.string_list("target_portals")?;
            let iqns = self.string_list("target_iqns")?;
            let luns = self.require_array("target_luns")?;
            if portals.len() != iqns.len() || portals.len() != luns.len() {
                return Err(invalid(format!(
                    "target_portals ({}), target_iqns ({}) and target_luns ({}) differ in length",
                    portals.len(),
                    iqns.len(),
                    luns.len()
                )));
            }
            return portals
                .into_iter()
                .zip(iqns)
                .zip(luns)
                .map(|((portal, iqn), lun)| -> Result<IscsiTarget> {
                    Ok(IscsiTarget::new(portal, iqn, lun_from_value("target_luns", lun)?))
                })
                .collect();
        }

        Ok(vec![IscsiTarget::new(
            self.target_portal()?,
            self.target_iqn()?,
            self.target_lun()?,
        )])
    }

    /// `(portal, iqn)` pairs given explicitly by the backend, if any.
    pub fn given_portals(&self) -> Result<Option<Vec<(String, String)>>> {
        if !(self.contains("target_portals") && self.contains("target_iqns")) {
            return Ok(None);
        }
        let portals = self.string_list("target_portals")?;
        let iqns = self.string_list("target_iqns")?;
        if portals.len() != iqns.len() {
            return Err(invalid(format!(
                "target_portals ({}) and target_iqns ({}) differ in length",
                portals.len(),
                iqns.len()
            )));
        }
        Ok(Some(portals.into_iter().zip(iqns).collect()))
    }

    fn chap(&self, prefix: &str) -> Result<Option<ChapAuth>> {
        let method_key = format!("{}_method", prefix);
        let Some(method) = self.get_str(&method_key).filter(|m| !m.is_empty()) else {
            return Ok(None);
        };
        Ok(Some(ChapAuth {
            method: method.to_string(),
            username: self.require_str(&format!("{}_username", prefix))?.to_string(),
            password: self.require_str(&format!("{}_password", prefix))?.to_string(),
        }))
    }

    /// Node session CHAP (`auth_method`, `auth_username`, `auth_password`).
    pub fn session_auth(&self) -> Result<Option<ChapAuth>> {
        self.chap("auth")
    }

    /// Send-targets discovery CHAP (`discovery_auth_*`).
    pub fn discovery_auth(&self) -> Result<Option<ChapAuth>> {
        self.chap("discovery_auth")
    }

    /// `target_wwn`, given either as one string or a list of strings.
    pub fn target_wwns(&self) -> Result<Vec<String>> {
        match self.0.get("target_wwn") {
            Some(Value::String(wwn)) => Ok(vec![wwn.clone()]),
            Some(Value::Array(_)) => self.string_list("target_wwn"),
            Some(other) => Err(invalid(format!(
                "target_wwn must be a string or a list, got {}",
                other
            ))),
            None => Err(invalid("missing required field target_wwn")),
        }
    }

    /// `access_mode`, e.g. `rw` or `ro`.
    pub fn access_mode(&self) -> Option<&str> {
        self.get_str("access_mode")
    }

    pub fn is_read_only(&self) -> bool {
        self.access_mode() == Some("ro")
    }
}

impl TryFrom<Value> for ConnectionProperties {
    type Error = ConnectorError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn props(value: Value) -> ConnectionProperties {
        ConnectionProperties::from_value(value).unwrap()
    }

    #[test]
    fn test_singular_target() {
        let p = props(json!({
            "target_portal": "10.0.0.5:3260",
            "target_iqn": "iqn.2010-x:vol1",
            "target_lun": 0
        }));
        assert_eq!(
            p.iscsi_targets().unwrap(),
            vec![IscsiTarget::new("10.0.0.5:3260", "iqn.2010-x:vol1", 0)]
        );
    }

    #[test]
    fn test_lun_defaults_and_strings() {
        let p = props(json!({"target_portal": "10.0.0.5:3260", "target_iqn": "iqn.2010-x:vol1"}));
        assert_eq!(p.target_lun().unwrap(), 0);

        let p = props(json!({"target_lun": "7"}));
        assert_eq!(p.target_lun().unwrap(), 7);

        let p = props(json!({"target_lun": -1}));
        assert!(matches!(p.target_lun(), Err(ConnectorError::InvalidProperties(_))));
    }

    #[test]
    fn test_plural_targets() {
        let p = props(json!({
            "target_portal": "10.0.0.5:3260",
            "target_iqn": "iqn.2010-x:vol1",
            "target_portals": ["10.0.0.5:3260", "10.0.0.6:3260"],
            "target_iqns": ["iqn.2010-x:vol1", "iqn.2010-x:vol2"],
            "target_luns": [1, "2"]
        }));
        let targets = p.iscsi_targets().unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[1], IscsiTarget::new("10.0.0.6:3260", "iqn.2010-x:vol2", 2));
        assert!(p.has_target_iqns());
        assert_eq!(p.given_portals().unwrap().unwrap().len(), 2);
    }

    #[test]
    fn test_plural_length_mismatch() {
        let p = props(json!({
            "target_portals": ["10.0.0.5:3260", "10.0.0.6:3260"],
            "target_iqns": ["iqn.2010-x:vol1"],
            "target_luns": [1, 2]
        }));
        assert!(matches!(
            p.iscsi_targets(),
            Err(ConnectorError::InvalidProperties(_))
        ));
        assert!(p.given_portals().is_err());
    }

    #[test]
    fn test_missing_singular_fields() {
        let p = props(json!({"target_portal": "10.0.0.5:3260"}));
        let err = p.iscsi_targets().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid connection properties: missing required field target_iqn"
        );
        assert!(!p.has_target_iqns());
        assert!(p.given_portals().unwrap().is_none());
    }

    #[test]
    fn test_chap() {
        let p = props(json!({
            "auth_method": "CHAP",
            "auth_username": "user",
            "auth_password": "secret"
        }));
        let auth = p.session_auth().unwrap().unwrap();
        assert_eq!(auth.username, "user");
        assert!(!format!("{:?}", auth).contains("secret"));
        assert!(p.discovery_auth().unwrap().is_none());

        let p = props(json!({"discovery_auth_method": "CHAP"}));
        assert!(p.discovery_auth().is_err());
    }

    #[test]
    fn test_target_wwns() {
        let p = props(json!({"target_wwn": "5000ABC1"}));
        assert_eq!(p.target_wwns().unwrap(), vec!["5000ABC1"]);

        let p = props(json!({"target_wwn": ["5000abc1", "5000abc2"], "access_mode": "ro"}));
        assert_eq!(p.target_wwns().unwrap(), vec!["5000abc1", "5000abc2"]);
        assert!(p.is_read_only());

        assert!(props(json!({})).target_wwns().is_err());
        assert!(props(json!({"target_wwn": 5})).target_wwns().is_err());
    }

    #[test]
    fn test_not_an_object() {
        assert!(ConnectionProperties::try_from(json!(["target_portal"])).is_err());
    }

    #[test]
    fn test_strip_tpgt() {
        assert_eq!(strip_tpgt("10.0.0.5:3260,1"), "10.0.0.5:3260");
        assert_eq!(strip_tpgt("10.0.0.5:3260"), "10.0.0.5:3260");
    }
}
