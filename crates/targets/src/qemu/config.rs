//! QEMU target configuration
//!
//! Loaded from a JSON file. Unknown keys are rejected.
//!
//! ```json
//! {
//!     "networks": [{ "name": "lo", "ip_address": "127.0.0.1", "gateway": "127.0.0.1" }],
//!     "ssh_port": 2222,
//!     "qemu_num_cores": 2,
//!     "qemu_ram_size": "1G",
//!     "port_forwarding": [{ "host_port": 2222, "guest_port": 22 }]
//! }
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::info;

use itf_common::{Error, Result};

const RAM_SIZE_PATTERN: &str = r"^[0-9]+[KMGTP]$";

/// Network adapter name selecting user-mode networking with port forwarding
pub const LOOPBACK_ADAPTER: &str = "lo";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QemuNetwork {
    /// Host adapter: a tap interface, or `lo` for user-mode networking
    pub name: String,
    pub ip_address: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortForward {
    pub host_port: u16,
    pub guest_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QemuConfig {
    pub networks: Vec<QemuNetwork>,
    pub ssh_port: u16,
    pub qemu_num_cores: u32,
    pub qemu_ram_size: String,
    #[serde(default)]
    pub port_forwarding: Vec<PortForward>,
}

impl QemuConfig {
    /// Load and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|e| {
            Error::InvalidConfig(format!(
                "invalid QEMU configuration in '{}': {}",
                path.display(),
                e
            ))
        })
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            return Err(Error::InvalidConfig("networks: at least one entry required".into()));
        }
        if let Some(network) = self.networks.iter().find(|n| n.name.is_empty()) {
            return Err(Error::InvalidConfig(format!(
                "networks: empty name for {}",
                network.ip_address
            )));
        }
        if self.ssh_port == 0 {
            return Err(Error::InvalidConfig("ssh_port must be in 1..65535".into()));
        }
        if self.qemu_num_cores == 0 {
            return Err(Error::InvalidConfig("qemu_num_cores must be at least 1".into()));
        }
        let ram = Regex::new(RAM_SIZE_PATTERN).map_err(|e| Error::Internal(e.to_string()))?;
        if !ram.is_match(&self.qemu_ram_size) {
            return Err(Error::InvalidConfig(format!(
                "qemu_ram_size '{}' does not match {}",
                self.qemu_ram_size, RAM_SIZE_PATTERN
            )));
        }
        if let Some(forward) = self
            .port_forwarding
            .iter()
            .find(|f| f.host_port == 0 || f.guest_port == 0)
        {
            return Err(Error::InvalidConfig(format!(
                "port_forwarding: ports must be in 1..65535, got {}->{}",
                forward.host_port, forward.guest_port
            )));
        }
        Ok(())
    }

    /// Network used for SSH and ping
    pub fn primary_network(&self) -> Option<&QemuNetwork> {
        self.networks.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    const BRIDGE: &str = r#"{
        "networks": [
            { "name": "tap0", "ip_address": "169.254.158.190", "gateway": "169.254.21.88" }
        ],
        "ssh_port": 22,
        "qemu_num_cores": 2,
        "qemu_ram_size": "1G"
    }"#;

    const PORT_FORWARDING: &str = r#"{
        "networks": [
            { "name": "lo", "ip_address": "127.0.0.1", "gateway": "127.0.0.1" }
        ],
        "ssh_port": 2222,
        "qemu_num_cores": 2,
        "qemu_ram_size": "1G",
        "port_forwarding": [{ "host_port": 2222, "guest_port": 22 }]
    }"#;

    #[test]
    fn test_sample_configs_validate() {
        let bridge = QemuConfig::from_json(BRIDGE).unwrap();
        assert_eq!(bridge.networks[0].name, "tap0");
        assert!(bridge.port_forwarding.is_empty());

        let forwarding = QemuConfig::from_json(PORT_FORWARDING).unwrap();
        assert_eq!(
            forwarding.port_forwarding,
            vec![PortForward { host_port: 2222, guest_port: 22 }]
        );
        assert_eq!(
            forwarding.primary_network().unwrap().ip_address,
            Ipv4Addr::LOCALHOST
        );
    }

    /// The bridge sample with `key` replaced by `value`, or removed when `value` is `None`
    fn bridge_with(key: &str, value: Option<&str>) -> String {
        let mut config: serde_json::Value = serde_json::from_str(BRIDGE).unwrap();
        let fields = config.as_object_mut().unwrap();
        match value {
            Some(value) => fields.insert(key.to_string(), serde_json::from_str(value).unwrap()),
            None => fields.remove(key),
        };
        config.to_string()
    }

    #[test_case("networks", None ; "missing networks")]
    #[test_case("networks", Some("[]") ; "empty networks")]
    #[test_case(
        "networks",
        Some(r#"[{"name": "tap0", "ip_address": "::1", "gateway": "10.0.0.1"}]"#) ;
        "ipv6 address"
    )]
    #[test_case("ssh_port", Some("0") ; "port zero")]
    #[test_case("ssh_port", Some("70000") ; "port too large")]
    #[test_case("qemu_num_cores", Some("0") ; "no cores")]
    #[test_case("qemu_ram_size", Some(r#""1GB""#) ; "ram suffix")]
    #[test_case("extra", Some("1") ; "unknown key")]
    #[test_case(
        "port_forwarding",
        Some(r#"[{"host_port": 0, "guest_port": 22}]"#) ;
        "forward port zero"
    )]
    fn test_invalid_config_is_rejected(key: &str, value: Option<&str>) {
        assert!(matches!(
            QemuConfig::from_json(&bridge_with(key, value)),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qemu_invalid.json");
        std::fs::write(&path, r#"{"ssh_port": 22}"#).unwrap();

        match QemuConfig::load(&path) {
            Err(Error::InvalidConfig(msg)) => assert!(msg.contains("qemu_invalid.json")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
