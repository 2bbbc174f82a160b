//! Testbed and topology configuration
//!
//! Both documents are JSON. Every field has a default, so `{}` is a valid
//! testbed config and a topology only needs its node names.

use crate::link::wpan_name;
use crate::radio::DEFAULT_DEBUGFS_ROOT;
use crate::{Result, TestbenchError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const MAX_IFNAME_LEN: usize = 15;

/// PAN id used when a topology names none
pub const DEFAULT_PAN_ID: &str = "0xbeef";

/// Network default node addresses are drawn from
pub const DEFAULT_IP_BASE: &str = "2001:0:0:0:0:0:0:0/64";

fn default_ip_base() -> String {
    DEFAULT_IP_BASE.to_string()
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_debugfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_DEBUGFS_ROOT)
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_radios() -> u32 {
    1
}

fn default_pan_id() -> String {
    DEFAULT_PAN_ID.to_string()
}

/// Host-side settings of a testbed run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestbedConfig {
    /// Network node addresses are allocated from, `addr/len`
    #[serde(default = "default_ip_base")]
    pub ip_base: String,
    /// Out-of-tree fakelb module loaded with insmod instead of modprobe
    #[serde(default)]
    pub alternative_module: Option<PathBuf>,
    /// Radios are created by someone else; never load or unload modules
    #[serde(default)]
    pub externally_managed: bool,
    /// Directory swept for per-run configuration files on teardown
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    #[serde(default = "default_debugfs_root")]
    pub debugfs_root: PathBuf,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Load one IFB device per radio after provisioning
    #[serde(default)]
    pub load_ifb: bool,
}

impl Default for TestbedConfig {
    fn default() -> Self {
        Self {
            ip_base: default_ip_base(),
            alternative_module: None,
            externally_managed: false,
            artifact_dir: default_artifact_dir(),
            debugfs_root: default_debugfs_root(),
            command_timeout_ms: default_command_timeout_ms(),
            load_ifb: false,
        }
    }
}

impl TestbedConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.ip_base
            .parse::<ipnetwork::IpNetwork>()
            .map_err(|e| {
                TestbenchError::InvalidConfig(format!("Invalid ip_base '{}': {}", self.ip_base, e))
            })?;
        if self.command_timeout_ms == 0 {
            return Err(TestbenchError::InvalidConfig(
                "command_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// One node of a topology
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default = "default_radios")]
    pub radios: u32,
    /// Address in `addr/len` form; allocated from `ip_base` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            radios: default_radios(),
            ip: None,
        }
    }
}

/// Nodes to emulate and the PAN they share
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub nodes: Vec<NodeSpec>,
    #[serde(default = "default_pan_id")]
    pub pan_id: String,
}

impl TopologySpec {
    /// `sta1..staN`, each with `radios` radios
    pub fn stations(count: usize, radios: u32) -> Self {
        Self {
            nodes: (1..=count)
                .map(|i| NodeSpec {
                    radios,
                    ..NodeSpec::new(format!("sta{}", i))
                })
                .collect(),
            pan_id: default_pan_id(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let topology: Self = serde_json::from_str(json)?;
        topology.validate()?;
        Ok(topology)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }

    /// Radios requested across all nodes
    pub fn total_radios(&self) -> u32 {
        self.nodes.iter().map(|n| n.radios).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(TestbenchError::InvalidConfig(
                "No nodes specified".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(TestbenchError::InvalidConfig(
                    "Node name must not be empty".to_string(),
                ));
            }
            if !names.insert(&node.name) {
                return Err(TestbenchError::InvalidConfig(format!(
                    "Duplicate node name: {}",
                    node.name
                )));
            }
            if node.radios == 0 {
                return Err(TestbenchError::InvalidConfig(format!(
                    "Node {} requests no radios",
                    node.name
                )));
            }

            // Longest derived name is either the lowpan device or the last radio
            let last_radio = wpan_name(&node.name, &format!("wpan{}", node.radios - 1));
            let lowpan = wpan_name(&node.name, "lowpan");
            for ifname in [last_radio, lowpan] {
                if ifname.len() > MAX_IFNAME_LEN {
                    return Err(TestbenchError::InvalidConfig(format!(
                        "Interface name {} exceeds {} bytes",
                        ifname, MAX_IFNAME_LEN
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testbed_defaults() {
        let config = TestbedConfig::from_json("{}").unwrap();
        assert_eq!(config, TestbedConfig::default());
        assert_eq!(config.ip_base, "2001:0:0:0:0:0:0:0/64");
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.debugfs_root, PathBuf::from("/sys/kernel/debug/ieee80211"));
    }

    #[test]
    fn test_testbed_rejects_bad_values() {
        assert!(matches!(
            TestbedConfig::from_json(r#"{"ip_base": "not-a-network"}"#),
            Err(TestbenchError::InvalidConfig(_))
        ));
        assert!(matches!(
            TestbedConfig::from_json(r#"{"command_timeout_ms": 0}"#),
            Err(TestbenchError::InvalidConfig(_))
        ));
        assert!(matches!(
            TestbedConfig::from_json("{"),
            Err(TestbenchError::Json(_))
        ));
    }

    #[test]
    fn test_topology_defaults() {
        let topology =
            TopologySpec::from_json(r#"{"nodes": [{"name": "sta1"}, {"name": "sta2", "radios": 2, "ip": "2001::9/64"}]}"#)
                .unwrap();
        assert_eq!(topology.pan_id, "0xbeef");
        assert_eq!(topology.nodes[0].radios, 1);
        assert_eq!(topology.nodes[1].ip.as_deref(), Some("2001::9/64"));
        assert_eq!(topology.total_radios(), 3);
    }

    #[test]
    fn test_topology_validation() {
        let invalid = [
            r#"{"nodes": []}"#,
            r#"{"nodes": [{"name": "sta1"}, {"name": "sta1"}]}"#,
            r#"{"nodes": [{"name": "sta1", "radios": 0}]}"#,
            // sta-very-long-lowpan is 20 bytes
            r#"{"nodes": [{"name": "sta-very-long"}]}"#,
            r#"{"nodes": [{"name": ""}]}"#,
        ];
        for json in invalid {
            assert!(
                matches!(TopologySpec::from_json(json), Err(TestbenchError::InvalidConfig(_))),
                "accepted {}",
                json
            );
        }

        // station1-lowpan is exactly 15 bytes
        assert!(TopologySpec::from_json(r#"{"nodes": [{"name": "station1"}]}"#).is_ok());
    }

    #[test]
    fn test_stations() {
        let topology = TopologySpec::stations(3, 2);
        let names: Vec<_> = topology.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["sta1", "sta2", "sta3"]);
        assert_eq!(topology.total_radios(), 6);
        assert!(topology.validate().is_ok());
    }

    #[tokio::test]
    async fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("topology.json");
        std::fs::write(&path, r#"{"nodes": [{"name": "sta1"}], "pan_id": "0x1234"}"#).unwrap();

        let topology = TopologySpec::from_file(&path).await.unwrap();
        assert_eq!(topology.pan_id, "0x1234");

        assert!(matches!(
            TopologySpec::from_file(dir.path().join("missing.json")).await,
            Err(TestbenchError::Io(_))
        ));
    }
}
