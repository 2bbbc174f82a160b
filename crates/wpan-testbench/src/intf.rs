//! Interface handles
//!
//! An [`InterfaceHandle`] tracks one interface's name, hardware address and
//! IP address, and pushes configuration to it through its owning node.
//!
//! Link-layer commands follow the `ip` convention of printing nothing on
//! success: methods that mutate the interface return the raw command text,
//! and callers treat non-empty text where none was expected as a failure
//! signal. [`InterfaceHandle::is_up`] with `set_up` is the one place that
//! folds this into a boolean.

use crate::exec::ExecError;
use crate::node::{Node, NodeError, Placement};
use crate::parse;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::debug;

/// Name of the loopback interface
pub const LOOPBACK: &str = "lo";

#[derive(Error, Debug)]
pub enum IntfError {
    #[error("No prefix length set for IP address {ip}")]
    MissingPrefix { ip: String },

    #[error("Invalid prefix length '{prefix}' for IP address {ip}")]
    InvalidPrefix { ip: String, prefix: String },

    #[error("Interface {0} has no owning node")]
    NoOwner(String),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

fn default_up() -> Option<bool> {
    Some(true)
}

/// Optional settings applied by [`InterfaceHandle::config`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntfConfig {
    #[serde(default)]
    pub mac: Option<String>,
    /// Address in `addr/len` form
    #[serde(default)]
    pub ip: Option<String>,
    /// Raw argument for `ip -6 addr add`, applied last
    #[serde(default)]
    pub ip_addr: Option<String>,
    /// `Some(true)` brings the link up, `Some(false)` only queries it
    #[serde(default = "default_up")]
    pub up: Option<bool>,
}

impl Default for IntfConfig {
    fn default() -> Self {
        Self {
            mac: None,
            ip: None,
            ip_addr: None,
            up: default_up(),
        }
    }
}

/// Result of one applied setting
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigResult {
    Output(String),
    Up(bool),
}

/// Setting name to its individual result
pub type ConfigReport = BTreeMap<&'static str, ConfigResult>;

/// Presence of the interface in the node's link table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntfStatus {
    Ok,
    Missing,
}

impl fmt::Display for IntfStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Missing => write!(f, "MISSING"),
        }
    }
}

/// Construction options for [`InterfaceHandle::new`]
#[derive(Clone, Debug, Default)]
pub struct IntfOptions {
    pub port: Option<u32>,
    pub link: Option<String>,
    pub mac: Option<String>,
    pub placement: Placement,
    pub config: IntfConfig,
}

/// Handle on one logical network interface
pub struct InterfaceHandle {
    name: String,
    node: Option<Weak<dyn Node>>,
    port: Option<u32>,
    link: Option<String>,
    mac: Option<String>,
    ip: Option<String>,
    prefix_len: Option<u8>,
    params: IntfConfig,
}

impl InterfaceHandle {
    /// Create the handle, attach it to `node`, then apply `options.config`.
    pub async fn new(
        name: impl Into<String>,
        node: Option<&Arc<dyn Node>>,
        options: IntfOptions,
    ) -> Result<Self, IntfError> {
        let mut intf = Self {
            name: name.into(),
            node: node.map(Arc::downgrade),
            port: None,
            link: options.link,
            mac: options.mac,
            ip: None,
            prefix_len: None,
            params: options.config.clone(),
        };

        // Loopback is always 127.0.0.1/8, no need to ask the node.
        if intf.name == LOOPBACK {
            intf.ip = Some("127.0.0.1".to_string());
            intf.prefix_len = Some(8);
        }

        if let Some(node) = node {
            let port = node
                .add_intf(&intf.name, options.port, options.placement)
                .await?;
            intf.port = Some(port);
        }

        let report = intf.config(&options.config).await?;
        debug!("Configured {}: {:?}", intf.name, report);
        Ok(intf)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> Option<&str> {
        self.ip.as_deref()
    }

    pub fn prefix_len(&self) -> Option<u8> {
        self.prefix_len
    }

    pub fn mac(&self) -> Option<&str> {
        self.mac.as_deref()
    }

    pub fn port(&self) -> Option<u32> {
        self.port
    }

    pub fn link(&self) -> Option<&str> {
        self.link.as_deref()
    }

    /// Settings the handle was constructed with
    pub fn params(&self) -> &IntfConfig {
        &self.params
    }

    /// Owning node, if it is still alive
    pub fn node(&self) -> Option<Arc<dyn Node>> {
        self.node.as_ref().and_then(Weak::upgrade)
    }

    fn owner(&self) -> Result<Arc<dyn Node>, IntfError> {
        self.node().ok_or_else(|| IntfError::NoOwner(self.name.clone()))
    }

    async fn cmd(&self, words: &[&str]) -> Result<String, IntfError> {
        Ok(self.owner()?.cmd(words).await?)
    }

    /// `ip addr show` for this interface
    pub async fn ip_addr_show(&self) -> Result<String, IntfError> {
        self.cmd(&["ip", "addr", "show", &self.name]).await
    }

    /// Replace all addresses with `addr` (IPv6 `addr/len`).
    pub async fn ip_addr_set(&self, addr: &str) -> Result<String, IntfError> {
        self.cmd(&["ip", "addr", "flush", &self.name]).await?;
        self.cmd(&["ip", "-6", "addr", "add", addr, "dev", &self.name])
            .await
    }

    /// `ip link set <name> <args...>`
    pub async fn ip_link(&self, args: &[&str]) -> Result<String, IntfError> {
        let mut words = vec!["ip", "link", "set", self.name.as_str()];
        words.extend_from_slice(args);
        self.cmd(&words).await
    }

    /// Set the address, from `addr/len` or from `addr` plus `prefix_len`.
    pub async fn set_ip(&mut self, ip: &str, prefix_len: Option<u8>) -> Result<String, IntfError> {
        let (addr, len) = match ip.split_once('/') {
            Some((addr, prefix)) => {
                let len = prefix
                    .parse::<u8>()
                    .ok()
                    .filter(|l| *l <= 128)
                    .ok_or_else(|| IntfError::InvalidPrefix {
                        ip: addr.to_string(),
                        prefix: prefix.to_string(),
                    })?;
                (addr, len)
            }
            None => {
                let len = prefix_len.ok_or_else(|| IntfError::MissingPrefix {
                    ip: ip.to_string(),
                })?;
                (ip, len)
            }
        };
        self.owner()?;

        self.ip = Some(addr.to_string());
        self.prefix_len = Some(len);
        self.ip_addr_set(&format!("{}/{}", addr, len)).await
    }

    /// Set the hardware address: down, address, up.
    ///
    /// Returns the three command outputs concatenated.
    pub async fn set_mac(&mut self, mac: &str) -> Result<String, IntfError> {
        self.owner()?;
        self.mac = Some(mac.to_string());
        let mut out = self.ip_link(&["down"]).await?;
        out.push_str(&self.ip_link(&["address", mac]).await?);
        out.push_str(&self.ip_link(&["up"]).await?);
        Ok(out)
    }

    /// Re-read the IPv4 address from the node.
    pub async fn update_ip(&mut self) -> Result<Option<String>, IntfError> {
        // pexec so backgrounded shell output never leaks into the scrape
        let out = self
            .owner()?
            .pexec(&["ip", "addr", "show", &self.name])
            .await?;
        self.store_ipv4(parse::first_ipv4(&out.stdout));
        Ok(self.ip.clone())
    }

    fn store_ipv4(&mut self, scraped: Option<(String, u8)>) {
        let (ip, len) = scraped.unzip();
        self.ip = ip;
        self.prefix_len = len;
    }

    /// Re-read the hardware address from the node.
    pub async fn update_mac(&mut self) -> Result<Option<String>, IntfError> {
        let text = self.ip_addr_show().await?;
        self.mac = parse::first_mac(&text);
        Ok(self.mac.clone())
    }

    /// Re-read both addresses with a single `ip addr show`.
    pub async fn update_addr(&mut self) -> Result<(Option<String>, Option<String>), IntfError> {
        let text = self.ip_addr_show().await?;
        self.store_ipv4(parse::first_ipv4(&text));
        self.mac = parse::first_mac(&text);
        Ok((self.ip.clone(), self.mac.clone()))
    }

    /// Whether the interface is up.
    ///
    /// With `set_up` the link is brought up instead, and the answer is
    /// whether that command stayed silent.
    pub async fn is_up(&self, set_up: bool) -> Result<bool, IntfError> {
        if set_up {
            let out = self
                .owner()?
                .pexec(&["ip", "link", "set", &self.name, "up"])
                .await?;
            if !out.is_quiet() {
                debug!("Setting {} up reported: {}", self.name, out.text().trim());
            }
            Ok(out.is_quiet())
        } else {
            Ok(self.ip_addr_show().await?.contains("UP"))
        }
    }

    /// Rename the interface: down, rename, up. Returns the rename output.
    pub async fn rename(&mut self, new_name: &str) -> Result<String, IntfError> {
        let node = self.owner()?;
        self.ip_link(&["down"]).await?;
        let result = node
            .cmd(&["ip", "link", "set", &self.name, "name", new_name])
            .await?;
        node.rename_intf(&self.name, new_name);
        self.name = new_name.to_string();
        self.ip_link(&["up"]).await?;
        Ok(result)
    }

    /// Apply a bundle of settings in a fixed order.
    ///
    /// Order: IP, MAC, IP again, up/down, raw `ip_addr`. Absent settings
    /// are skipped and left out of the report.
    pub async fn config(&mut self, config: &IntfConfig) -> Result<ConfigReport, IntfError> {
        let mut report = ConfigReport::new();

        if let Some(ip) = &config.ip {
            self.set_ip(ip, None).await?;
        }
        if let Some(mac) = &config.mac {
            let out = self.set_mac(mac).await?;
            report.insert("mac", ConfigResult::Output(out));
        }
        if let Some(ip) = &config.ip {
            let out = self.set_ip(ip, None).await?;
            report.insert("ip", ConfigResult::Output(out));
        }
        if let Some(up) = config.up {
            let up = self.is_up(up).await?;
            report.insert("up", ConfigResult::Up(up));
        }
        if let Some(raw) = &config.ip_addr {
            let out = self.ip_addr_set(raw).await?;
            report.insert("ip_addr", ConfigResult::Output(out));
        }

        Ok(report)
    }

    /// Delete the interface and detach it from its node.
    pub async fn delete(&mut self) -> Result<String, IntfError> {
        let node = self.owner()?;
        let out = node.cmd(&["ip", "link", "del", &self.name]).await?;
        node.del_intf(&self.name);
        self.port = None;
        self.link = None;
        Ok(out)
    }

    /// Whether the interface appears in the node's `ip link show` listing.
    pub async fn status(&self) -> Result<IntfStatus, IntfError> {
        let links = self.owner()?.pexec(&["ip", "link", "show"]).await?;
        if links.stdout.contains(&self.name) {
            Ok(IntfStatus::Ok)
        } else {
            Ok(IntfStatus::Missing)
        }
    }
}

impl fmt::Debug for InterfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterfaceHandle")
            .field("name", &self.name)
            .field("port", &self.port)
            .field("link", &self.link)
            .field("mac", &self.mac)
            .field("ip", &self.ip)
            .field("prefix_len", &self.prefix_len)
            .finish()
    }
}

impl fmt::Display for InterfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
