//! 6LoWPAN link establishment
//!
//! A [`SixLowpanLink`] prepares a node's primary radio, stacks a `lowpan`
//! device on top of it and wraps that device in an [`InterfaceHandle`].
//! The far end lives in the kernel's 6LoWPAN adaptation layer, so it is
//! recorded as a symbolic tag rather than a second handle.

use crate::exec::ExecError;
use crate::intf::{IntfConfig, IntfError, IntfOptions, InterfaceHandle, LOOPBACK};
use crate::node::{Node, Placement};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Tag recorded as the partner end of every 6LoWPAN link
pub const LOWPAN_PARTNER: &str = "6LoWPAN";

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Node {node} has no {param} for a 6LoWPAN link")]
    MissingParameter { node: String, param: &'static str },

    #[error("Interface error: {0}")]
    Intf(#[from] IntfError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

/// Canonical name of a node-derived interface: `<node>-<suffix>`.
pub fn wpan_name(node: &str, suffix: &str) -> String {
    format!("{}-{}", node, suffix)
}

/// Options for [`SixLowpanLink::establish`]
#[derive(Clone, Debug, Default)]
pub struct LinkOptions {
    /// Port for the lowpan interface, next free one when absent
    pub port: Option<u32>,
    pub mac: Option<String>,
    /// PAN id, falling back to the node's `pan_id` parameter
    pub pan_id: Option<String>,
    /// Settings for the lowpan interface; `ip` is overridden by the
    /// node's primary address
    pub config: IntfConfig,
}

/// A node's 6LoWPAN link: the lowpan interface and its symbolic partner
#[derive(Debug)]
pub struct SixLowpanLink {
    intf: InterfaceHandle,
    partner: &'static str,
}

impl SixLowpanLink {
    /// Bring up a 6LoWPAN link on `node`'s first radio.
    ///
    /// Steps run in a fixed order and are not rolled back if a later one
    /// fails.
    pub async fn establish(node: &Arc<dyn Node>, options: LinkOptions) -> Result<Self, LinkError> {
        let name = node.name().to_string();
        let missing = |param| LinkError::MissingParameter {
            node: name.clone(),
            param,
        };

        let params = node.params();
        let wlan = params.wlan.first().cloned().ok_or_else(|| missing("radio"))?;
        let pan_id = options
            .pan_id
            .clone()
            .or_else(|| params.pan_id.clone())
            .ok_or_else(|| missing("panid"))?;
        let ip = params.ip.first().cloned().ok_or_else(|| missing("IP address"))?;
        let lowpan = wpan_name(&name, "lowpan");

        debug!("Establishing 6LoWPAN link {} on {} (pan {})", lowpan, wlan, pan_id);
        let (wlan, pan, lp) = (wlan.as_str(), pan_id.as_str(), lowpan.as_str());
        let steps: [Vec<&str>; 6] = [
            vec!["ip", "link", "set", LOOPBACK, "up"],
            vec!["ip", "link", "set", wlan, "down"],
            vec!["iwpan", "dev", wlan, "set", "pan_id", pan],
            vec!["ip", "link", "add", "link", wlan, "name", lp, "type", "lowpan"],
            vec!["ip", "link", "set", wlan, "up"],
            vec!["ip", "link", "set", lp, "up"],
        ];
        for words in &steps {
            let out = node.cmd(words).await?;
            if !out.is_empty() {
                debug!("{}: `{}` reported: {}", name, words.join(" "), out.trim());
            }
        }

        let port = options.port.unwrap_or_else(|| node.new_port());
        let config = IntfConfig {
            ip: Some(ip),
            ..options.config
        };
        let intf = InterfaceHandle::new(
            lowpan.clone(),
            Some(node),
            IntfOptions {
                port: Some(port),
                link: Some(LOWPAN_PARTNER.to_string()),
                mac: options.mac,
                placement: Placement::InPlace,
                config,
            },
        )
        .await?;

        info!("6LoWPAN link up on {}: {}", name, intf);
        Ok(Self {
            intf,
            partner: LOWPAN_PARTNER,
        })
    }

    pub fn intf(&self) -> &InterfaceHandle {
        &self.intf
    }

    pub fn intf_mut(&mut self) -> &mut InterfaceHandle {
        &mut self.intf
    }

    pub fn partner(&self) -> &str {
        self.partner
    }

    /// Both ends: the lowpan interface and the partner tag
    pub fn ends(&self) -> (&InterfaceHandle, &str) {
        (&self.intf, self.partner)
    }

    /// Delete the lowpan interface.
    pub async fn delete(&mut self) -> Result<String, LinkError> {
        Ok(self.intf.delete().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Isolation, NodeParams, WirelessNode};
    use crate::testing::ScriptedBackend;

    fn sta1(backend: &Arc<ScriptedBackend>, params: NodeParams) -> Arc<dyn Node> {
        Arc::new(WirelessNode::new(
            "sta1",
            Isolation::Named("sta1".into()),
            params,
            backend.clone(),
        ))
    }

    fn radio_params() -> NodeParams {
        NodeParams {
            wlan: vec!["sta1-wpan0".into()],
            ip: vec!["2001::1/64".into()],
            pan_id: Some("0xbeef".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_wpan_name() {
        assert_eq!(wpan_name("sta1", "lowpan"), "sta1-lowpan");
        assert_eq!(wpan_name("ap1", "wpan0"), "ap1-wpan0");
    }

    #[tokio::test]
    async fn test_establish_step_order() {
        let backend = ScriptedBackend::new();
        let node = sta1(&backend, radio_params());

        let link = SixLowpanLink::establish(&node, LinkOptions::default())
            .await
            .unwrap();

        let calls: Vec<String> = backend
            .calls()
            .into_iter()
            .map(|c| c.trim_start_matches("ip netns exec sta1 ").to_string())
            .collect();
        assert_eq!(
            calls,
            vec![
                "ip link set lo up",
                "ip link set sta1-wpan0 down",
                "iwpan dev sta1-wpan0 set pan_id 0xbeef",
                "ip link add link sta1-wpan0 name sta1-lowpan type lowpan",
                "ip link set sta1-wpan0 up",
                "ip link set sta1-lowpan up",
                // Handle configuration: IP twice, then up
                "ip addr flush sta1-lowpan",
                "ip -6 addr add 2001::1/64 dev sta1-lowpan",
                "ip addr flush sta1-lowpan",
                "ip -6 addr add 2001::1/64 dev sta1-lowpan",
                "ip link set sta1-lowpan up",
            ]
        );

        let (intf, partner) = link.ends();
        assert_eq!(intf.name(), "sta1-lowpan");
        assert_eq!(intf.ip(), Some("2001::1"));
        assert_eq!(intf.prefix_len(), Some(64));
        assert_eq!(intf.link(), Some(LOWPAN_PARTNER));
        assert_eq!(partner, "6LoWPAN");
        assert_eq!(node.interfaces(), vec![(0, "sta1-lowpan".to_string())]);
    }

    #[tokio::test]
    async fn test_explicit_port_and_pan_id() {
        let backend = ScriptedBackend::new();
        let node = sta1(&backend, radio_params());

        let link = SixLowpanLink::establish(
            &node,
            LinkOptions {
                port: Some(7),
                pan_id: Some("0x1234".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(link.intf().port(), Some(7));
        assert_eq!(
            backend.calls_matching("pan_id"),
            vec!["ip netns exec sta1 iwpan dev sta1-wpan0 set pan_id 0x1234"]
        );
    }

    #[tokio::test]
    async fn test_node_ip_overrides_config_ip() {
        let backend = ScriptedBackend::new();
        let node = sta1(&backend, radio_params());

        let link = SixLowpanLink::establish(
            &node,
            LinkOptions {
                config: IntfConfig {
                    ip: Some("2001::99/64".into()),
                    up: None,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(link.intf().ip(), Some("2001::1"));
        assert!(backend.calls_matching("2001::99").is_empty());
    }

    #[tokio::test]
    async fn test_missing_parameters() {
        let backend = ScriptedBackend::new();

        let no_pan = sta1(
            &backend,
            NodeParams {
                pan_id: None,
                ..radio_params()
            },
        );
        let err = SixLowpanLink::establish(&no_pan, LinkOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::MissingParameter { param: "panid", .. }));

        let no_radio = sta1(
            &backend,
            NodeParams {
                wlan: Vec::new(),
                ..radio_params()
            },
        );
        let err = SixLowpanLink::establish(&no_radio, LinkOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::MissingParameter { param: "radio", .. }));

        // Nothing ran before the parameters were checked
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_step_is_not_rolled_back() {
        let backend = ScriptedBackend::new();
        backend.error_on("type lowpan");
        let node = sta1(&backend, radio_params());

        let err = SixLowpanLink::establish(&node, LinkOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Exec(_)));
        assert_eq!(backend.calls().len(), 4);
        assert!(node.interfaces().is_empty());
    }

    #[tokio::test]
    async fn test_delete_detaches() {
        let backend = ScriptedBackend::new();
        let node = sta1(&backend, radio_params());
        let mut link = SixLowpanLink::establish(&node, LinkOptions::default())
            .await
            .unwrap();

        link.delete().await.unwrap();
        assert!(node.interfaces().is_empty());
        assert_eq!(
            backend.calls_matching("link del"),
            vec!["ip netns exec sta1 ip link del sta1-lowpan"]
        );
    }
}
