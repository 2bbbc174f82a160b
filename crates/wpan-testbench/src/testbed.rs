//! Testbed orchestration
//!
//! [`Testbed`] owns the nodes of one run, the device allocator that gives
//! them radios and the 6LoWPAN links built on top. A run goes
//! `add_node`* → `configure_nodes` → `add_link`* → `ping_all` → `stop`,
//! or all at once through [`Testbed::build`].

use crate::allocator::{AllocatorOptions, Assignment, DeviceAllocator};
use crate::config::{NodeSpec, TestbedConfig, TopologySpec, DEFAULT_PAN_ID};
use crate::exec::{ExecutionBackend, Invocation, SystemBackend};
use crate::link::{wpan_name, LinkOptions, SixLowpanLink};
use crate::node::{Isolation, Node, NodeParams, WirelessNode};
use crate::parse;
use crate::radio::{Fakelb, RadioSubsystem};
use crate::{Result, TestbenchError};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Packet counts of one `ping_all` round
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PingSummary {
    pub sent: u32,
    pub received: u32,
}

impl PingSummary {
    pub fn loss_percent(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        100.0 * f64::from(self.sent - self.received) / f64::from(self.sent)
    }
}

/// `index`-th host address of `base`, with the base prefix length appended.
pub fn host_address(base: &IpNetwork, index: u32) -> Result<String> {
    let out_of_range = || {
        TestbenchError::InvalidConfig(format!("Host index {} is outside {}", index, base))
    };
    let addr: IpAddr = match base {
        IpNetwork::V4(net) => u32::from(net.network())
            .checked_add(index)
            .map(|a| IpAddr::V4(Ipv4Addr::from(a)))
            .ok_or_else(out_of_range)?,
        IpNetwork::V6(net) => u128::from(net.network())
            .checked_add(u128::from(index))
            .map(|a| IpAddr::V6(Ipv6Addr::from(a)))
            .ok_or_else(out_of_range)?,
    };
    if !base.contains(addr) {
        return Err(out_of_range());
    }
    Ok(format!("{}/{}", addr, base.prefix()))
}

/// One emulation run: nodes, their radios and their 6LoWPAN links
pub struct Testbed {
    config: TestbedConfig,
    backend: Arc<dyn ExecutionBackend>,
    allocator: DeviceAllocator,
    nodes: Vec<Arc<WirelessNode>>,
    links: Vec<SixLowpanLink>,
    ip_base: IpNetwork,
    next_host: u32,
    pan_id: String,
}

impl Testbed {
    /// Testbed running commands on the host through `fakelb`.
    pub fn new(config: TestbedConfig) -> Result<Self> {
        let backend: Arc<dyn ExecutionBackend> =
            Arc::new(SystemBackend::new(config.command_timeout()));
        let radio = Arc::new(Fakelb::with_debugfs_root(
            backend.clone(),
            config.debugfs_root.clone(),
        ));
        Self::with_backend(config, backend, radio)
    }

    pub fn with_backend(
        config: TestbedConfig,
        backend: Arc<dyn ExecutionBackend>,
        radio: Arc<dyn RadioSubsystem>,
    ) -> Result<Self> {
        config.validate()?;
        let ip_base = config.ip_base.parse::<IpNetwork>().map_err(|e| {
            TestbenchError::InvalidConfig(format!("Invalid ip_base '{}': {}", config.ip_base, e))
        })?;
        let allocator = DeviceAllocator::new(
            radio,
            backend.clone(),
            AllocatorOptions {
                externally_managed: config.externally_managed,
                artifact_dir: config.artifact_dir.clone(),
            },
        );

        Ok(Self {
            config,
            backend,
            allocator,
            nodes: Vec::new(),
            links: Vec::new(),
            ip_base,
            next_host: 1,
            pan_id: DEFAULT_PAN_ID.to_string(),
        })
    }

    pub fn config(&self) -> &TestbedConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    pub fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }

    pub fn links(&self) -> &[SixLowpanLink] {
        &self.links
    }

    pub fn pan_id(&self) -> &str {
        &self.pan_id
    }

    /// PAN id handed to nodes added from now on
    pub fn set_pan_id(&mut self, pan_id: impl Into<String>) {
        self.pan_id = pan_id.into();
    }

    pub fn nodes(&self) -> Vec<Arc<dyn Node>> {
        self.nodes
            .iter()
            .map(|n| n.clone() as Arc<dyn Node>)
            .collect()
    }

    pub fn node(&self, name: &str) -> Option<Arc<dyn Node>> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .map(|n| n.clone() as Arc<dyn Node>)
    }

    /// Radios requested by every node so far
    pub fn total_radios(&self) -> u32 {
        self.nodes.iter().map(|n| n.params().wlan.len() as u32).sum()
    }

    /// Provision, link and return the assignments for a whole topology.
    pub async fn build(&mut self, topology: &TopologySpec) -> Result<Vec<Assignment>> {
        topology.validate()?;
        self.set_pan_id(topology.pan_id.clone());
        for spec in &topology.nodes {
            self.add_node(spec).await?;
        }
        let assignments = self.configure_nodes().await?;
        for spec in &topology.nodes {
            self.add_link(&spec.name).await?;
        }
        Ok(assignments)
    }

    /// Create a node in its own namespace.
    ///
    /// Every node consumes one host index of `ip_base`, whether or not the
    /// node brings its own address.
    pub async fn add_node(&mut self, spec: &NodeSpec) -> Result<Arc<dyn Node>> {
        if self.node(&spec.name).is_some() {
            return Err(TestbenchError::InvalidConfig(format!(
                "Duplicate node name: {}",
                spec.name
            )));
        }

        let default_ip = host_address(&self.ip_base, self.next_host)?;
        self.next_host += 1;
        let params = NodeParams {
            wlan: (0..spec.radios)
                .map(|i| wpan_name(&spec.name, &format!("wpan{}", i)))
                .collect(),
            ip: vec![spec.ip.clone().unwrap_or(default_ip)],
            pan_id: Some(self.pan_id.clone()),
            ..Default::default()
        };

        let node = Arc::new(WirelessNode::new(
            spec.name.clone(),
            Isolation::Named(spec.name.clone()),
            params,
            self.backend.clone(),
        ));
        node.create_namespace().await?;
        info!("Added node {} ({} radios, {})", spec.name, spec.radios, node.params().ip[0]);

        self.nodes.push(node.clone());
        Ok(node as Arc<dyn Node>)
    }

    /// Load radios for every node and bind them.
    pub async fn configure_nodes(&mut self) -> Result<Vec<Assignment>> {
        let radios = self.total_radios();
        let nodes = self.nodes();
        let assignments = self
            .allocator
            .start(&nodes, radios, self.config.alternative_module.as_deref())
            .await?;

        if self.config.load_ifb {
            self.allocator.load_ifb(radios as usize).await?;
        }
        info!("Configured {} radios on {} nodes", assignments.len(), nodes.len());
        Ok(assignments)
    }

    /// Bring up the 6LoWPAN link of node `name`.
    pub async fn add_link(&mut self, name: &str) -> Result<&SixLowpanLink> {
        let node = self
            .node(name)
            .ok_or_else(|| TestbenchError::UnknownNode(name.to_string()))?;
        let link = SixLowpanLink::establish(
            &node,
            LinkOptions {
                pan_id: Some(self.pan_id.clone()),
                ..Default::default()
            },
        )
        .await?;
        let index = self.links.len();
        self.links.push(link);
        Ok(&self.links[index])
    }

    /// Have every linked node ping the all-nodes multicast group once.
    pub async fn ping_all(&self) -> Result<PingSummary> {
        info!("*** Ping: testing ping reachability");
        let mut summary = PingSummary::default();

        for link in &self.links {
            let intf = link.intf();
            let Some(node) = intf.node() else {
                warn!("{} has no node, skipping", intf);
                continue;
            };
            let target = format!("ff02::1%{}", intf.name());
            let out = node.pexec(&["ping6", "-c1", &target]).await?;

            let (sent, received) = match parse::ping_counts(&out.stdout) {
                Some(counts) => counts,
                None => {
                    warn!("{}: could not parse ping output: {}", node.name(), out.text().trim());
                    (1, 0)
                }
            };
            if received > sent {
                return Err(TestbenchError::Ping(format!(
                    "{} received {} replies for {} requests",
                    node.name(),
                    received,
                    sent
                )));
            }
            debug!("{} -> {}: {}/{} received", node.name(), target, received, sent);
            summary.sent += sent;
            summary.received += received;
        }

        info!(
            "*** Results: {:.0}% dropped ({}/{} received)",
            summary.loss_percent(),
            summary.received,
            summary.sent
        );
        Ok(summary)
    }

    /// Sweep what an earlier run left behind, then [`Testbed::stop`].
    ///
    /// Leftover namespaces are matched by the node names of `topology`, or
    /// by the `sta<N>` names of [`TopologySpec::stations`] when none is given.
    pub async fn clean(&mut self, topology: Option<&TopologySpec>) {
        self.stop().await;

        let list = Invocation::new("ip").args(["netns", "list"]);
        let listing = match self.backend.run(&list).await {
            Ok(out) => out.stdout,
            Err(e) => {
                warn!("Cannot list namespaces: {}", e);
                return;
            }
        };
        let stale = parse::netns_names(&listing).into_iter().filter(|ns| match topology {
            Some(topology) => topology.nodes.iter().any(|n| &n.name == ns),
            None => is_station_name(ns),
        });

        for ns in stale {
            info!("Removing leftover namespace {}", ns);
            match self
                .backend
                .run(&Invocation::new("ip").args(["netns", "del", ns.as_str()]))
                .await
            {
                Ok(out) if out.success() => {}
                Ok(out) => warn!("Failed to delete namespace {}: {}", ns, out.stderr.trim()),
                Err(e) => warn!("Failed to delete namespace {}: {}", ns, e),
            }
        }
    }

    /// Tear everything down; every step is best effort.
    pub async fn stop(&mut self) {
        info!("Stopping testbed");
        for link in &mut self.links {
            if let Err(e) = link.delete().await {
                debug!("Failed to delete {}: {}", link.intf(), e);
            }
        }
        self.links.clear();

        self.allocator.stop().await;

        for node in &self.nodes {
            node.destroy_namespace().await;
        }
        self.nodes.clear();
        info!("Testbed stopped");
    }
}

fn is_station_name(name: &str) -> bool {
    name.strip_prefix("sta")
        .map_or(false, |n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}
