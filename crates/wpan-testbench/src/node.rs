//! Emulated node capability set
//!
//! A node is an isolated network context (a named netns or the namespace of
//! a running process) plus the bookkeeping the testbench needs from it:
//! command execution inside the context, a port-indexed interface table,
//! and the per-slot PHY ids handed out by the device allocator.

use crate::exec::{CommandOutput, ExecError, ExecutionBackend, Invocation};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Port {port} on node {node} is already bound to {intf}")]
    PortInUse { node: String, port: u32, intf: String },

    #[error("Interface {intf} is not attached to node {node}")]
    UnknownInterface { node: String, intf: String },

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

/// Network context a node's interfaces live in
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    /// Named namespace under `/var/run/netns`
    Named(String),
    /// Namespace of a running process; pid 1 is the host namespace
    Pid(u32),
}

impl Isolation {
    /// The host's own network namespace
    pub fn host() -> Self {
        Self::Pid(1)
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Self::Pid(1))
    }

    /// Command prefix running a program inside this context
    pub fn exec_prefix(&self) -> Vec<String> {
        match self {
            Self::Pid(1) => Vec::new(),
            Self::Named(ns) => vec!["ip".into(), "netns".into(), "exec".into(), ns.clone()],
            Self::Pid(pid) => vec!["nsenter".into(), "-t".into(), pid.to_string(), "-n".into()],
        }
    }

    /// Trailing `iwpan phy <phy> set ...` words moving a PHY here
    pub fn iwpan_netns_args(&self) -> Vec<String> {
        match self {
            Self::Named(ns) => vec!["netns".into(), "name".into(), ns.clone()],
            Self::Pid(pid) => vec!["netns".into(), pid.to_string()],
        }
    }

    /// Target accepted by `ip link set <dev> netns <target>`
    pub fn ip_netns_target(&self) -> String {
        match self {
            Self::Named(ns) => ns.clone(),
            Self::Pid(pid) => pid.to_string(),
        }
    }
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(ns) => write!(f, "netns {}", ns),
            Self::Pid(pid) => write!(f, "pid {}", pid),
        }
    }
}

/// Per-node parameters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeParams {
    /// Requested radio interface names, one per slot
    pub wlan: Vec<String>,
    /// Addresses in `addr/len` form, primary first
    pub ip: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan_id: Option<String>,
    /// Explicit request for isolation even when the context is the host
    #[serde(default)]
    pub in_namespace: bool,
}

/// How a newly attached interface reaches the node
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Placement {
    /// The interface already lives in the node's context
    #[default]
    InPlace,
    /// Move it from the host into the node's context first
    MoveIntoNamespace,
}

/// Capabilities the provisioning core needs from an emulated node
#[async_trait]
pub trait Node: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn isolation(&self) -> &Isolation;

    fn params(&self) -> &NodeParams;

    /// Whether the allocator should hand this node radios
    fn is_isolated(&self) -> bool {
        !self.isolation().is_host() || self.params().in_namespace
    }

    /// Run a command in the node's context and return its combined output.
    async fn cmd(&self, words: &[&str]) -> Result<String, ExecError> {
        Ok(self.pexec(words).await?.text())
    }

    /// Run a command in the node's context, keeping stdout, stderr and status apart.
    async fn pexec(&self, words: &[&str]) -> Result<CommandOutput, ExecError>;

    /// Attach an interface, at `port` or the next free one. Returns the port.
    async fn add_intf(
        &self,
        intf: &str,
        port: Option<u32>,
        placement: Placement,
    ) -> Result<u32, NodeError>;

    /// Detach an interface, returning the port it was bound to.
    fn del_intf(&self, intf: &str) -> Option<u32>;

    /// Follow an interface rename in the interface table.
    fn rename_intf(&self, old: &str, new: &str);

    /// Next unused port number
    fn new_port(&self) -> u32;

    /// Attached interfaces ordered by port
    fn interfaces(&self) -> Vec<(u32, String)>;

    /// Record the allocator-wide PHY id of radio slot `slot`.
    fn set_phy_id(&self, slot: usize, id: u64);

    /// PHY ids per radio slot, `None` for slots not yet provisioned
    fn phy_ids(&self) -> Vec<Option<u64>>;
}

#[derive(Debug, Default)]
struct NodeState {
    intfs: BTreeMap<u32, String>,
    phy_ids: Vec<Option<u64>>,
}

/// Node backed by a Linux network namespace
pub struct WirelessNode {
    name: String,
    isolation: Isolation,
    params: NodeParams,
    backend: Arc<dyn ExecutionBackend>,
    state: Mutex<NodeState>,
}

impl fmt::Debug for WirelessNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WirelessNode")
            .field("name", &self.name)
            .field("isolation", &self.isolation)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl WirelessNode {
    pub fn new(
        name: impl Into<String>,
        isolation: Isolation,
        params: NodeParams,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Self {
        let state = NodeState {
            intfs: BTreeMap::new(),
            phy_ids: vec![None; params.wlan.len()],
        };
        Self {
            name: name.into(),
            isolation,
            params,
            backend,
            state: Mutex::new(state),
        }
    }

    pub fn backend(&self) -> &Arc<dyn ExecutionBackend> {
        &self.backend
    }

    /// Create the named namespace backing this node.
    ///
    /// A namespace of the same name left by an earlier run is deleted and
    /// created afresh.
    pub async fn create_namespace(&self) -> Result<(), NodeError> {
        if let Isolation::Named(ns) = &self.isolation {
            debug!("Creating namespace {} for node {}", ns, self.name);
            let add = Invocation::new("ip").args(["netns", "add", ns.as_str()]);
            let out = self.backend.run(&add).await?;
            if !out.success() && out.stderr.contains("File exists") {
                warn!("Namespace {} already exists, recreating it", ns);
                self.destroy_namespace().await;
                self.backend.run_checked(&add).await?;
            } else {
                out.into_checked(&add)?;
            }
            info!("Created namespace {} for node {}", ns, self.name);
        }
        Ok(())
    }

    /// Remove the named namespace, ignoring failures.
    pub async fn destroy_namespace(&self) {
        if let Isolation::Named(ns) = &self.isolation {
            match self
                .backend
                .run(&Invocation::new("ip").args(["netns", "del", ns.as_str()]))
                .await
            {
                Ok(out) if out.success() => debug!("Deleted namespace {}", ns),
                Ok(out) => debug!("Namespace {} may not exist: {}", ns, out.stderr.trim()),
                Err(e) => warn!("Failed to delete namespace {}: {}", ns, e),
            }
        }
    }
}

#[async_trait]
impl Node for WirelessNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    fn params(&self) -> &NodeParams {
        &self.params
    }

    async fn pexec(&self, words: &[&str]) -> Result<CommandOutput, ExecError> {
        let Some(invocation) = Invocation::from_words(words) else {
            return Ok(CommandOutput::ok(""));
        };
        let invocation = invocation.wrapped(&self.isolation.exec_prefix());
        self.backend.run(&invocation).await
    }

    async fn add_intf(
        &self,
        intf: &str,
        port: Option<u32>,
        placement: Placement,
    ) -> Result<u32, NodeError> {
        if placement == Placement::MoveIntoNamespace && !self.isolation.is_host() {
            let target = self.isolation.ip_netns_target();
            debug!("Moving {} into {} for node {}", intf, self.isolation, self.name);
            self.backend
                .run_checked(&Invocation::new("ip").args([
                    "link",
                    "set",
                    intf,
                    "netns",
                    target.as_str(),
                ]))
                .await?;
        }

        let mut state = self.state.lock();
        let port = match port {
            Some(p) => p,
            None => next_port(&state.intfs),
        };
        if let Some(existing) = state.intfs.get(&port) {
            if existing != intf {
                return Err(NodeError::PortInUse {
                    node: self.name.clone(),
                    port,
                    intf: existing.clone(),
                });
            }
        }
        state.intfs.insert(port, intf.to_string());
        debug!("Attached {} to node {} at port {}", intf, self.name, port);
        Ok(port)
    }

    fn del_intf(&self, intf: &str) -> Option<u32> {
        let mut state = self.state.lock();
        let port = state
            .intfs
            .iter()
            .find(|(_, name)| name.as_str() == intf)
            .map(|(port, _)| *port)?;
        state.intfs.remove(&port);
        Some(port)
    }

    fn rename_intf(&self, old: &str, new: &str) {
        let mut state = self.state.lock();
        for name in state.intfs.values_mut() {
            if name == old {
                *name = new.to_string();
            }
        }
    }

    fn new_port(&self) -> u32 {
        next_port(&self.state.lock().intfs)
    }

    fn interfaces(&self) -> Vec<(u32, String)> {
        self.state
            .lock()
            .intfs
            .iter()
            .map(|(port, name)| (*port, name.clone()))
            .collect()
    }

    fn set_phy_id(&self, slot: usize, id: u64) {
        let mut state = self.state.lock();
        if state.phy_ids.len() <= slot {
            state.phy_ids.resize(slot + 1, None);
        }
        state.phy_ids[slot] = Some(id);
    }

    fn phy_ids(&self) -> Vec<Option<u64>> {
        self.state.lock().phy_ids.clone()
    }
}

fn next_port(intfs: &BTreeMap<u32, String>) -> u32 {
    intfs.keys().next_back().map_or(0, |p| p + 1)
}
