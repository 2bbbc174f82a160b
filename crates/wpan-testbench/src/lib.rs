//! Virtual 802.15.4 radio testbench
//!
//! This crate provisions simulated IEEE 802.15.4 radios (`fakelb`) for
//! emulated nodes living in Linux network namespaces, binds each radio to
//! its node under a stable name, and builds 6LoWPAN links on top of them.
//!
//! Every host interaction goes through an [`ExecutionBackend`], so the
//! whole provisioning flow can be driven against a scripted backend in
//! tests and against the real host (with CAP_NET_ADMIN) otherwise.

pub mod allocator;
pub mod config;
pub mod exec;
pub mod intf;
pub mod link;
pub mod node;
pub mod parse;
pub mod radio;
pub mod testbed;
pub mod testing;

// Re-export commonly used types
pub use allocator::{Assignment, DeviceAllocator};
pub use config::{NodeSpec, TestbedConfig, TopologySpec};
pub use exec::{CommandOutput, ExecutionBackend, Invocation, SystemBackend};
pub use intf::{IntfConfig, InterfaceHandle};
pub use link::SixLowpanLink;
pub use node::{Isolation, Node, NodeParams, WirelessNode};
pub use radio::{Fakelb, RadioSubsystem};
pub use testbed::{PingSummary, Testbed};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestbenchError {
    #[error("Command execution error: {0}")]
    Exec(#[from] exec::ExecError),

    #[error("Node error: {0}")]
    Node(#[from] node::NodeError),

    #[error("Interface error: {0}")]
    Intf(#[from] intf::IntfError),

    #[error("6LoWPAN link error: {0}")]
    Link(#[from] link::LinkError),

    #[error("Radio subsystem error: {0}")]
    Radio(#[from] radio::RadioError),

    #[error("Radio allocation error: {0}")]
    Alloc(#[from] allocator::AllocError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Ping failed: {0}")]
    Ping(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, TestbenchError>;
