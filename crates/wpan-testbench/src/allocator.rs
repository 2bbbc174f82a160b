//! Virtual radio device allocation
//!
//! The [`DeviceAllocator`] turns a request for N radios into concrete
//! devices bound to nodes:
//!
//! 1. load the radio simulation with N radios (one retry on failure),
//! 2. derive a naming prefix (`mnNNs`) no resident device group uses,
//! 3. list the free devices, shortest name first,
//! 4. for every isolated node and every requested radio slot, move the
//!    head device's PHY into the node's namespace and rename the device to
//!    the slot's interface name, consuming it from the pool.
//!
//! A device leaves the free pool exactly once and never returns to it.
//! PHY ids come from a counter that only grows for the allocator's
//! lifetime. Allocator state is owned by the caller and mutated through
//! `&mut self`; running assignments concurrently would need a lock around
//! pool pops and counter increments.

use crate::exec::{ExecError, ExecutionBackend, Invocation};
use crate::node::Node;
use crate::parse;
use crate::radio::{RadioError, RadioSubsystem};
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Stem of every naming prefix handed out by the allocator
pub const PREFIX_STEM: &str = "mn";

/// Name suffixes of per-run configuration files swept on teardown
pub const ARTIFACT_SUFFIXES: [&str; 4] = [".apconf", ".staconf", "wifiDirect.conf", ".nodeParams"];

#[derive(Error, Debug)]
pub enum AllocError {
    #[error("Radio subsystem error: {0}")]
    Radio(#[from] RadioError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),

    #[error("Radio module load failed after retry: {0}")]
    ModuleLoad(#[source] RadioError),

    #[error("Free device pool exhausted while provisioning {node} slot {slot}")]
    PoolExhausted { node: String, slot: usize },

    #[error("Provisioning {node} slot {slot} failed: {source}")]
    Provisioning {
        node: String,
        slot: usize,
        #[source]
        source: Box<AllocError>,
    },
}

/// One device bound to one node's radio slot
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub node: String,
    pub slot: usize,
    /// Device name as discovered in the free pool
    pub device: String,
    /// Interface name the device was renamed to
    pub renamed_to: String,
    pub phy: u32,
    pub phy_id: u64,
}

#[derive(Clone, Debug)]
pub struct AllocatorOptions {
    /// Devices are created by someone else; never load or unload modules
    pub externally_managed: bool,
    /// Directory swept for per-run configuration files on teardown
    pub artifact_dir: PathBuf,
}

impl Default for AllocatorOptions {
    fn default() -> Self {
        Self {
            externally_managed: false,
            artifact_dir: PathBuf::from("."),
        }
    }
}

/// First `mnNNs` prefix no existing group name starts with.
pub fn derive_prefix<S: AsRef<str>>(existing: &[S]) -> String {
    let mut num = 0u32;
    loop {
        let candidate = format!("{}{:02}s", PREFIX_STEM, num);
        if !existing.iter().any(|g| g.as_ref().starts_with(&candidate)) {
            return candidate;
        }
        num += 1;
    }
}

/// Free-pool order: lexicographic, then stable by name length.
pub fn pool_order(mut devices: Vec<String>) -> Vec<String> {
    devices.sort();
    devices.sort_by_key(String::len);
    devices
}

/// Allocator for virtual radio devices
pub struct DeviceAllocator {
    radio: Arc<dyn RadioSubsystem>,
    backend: Arc<dyn ExecutionBackend>,
    free: VecDeque<String>,
    assignments: Vec<Assignment>,
    prefix: String,
    externally_managed: bool,
    devices_created_dynamically: bool,
    next_phy_id: u64,
    artifact_dir: PathBuf,
}

impl DeviceAllocator {
    pub fn new(
        radio: Arc<dyn RadioSubsystem>,
        backend: Arc<dyn ExecutionBackend>,
        options: AllocatorOptions,
    ) -> Self {
        Self {
            radio,
            backend,
            free: VecDeque::new(),
            assignments: Vec::new(),
            prefix: String::new(),
            externally_managed: options.externally_managed,
            devices_created_dynamically: false,
            next_phy_id: 0,
            artifact_dir: options.artifact_dir,
        }
    }

    /// Naming prefix of this run, empty until devices were enumerated
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Devices not yet bound to any node, in assignment order
    pub fn free_devices(&self) -> Vec<String> {
        self.free.iter().cloned().collect()
    }

    /// Every assignment made so far
    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    /// PHY id the next radio slot will receive
    pub fn next_phy_id(&self) -> u64 {
        self.next_phy_id
    }

    pub fn devices_created_dynamically(&self) -> bool {
        self.devices_created_dynamically
    }

    /// Provision `radios` radios and bind them to `nodes`.
    ///
    /// Returns the assignments made by this call. A failure during
    /// assignment is terminal: nothing is rolled back or retried.
    pub async fn start(
        &mut self,
        nodes: &[Arc<dyn Node>],
        radios: u32,
        alternative: Option<&Path>,
    ) -> Result<Vec<Assignment>, AllocError> {
        info!("Starting radio allocation: {} radios for {} nodes", radios, nodes.len());

        self.kill_stray_daemons().await;
        self.load_module(radios, alternative).await?;
        self.discover_free_devices().await?;
        self.assign_interfaces(nodes, None).await
    }

    /// Stop a hostapd left over from another run; it would grab our radios.
    async fn kill_stray_daemons(&self) {
        let running = match self
            .backend
            .run(&Invocation::new("pgrep").args(["-f", "hostapd"]))
            .await
        {
            Ok(out) => out.success() && !out.stdout.trim().is_empty(),
            Err(e) => {
                debug!("pgrep unavailable: {}", e);
                false
            }
        };
        if running {
            info!("Killing stray hostapd processes");
            if let Err(e) = self
                .backend
                .run(&Invocation::new("pkill").args(["-f", "hostapd"]))
                .await
            {
                warn!("Failed to kill hostapd: {}", e);
            }
        }
    }

    /// Load the radio simulation, retrying once with at least one radio.
    pub async fn load_module(
        &mut self,
        radios: u32,
        alternative: Option<&Path>,
    ) -> Result<(), AllocError> {
        if self.externally_managed {
            debug!("Radios are externally managed, skipping module load");
            self.devices_created_dynamically = true;
            return self.create_devices().await;
        }

        match self.radio.load(radios, alternative).await {
            Ok(()) => self.create_devices().await,
            Err(e) => {
                // Older kernels reject numlbs=0
                let radios = radios.max(1);
                warn!("Radio module load failed ({}), retrying with {} radios", e, radios);
                self.radio
                    .load(radios, alternative)
                    .await
                    .map_err(AllocError::ModuleLoad)
            }
        }
    }

    /// Choose a naming prefix clear of every resident device group.
    pub async fn create_devices(&mut self) -> Result<(), AllocError> {
        let groups = self.radio.device_groups().await?;
        self.prefix = derive_prefix(&groups);
        info!(
            "Using device prefix {} ({} resident groups)",
            self.prefix,
            groups.len()
        );
        Ok(())
    }

    /// Refill the free pool from the devices currently visible.
    pub async fn discover_free_devices(&mut self) -> Result<Vec<String>, AllocError> {
        let devices = pool_order(self.radio.wireless_devices().await?);
        debug!("Free devices: {:?}", devices);
        self.free = devices.iter().cloned().collect();
        Ok(devices)
    }

    /// Bind one free device to every radio slot of every isolated node.
    ///
    /// PHY resolution reads the first entry of `phys`, or the head of the
    /// free pool when `phys` is `None`; it does not rotate through `phys`.
    pub async fn assign_interfaces(
        &mut self,
        nodes: &[Arc<dyn Node>],
        phys: Option<&[String]>,
    ) -> Result<Vec<Assignment>, AllocError> {
        debug!("Configuring interfaces with their network namespaces");
        let first_new = self.assignments.len();

        for node in nodes {
            if !node.is_isolated() {
                continue;
            }
            let slots = node.params().wlan.clone();
            for (slot, wlan) in slots.iter().enumerate() {
                if let Err(e) = self.assign_slot(node.as_ref(), slot, wlan, phys).await {
                    error!(
                        "Error when assigning virtual radio to {} slot {}: {}",
                        node.name(),
                        slot,
                        e
                    );
                    error!("Run `wpan-cli clean` (with `--topology` for a topology file) to remove leftovers of the failed run");
                    return Err(AllocError::Provisioning {
                        node: node.name().to_string(),
                        slot,
                        source: Box::new(e),
                    });
                }
            }
        }

        Ok(self.assignments[first_new..].to_vec())
    }

    async fn assign_slot(
        &mut self,
        node: &dyn Node,
        slot: usize,
        wlan: &str,
        phys: Option<&[String]>,
    ) -> Result<(), AllocError> {
        let exhausted = || AllocError::PoolExhausted {
            node: node.name().to_string(),
            slot,
        };

        let phy_id = self.next_phy_id;
        self.next_phy_id += 1;
        node.set_phy_id(slot, phy_id);

        let candidate = match phys {
            Some(list) => list.first(),
            None => self.free.front(),
        }
        .cloned()
        .ok_or_else(exhausted)?;
        let phy = self.radio.phy_of(&candidate).await?;
        self.radio.move_phy(phy, node.isolation()).await?;

        let device = self.free.front().cloned().ok_or_else(exhausted)?;
        let out = node.cmd(&["ip", "link", "set", &device, "down"]).await?;
        if !out.is_empty() {
            debug!("{}: setting {} down reported: {}", node.name(), device, out.trim());
        }
        let out = node
            .cmd(&["ip", "link", "set", &device, "name", wlan])
            .await?;
        if !out.is_empty() {
            debug!("{}: renaming {} reported: {}", node.name(), device, out.trim());
        }
        self.free.pop_front();

        info!("Assigned {} (phy{}) to {} as {}", device, phy, node.name(), wlan);
        self.assignments.push(Assignment {
            node: node.name().to_string(),
            slot,
            device,
            renamed_to: wlan.to_string(),
            phy,
            phy_id,
        });
        Ok(())
    }

    /// Load `count` intermediate functional block devices.
    pub async fn load_ifb(&self, count: usize) -> Result<(), AllocError> {
        debug!("Loading IFB: modprobe ifb numifbs={}", count);
        self.backend
            .run_checked(
                &Invocation::new("modprobe")
                    .arg("ifb")
                    .arg(format!("numifbs={}", count)),
            )
            .await?;
        Ok(())
    }

    /// Unload the radio simulation.
    pub async fn kill_fakelb(&self) -> Result<(), AllocError> {
        info!("Killing fakelb");
        self.radio.unload().await?;
        Ok(())
    }

    /// Tear the whole fleet down.
    ///
    /// Every step is best effort and the radio simulation is unloaded
    /// regardless of earlier failures.
    pub async fn stop(&mut self) {
        let removed = remove_artifacts(&self.artifact_dir).await;
        if removed > 0 {
            debug!("Removed {} configuration artifacts", removed);
        }

        match self.backend.run(&Invocation::new("lsmod")).await {
            Ok(out) if parse::module_listed(&out.stdout, "ifb") => {
                if let Err(e) = self.backend.run(&Invocation::new("rmmod").arg("ifb")).await {
                    debug!("Failed to remove ifb: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => debug!("lsmod failed: {}", e),
        }

        let tag = format!("{}{}_", PREFIX_STEM, nix::unistd::getpid());
        for pattern in [
            format!("wpa_supplicant -B -Dnl80211 -c{}", tag),
            format!("wpa_supplicant -B -Dnl80211 -P {}", tag),
        ] {
            if let Err(e) = self
                .backend
                .run(&Invocation::new("pkill").arg("-f").arg(pattern))
                .await
            {
                debug!("pkill failed: {}", e);
            }
        }

        if let Err(e) = self.kill_fakelb().await {
            warn!("Failed to unload radio module: {}", e);
        }
        self.free.clear();
    }
}

/// Delete per-run configuration files in `dir`, returning how many went.
async fn remove_artifacts(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot scan {} for artifacts: {}", dir.display(), e);
            return 0;
        }
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || !ARTIFACT_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(e) => debug!("Failed to remove {}: {}", name, e),
        }
    }
    removed
}
