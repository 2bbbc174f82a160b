//! Virtual radio subsystem
//!
//! The device allocator needs six things from the kernel's radio simulation:
//! load it with N radios, list device groups still resident from earlier
//! runs, list the wireless devices it exposes, resolve a device's PHY, move
//! a PHY into a node's namespace, and unload it. [`RadioSubsystem`] is that
//! seam; [`Fakelb`] implements it with the `fakelb` module and `iwpan`.

use crate::exec::{ExecError, ExecutionBackend, Invocation};
use crate::node::Isolation;
use crate::parse;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Kernel module providing the loopback 802.15.4 radios
pub const FAKELB_MODULE: &str = "fakelb";

/// Default debugfs directory listing simulated PHYs
pub const DEFAULT_DEBUGFS_ROOT: &str = "/sys/kernel/debug/ieee80211";

/// Entry marking a debugfs PHY directory as a simulated device group
const GROUP_MARKER: &str = "hwsim";

#[derive(Error, Debug)]
pub enum RadioError {
    #[error("Failed to load {module}: {reason}")]
    Load { module: String, reason: String },

    #[error("Failed to read debug namespace {path}: {source}")]
    DebugFs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No PHY found for device {0}")]
    PhyNotFound(String),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

/// Radio-simulation capabilities used by the device allocator
#[async_trait]
pub trait RadioSubsystem: Send + Sync {
    /// Load the simulation with `radios` virtual radios, from `alternative`
    /// when an out-of-tree module path is given.
    async fn load(&self, radios: u32, alternative: Option<&Path>) -> Result<(), RadioError>;

    /// Device group names present in the debug namespace, sorted
    async fn device_groups(&self) -> Result<Vec<String>, RadioError>;

    /// Names of the wireless devices currently visible, in listing order
    async fn wireless_devices(&self) -> Result<Vec<String>, RadioError>;

    /// PHY number owning `device`
    async fn phy_of(&self, device: &str) -> Result<u32, RadioError>;

    /// Move PHY `phy` (and its devices) into `target`.
    async fn move_phy(&self, phy: u32, target: &Isolation) -> Result<(), RadioError>;

    /// Unload the simulation, destroying every device at once.
    async fn unload(&self) -> Result<(), RadioError>;
}

/// `fakelb` + `iwpan` backed radio subsystem
pub struct Fakelb {
    backend: Arc<dyn ExecutionBackend>,
    debugfs_root: PathBuf,
}

impl Fakelb {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self::with_debugfs_root(backend, DEFAULT_DEBUGFS_ROOT)
    }

    pub fn with_debugfs_root(
        backend: Arc<dyn ExecutionBackend>,
        debugfs_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backend,
            debugfs_root: debugfs_root.into(),
        }
    }

    pub fn debugfs_root(&self) -> &Path {
        &self.debugfs_root
    }

    async fn iwpan_dev(&self) -> Result<String, RadioError> {
        let out = self
            .backend
            .run(&Invocation::new("iwpan").arg("dev"))
            .await?;
        Ok(out.text())
    }
}

#[async_trait]
impl RadioSubsystem for Fakelb {
    async fn load(&self, radios: u32, alternative: Option<&Path>) -> Result<(), RadioError> {
        debug!("Loading {} virtual radios", radios);
        let numlbs = format!("numlbs={}", radios);
        let (module, invocation) = match alternative {
            Some(path) => (
                path.display().to_string(),
                Invocation::new("insmod").arg(path.display().to_string()).arg(numlbs),
            ),
            None => (
                FAKELB_MODULE.to_string(),
                Invocation::new("modprobe").arg(FAKELB_MODULE).arg(numlbs),
            ),
        };

        let out = self.backend.run(&invocation).await?;
        if !out.success() {
            return Err(RadioError::Load {
                module,
                reason: out.stderr.trim().to_string(),
            });
        }
        info!("Loaded {} with {} radios", module, radios);
        Ok(())
    }

    async fn device_groups(&self) -> Result<Vec<String>, RadioError> {
        let mut entries = match tokio::fs::read_dir(&self.debugfs_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(
                    "Debug namespace {} absent, no resident devices",
                    self.debugfs_root.display()
                );
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(RadioError::DebugFs {
                    path: self.debugfs_root.clone(),
                    source,
                })
            }
        };

        let mut groups = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(RadioError::DebugFs {
                        path: self.debugfs_root.clone(),
                        source,
                    })
                }
            };
            let marker = entry.path().join(GROUP_MARKER);
            if !tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                groups.push(name);
            }
        }
        groups.sort();
        Ok(groups)
    }

    async fn wireless_devices(&self) -> Result<Vec<String>, RadioError> {
        Ok(parse::wpan_interfaces(&self.iwpan_dev().await?))
    }

    async fn phy_of(&self, device: &str) -> Result<u32, RadioError> {
        parse::phy_of(&self.iwpan_dev().await?, device)
            .ok_or_else(|| RadioError::PhyNotFound(device.to_string()))
    }

    async fn move_phy(&self, phy: u32, target: &Isolation) -> Result<(), RadioError> {
        let invocation = Invocation::new("iwpan")
            .args(["phy".to_string(), format!("phy{}", phy), "set".to_string()])
            .args(target.iwpan_netns_args());
        self.backend.run_checked(&invocation).await?;
        debug!("Moved phy{} into {}", phy, target);
        Ok(())
    }

    async fn unload(&self) -> Result<(), RadioError> {
        info!("Unloading {}", FAKELB_MODULE);
        self.backend
            .run_checked(&Invocation::new("rmmod").arg(FAKELB_MODULE))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::CommandOutput;
    use crate::testing::{iwpan_dev_listing, ScriptedBackend};

    #[tokio::test]
    async fn test_device_groups_from_debugfs() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["mn01s00", "mn00s00", "phy7"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("mn01s00").join("hwsim")).unwrap();
        std::fs::create_dir_all(dir.path().join("mn00s00").join("hwsim")).unwrap();

        let radio = Fakelb::with_debugfs_root(ScriptedBackend::new(), dir.path());
        assert_eq!(
            radio.device_groups().await.unwrap(),
            vec!["mn00s00", "mn01s00"]
        );
    }

    #[tokio::test]
    async fn test_missing_debugfs_means_no_groups() {
        let dir = tempfile::tempdir().unwrap();
        let radio = Fakelb::with_debugfs_root(ScriptedBackend::new(), dir.path().join("absent"));
        assert!(radio.device_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_commands() {
        let backend = ScriptedBackend::new();
        let radio = Fakelb::new(backend.clone());

        radio.load(4, None).await.unwrap();
        radio
            .load(2, Some(Path::new("/opt/fakelb/fakelb.ko")))
            .await
            .unwrap();
        assert_eq!(
            backend.calls(),
            vec![
                "modprobe fakelb numlbs=4",
                "insmod /opt/fakelb/fakelb.ko numlbs=2",
            ]
        );

        backend.on(
            "modprobe",
            CommandOutput::failed("modprobe: FATAL: Module fakelb not found\n", 1),
        );
        let err = radio.load(1, None).await.unwrap_err();
        assert!(matches!(err, RadioError::Load { .. }));
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_devices_and_phys() {
        let backend = ScriptedBackend::new();
        backend.on("iwpan dev", CommandOutput::ok(iwpan_dev_listing(3)));
        let radio = Fakelb::new(backend.clone());

        assert_eq!(
            radio.wireless_devices().await.unwrap(),
            vec!["wpan0", "wpan1", "wpan2"]
        );
        assert_eq!(radio.phy_of("wpan2").await.unwrap(), 2);
        assert!(matches!(
            radio.phy_of("wpan9").await,
            Err(RadioError::PhyNotFound(_))
        ));

        radio
            .move_phy(2, &Isolation::Named("sta1".into()))
            .await
            .unwrap();
        radio.move_phy(0, &Isolation::Pid(4242)).await.unwrap();
        assert_eq!(
            backend.calls_matching("iwpan phy"),
            vec![
                "iwpan phy phy2 set netns name sta1",
                "iwpan phy phy0 set netns 4242",
            ]
        );
    }
}
