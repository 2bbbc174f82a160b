//! CLI command implementations for the 6LoWPAN testbed
//!
//! Configuration and topology are loaded and validated before anything
//! touches the host, so bad input fails fast without leftovers.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;
use tracing::{error, info};
use wpan_testbench::{Testbed, TestbedConfig, TopologySpec};

/// Implementation of the 'up' command - sta1..staN on one PAN
pub async fn cmd_up(
    nodes: usize,
    radios: u32,
    pan_id: String,
    duration: Option<u64>,
    config: Option<PathBuf>,
) -> Result<()> {
    let topology = stations_topology(nodes, radios, pan_id)?;
    let config = load_config(config.as_deref()).await?;
    run_topology(config, topology, duration).await
}

/// Implementation of the 'run' command - topology from a JSON file
pub async fn cmd_run(topology: PathBuf, duration: Option<u64>, config: Option<PathBuf>) -> Result<()> {
    let spec = TopologySpec::from_file(&topology)
        .await
        .with_context(|| format!("Failed to load topology from {}", topology.display()))?;
    let config = load_config(config.as_deref()).await?;
    run_topology(config, spec, duration).await
}

/// Implementation of the 'clean' command - teardown and namespace sweep
pub async fn cmd_clean(topology: Option<PathBuf>, config: Option<PathBuf>) -> Result<()> {
    let topology = match topology {
        Some(path) => Some(
            TopologySpec::from_file(&path)
                .await
                .with_context(|| format!("Failed to load topology from {}", path.display()))?,
        ),
        None => None,
    };
    let config = load_config(config.as_deref()).await?;
    let mut testbed = Testbed::new(config)?;
    testbed.clean(topology.as_ref()).await;
    info!("Cleanup complete");
    Ok(())
}

pub fn stations_topology(nodes: usize, radios: u32, pan_id: String) -> Result<TopologySpec> {
    let topology = TopologySpec {
        pan_id,
        ..TopologySpec::stations(nodes, radios)
    };
    topology.validate()?;
    Ok(topology)
}

pub async fn load_config(path: Option<&Path>) -> Result<TestbedConfig> {
    match path {
        Some(path) => TestbedConfig::from_file(path)
            .await
            .with_context(|| format!("Failed to load testbed config from {}", path.display())),
        None => Ok(TestbedConfig::default()),
    }
}

async fn run_topology(config: TestbedConfig, topology: TopologySpec, duration: Option<u64>) -> Result<()> {
    info!(
        "Bringing up {} nodes with {} radios on PAN {}",
        topology.nodes.len(),
        topology.total_radios(),
        topology.pan_id
    );

    let mut testbed = Testbed::new(config)?;
    let assignments = match testbed.build(&topology).await {
        Ok(assignments) => assignments,
        Err(e) => {
            error!("Provisioning failed: {}", e);
            return Err(e.into());
        }
    };

    for a in &assignments {
        info!("  {} slot {}: {} (phy{}) -> {}", a.node, a.slot, a.device, a.phy, a.renamed_to);
    }
    for link in testbed.links() {
        let (intf, partner) = link.ends();
        info!("  {} <-> {} [{}]", intf, partner, intf.ip().unwrap_or("-"));
    }

    let summary = match testbed.ping_all().await {
        Ok(summary) => summary,
        Err(e) => {
            testbed.stop().await;
            return Err(e.into());
        }
    };
    info!(
        "Ping: {}/{} received ({:.0}% loss)",
        summary.received,
        summary.sent,
        summary.loss_percent()
    );

    match duration {
        Some(secs) => {
            tokio::select! {
                _ = sleep(Duration::from_secs(secs)) => {
                    info!("Duration completed");
                }
                _ = signal::ctrl_c() => {
                    info!("Interrupted by user");
                }
            }
        }
        None => {
            info!("Testbed up, press Ctrl+C to stop");
            signal::ctrl_c().await?;
        }
    }

    testbed.stop().await;
    info!("Testbed shut down successfully");
    Ok(())
}
