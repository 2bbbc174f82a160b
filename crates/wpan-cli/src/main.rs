//! 6LoWPAN testbed CLI tool
//!
//! This tool provisions virtual 802.15.4 radios for emulated nodes, brings
//! up their 6LoWPAN links and tears everything down again.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cmd_clean, cmd_run, cmd_up};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up stations sta1..staN on a shared PAN
    Up {
        /// Number of stations to create
        #[arg(long, default_value_t = 2)]
        nodes: usize,

        /// Radios per station
        #[arg(long, default_value_t = 1)]
        radios: u32,

        /// PAN id shared by all stations
        #[arg(long, default_value = "0xbeef")]
        pan_id: String,

        /// Seconds to keep the testbed up (until Ctrl+C when absent)
        #[arg(long)]
        duration: Option<u64>,

        /// Testbed configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Run a topology from a JSON file
    Run {
        /// Topology file path (JSON)
        topology: PathBuf,

        /// Seconds to keep the testbed up (until Ctrl+C when absent)
        #[arg(long)]
        duration: Option<u64>,

        /// Testbed configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Remove radios and leftovers of a previous run
    Clean {
        /// Topology the previous run used (JSON); sta1..staN when absent
        #[arg(long)]
        topology: Option<PathBuf>,

        /// Testbed configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing; RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Up {
            nodes,
            radios,
            pan_id,
            duration,
            config,
        } => {
            cmd_up(nodes, radios, pan_id, duration, config).await?;
        }
        Commands::Run {
            topology,
            duration,
            config,
        } => {
            cmd_run(topology, duration, config).await?;
        }
        Commands::Clean { topology, config } => {
            cmd_clean(topology, config).await?;
        }
    }

    Ok(())
}
