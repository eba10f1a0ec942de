//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Rackline - rack controller link to the region.
#[derive(Parser)]
#[command(name = "rackline")]
#[command(version)]
#[command(about = "Rack controller region link and network tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the rack controller service
    Start(StartArgs),

    /// Scan attached networks for live hosts
    Scan(ScanArgs),
}

#[derive(Args)]
pub struct StartArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/rackline/rackline.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct ScanArgs {
    /// Interface to scan; omit to scan the given CIDRs wherever attached
    pub interface: Option<String>,

    /// CIDRs to scan (e.g. 10.0.0.0/24); may follow the interface
    pub cidrs: Vec<String>,

    /// Ping hosts instead of relying on ARP alone
    #[arg(long)]
    pub ping: bool,

    /// Sweep slowly to avoid tripping switch port security
    #[arg(long)]
    pub slow: bool,

    /// Concurrent probes
    #[arg(long, default_value_t = 16)]
    pub threads: u32,

    /// The invoking process already holds the scan lock
    #[arg(long, hide = true)]
    pub locked: bool,
}
