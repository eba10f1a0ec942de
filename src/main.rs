//! Rackline - unified CLI entrypoint.
//!
//! Usage:
//!   rackline start --config /etc/rackline/rackline.toml
//!   rackline scan eth0
//!   rackline scan 10.0.0.0/24 --ping

use anyhow::Result;
use clap::Parser;
use rackline::cli::commands::{run_scan, run_start};
use rackline::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Scan(args) => run_scan(args).await,
    }
}
