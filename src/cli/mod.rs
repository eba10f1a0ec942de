//! Rackline CLI - unified command-line interface.
//!
//! Provides a single binary entry point for:
//! - `rackline start` - Run the region link service
//! - `rackline scan` - Sweep attached networks for live hosts

mod args;
pub mod commands;

pub use args::{Cli, Commands, ScanArgs, StartArgs};
