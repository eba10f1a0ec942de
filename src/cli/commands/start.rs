//! Start command - launches the rack controller service.

use anyhow::Result;
use std::env;

use crate::cli::args::StartArgs;
use crate::core::config::Config;
use crate::core::runtime;
use crate::ops::telemetry;

pub async fn run_start(args: StartArgs) -> Result<()> {
    // Route the path through the environment so Config::load_from_env and
    // anything re-executing the binary agree on it.
    env::set_var("RACKLINE_CONFIG", args.config.display().to_string());

    let config = Config::load_from_env()?;
    telemetry::init_tracing(None)?;
    runtime::run(config).await
}
