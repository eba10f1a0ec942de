//! Network scanning, delegated to the scanner subprocess.
//!
//! The scan walks attached subnets looking for hosts the region does not
//! know about. It runs as a child process so a runaway sweep can be killed
//! without touching the service, and so the `scan` CLI subcommand and the
//! RPC path share one implementation.

use thiserror::Error;
use tracing::{info, warn};

use crate::rpc::messages::ScanNetworksRequest;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("a scan must name an interface, CIDRs, or ask for everything")]
    NothingToScan,
    #[error("cannot run the scanner: {0}")]
    Spawn(std::io::Error),
    #[error("scanner exited with {0}")]
    Failed(std::process::ExitStatus),
}

/// Translate a scan request into scanner arguments.
///
/// An interface with no CIDRs scans everything on that interface; CIDRs with
/// no interface scan those ranges wherever they are attached; both together
/// restrict the ranges to the interface. `scan_all` overrides the rest.
pub fn scan_args(request: &ScanNetworksRequest) -> Result<Vec<String>, ScanError> {
    let mut args = vec!["scan".to_string()];
    if request.force_ping {
        args.push("--ping".into());
    }
    if request.slow {
        args.push("--slow".into());
    }
    if let Some(threads) = request.threads {
        args.push("--threads".into());
        args.push(threads.to_string());
    }
    if request.scan_all {
        return Ok(args);
    }
    let cidrs = request.cidrs.as_deref().unwrap_or(&[]);
    match (&request.interface, cidrs.is_empty()) {
        (None, true) => return Err(ScanError::NothingToScan),
        (Some(interface), _) => args.push(interface.clone()),
        (None, false) => {}
    }
    args.extend(cidrs.iter().cloned());
    Ok(args)
}

pub struct NetworkScanner {
    command: String,
}

impl NetworkScanner {
    pub fn new(command: String) -> Self {
        Self { command }
    }

    /// Run one scan to completion.
    ///
    /// The caller is expected to hold the `scan-networks` lock already, so
    /// the child is told to skip taking it. Its stdout (the live-host list)
    /// is discarded; stderr is kept for the failure log.
    pub async fn scan(&self, request: &ScanNetworksRequest) -> Result<(), ScanError> {
        let mut args = scan_args(request)?;
        args.insert(1, "--locked".into());
        info!(command = %self.command, ?args, "starting network scan");
        let output = tokio::process::Command::new(&self.command)
            .args(&args)
            .stdout(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ScanError::Spawn)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(status = %output.status, stderr = %stderr.trim(), "network scan failed");
            return Err(ScanError::Failed(output.status));
        }
        Ok(())
    }
}
