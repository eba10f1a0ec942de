//! Scan command - sweep attached networks for live hosts.
//!
//! This is both an operator tool and the subprocess the RPC `scan-networks`
//! handler launches. Live hosts go to stdout, one address per line; the
//! kernel's neighbour table picks up their MACs as a side effect of the
//! probes.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::cli::args::ScanArgs;
use crate::core::config::PathConfig;
use crate::util::lock::{LockError, NamedLock};

/// A /16 already means 65k probes; anything wider is a typo.
const WIDEST_PREFIX: u32 = 16;

pub async fn run_scan(args: ScanArgs) -> Result<()> {
    if args.locked {
        // The parent process already holds the scan lock on our behalf.
        scan(args).await
    } else {
        scan_exclusively(args, &PathConfig::default().lock_dir).await
    }
}

/// Take the host-wide scan lock, so an operator invocation and a
/// region-initiated scan cannot sweep the same networks at once.
async fn scan_exclusively(args: ScanArgs, lock_dir: &Path) -> Result<()> {
    let lock = NamedLock::new(lock_dir, "scan-networks")?;
    let _guard = match lock.try_acquire() {
        Ok(guard) => guard,
        Err(LockError::NotAvailable(_)) => bail!("a network scan is already in progress"),
        Err(err) => return Err(err.into()),
    };
    scan(args).await
}

async fn scan(args: ScanArgs) -> Result<()> {
    let mut cidrs = args.cidrs.clone();
    if let Some(interface) = &args.interface {
        if looks_like_cidr(interface) {
            // `rackline scan 10.0.0.0/24` puts the CIDR in the interface slot.
            cidrs.insert(0, interface.clone());
        } else if cidrs.is_empty() {
            cidrs = interface_cidrs(interface).await?;
            if cidrs.is_empty() {
                bail!("interface '{interface}' has no IPv4 addresses to scan");
            }
        }
    }
    if cidrs.is_empty() {
        bail!("nothing to scan: give an interface or one or more CIDRs");
    }

    let mut targets = Vec::new();
    for cidr in &cidrs {
        targets.extend(expand_cidr(cidr)?);
    }

    let concurrency = if args.slow { 1 } else { args.threads.max(1) as usize };
    let pause = args.slow.then_some(Duration::from_millis(50));
    let mut probes = stream::iter(targets)
        .map(|ip| async move {
            if let Some(pause) = pause {
                tokio::time::sleep(pause).await;
            }
            (ip, ping(ip).await)
        })
        .buffer_unordered(concurrency);
    while let Some((ip, alive)) = probes.next().await {
        if alive {
            println!("{ip}");
        }
    }
    Ok(())
}

fn looks_like_cidr(value: &str) -> bool {
    value.contains('/')
}

async fn ping(ip: Ipv4Addr) -> bool {
    tokio::process::Command::new("ping")
        .args(["-c", "1", "-w", "1", &ip.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

/// IPv4 networks attached to `interface`, as CIDRs.
async fn interface_cidrs(interface: &str) -> Result<Vec<String>> {
    let output = tokio::process::Command::new("ip")
        .args(["--json", "addr", "show", "dev", interface])
        .output()
        .await
        .context("cannot run ip addr")?;
    if !output.status.success() {
        bail!("no such interface '{interface}'");
    }
    let parsed: Value = serde_json::from_slice(&output.stdout).context("parse ip addr output")?;
    let mut cidrs = Vec::new();
    for link in parsed.as_array().into_iter().flatten() {
        for info in link["addr_info"].as_array().into_iter().flatten() {
            let (Some(local), Some(prefix)) =
                (info["local"].as_str(), info["prefixlen"].as_u64())
            else {
                continue;
            };
            if local.parse::<Ipv4Addr>().is_ok() {
                cidrs.push(format!("{local}/{prefix}"));
            }
        }
    }
    Ok(cidrs)
}

/// Host addresses of an IPv4 CIDR, excluding network and broadcast.
fn expand_cidr(cidr: &str) -> Result<Vec<Ipv4Addr>> {
    let (addr, prefix) = cidr
        .split_once('/')
        .with_context(|| format!("'{cidr}' is not a CIDR"))?;
    let addr: Ipv4Addr = addr
        .parse()
        .with_context(|| format!("'{cidr}' has an invalid address"))?;
    let prefix: u32 = prefix
        .parse()
        .with_context(|| format!("'{cidr}' has an invalid prefix length"))?;
    if prefix > 32 {
        bail!("'{cidr}' has an invalid prefix length");
    }
    if prefix < WIDEST_PREFIX {
        bail!("'{cidr}' is wider than /{WIDEST_PREFIX}; scan it in pieces");
    }
    let base = u32::from(addr) & prefix_mask(prefix);
    let size = 1u32 << (32 - prefix);
    let hosts = match size {
        1 => return Ok(vec![addr]),
        2 => (0..2).collect::<Vec<u32>>(),
        _ => (1..size - 1).collect(),
    };
    Ok(hosts.into_iter().map(|i| Ipv4Addr::from(base + i)).collect())
}

fn prefix_mask(prefix: u32) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_a_small_subnet() {
        let hosts = expand_cidr("192.168.1.0/30").unwrap();
        assert_eq!(
            hosts,
            vec![
                Ipv4Addr::new(192, 168, 1, 1),
                Ipv4Addr::new(192, 168, 1, 2),
            ]
        );
    }

    #[test]
    fn single_host_cidr_is_itself() {
        assert_eq!(
            expand_cidr("10.0.0.7/32").unwrap(),
            vec![Ipv4Addr::new(10, 0, 0, 7)]
        );
    }

    #[test]
    fn normalizes_to_the_network_base() {
        let hosts = expand_cidr("10.0.0.77/29").unwrap();
        assert_eq!(hosts.first().copied(), Some(Ipv4Addr::new(10, 0, 0, 73)));
        assert_eq!(hosts.len(), 6);
    }

    #[test]
    fn refuses_wide_and_malformed_cidrs() {
        assert!(expand_cidr("10.0.0.0/8").is_err());
        assert!(expand_cidr("10.0.0.0").is_err());
        assert!(expand_cidr("10.0.0.0/40").is_err());
        assert!(expand_cidr("not-an-ip/24").is_err());
    }

    #[tokio::test]
    async fn concurrent_scan_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let lock = NamedLock::new(dir.path(), "scan-networks").unwrap();
        let _guard = lock.try_acquire().unwrap();

        let args = ScanArgs {
            interface: None,
            cidrs: vec!["192.0.2.0/30".into()],
            ping: false,
            slow: false,
            threads: 1,
            locked: false,
        };
        let err = scan_exclusively(args, dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("already in progress"));
    }
}
