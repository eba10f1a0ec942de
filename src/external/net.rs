//! Address-in-use probing for `check-ips`.
//!
//! Each candidate address is pinged once; the neighbour table is then
//! consulted for the MAC of whoever answered. Both steps are best-effort:
//! a dead subprocess marks the address unused rather than failing the batch.

use std::collections::HashMap;
use tracing::debug;

use crate::rpc::messages::{CheckIpsRequest, CheckIpsResponse, CheckedIp};

pub async fn check_ips(request: &CheckIpsRequest) -> CheckIpsResponse {
    let probes = request.ip_addresses.iter().map(|check| async move {
        let used = ping_once(&check.ip_address, check.interface.as_deref()).await;
        (check, used)
    });
    let results = futures::future::join_all(probes).await;

    let neighbours = neighbour_table().await;
    let ip_addresses = results
        .into_iter()
        .map(|(check, used)| CheckedIp {
            ip_address: check.ip_address.clone(),
            interface: check.interface.clone(),
            used,
            mac_address: used
                .then(|| neighbours.get(&check.ip_address).cloned())
                .flatten(),
        })
        .collect();
    CheckIpsResponse { ip_addresses }
}

async fn ping_once(ip: &str, interface: Option<&str>) -> bool {
    let mut command = tokio::process::Command::new("ping");
    command.args(["-c", "1", "-w", "1"]);
    if let Some(interface) = interface {
        command.args(["-I", interface]);
    }
    command.arg(ip);
    match command.kill_on_drop(true).status().await {
        Ok(status) => status.success(),
        Err(err) => {
            debug!(ip, %err, "cannot run ping");
            false
        }
    }
}

async fn neighbour_table() -> HashMap<String, String> {
    match tokio::process::Command::new("ip")
        .args(["neigh", "show"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            parse_neighbours(&String::from_utf8_lossy(&output.stdout))
        }
        _ => HashMap::new(),
    }
}

/// `ip neigh show` lines look like
/// `10.0.0.7 dev eth0 lladdr 52:54:00:aa:bb:cc REACHABLE`; FAILED entries
/// have no lladdr and are skipped.
pub fn parse_neighbours(output: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(ip) = fields.first() else { continue };
        if let Some(pos) = fields.iter().position(|f| *f == "lladdr") {
            if let Some(mac) = fields.get(pos + 1) {
                table.insert((*ip).to_string(), (*mac).to_string());
            }
        }
    }
    table
}
