//! Introspection of the host the rack controller runs on.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::rpc::messages::SystemInfo;

#[async_trait]
pub trait SystemInfoSource: Send + Sync {
    async fn collect(&self) -> SystemInfo;
}

pub struct HostSystemInfo {
    version: String,
}

impl HostSystemInfo {
    pub fn new(version: String) -> Self {
        Self { version }
    }
}

#[async_trait]
impl SystemInfoSource for HostSystemInfo {
    async fn collect(&self) -> SystemInfo {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        let (osystem, distro_series) = read_os_release(
            &tokio::fs::read_to_string("/etc/os-release")
                .await
                .unwrap_or_default(),
        );
        SystemInfo {
            hostname,
            osystem,
            distro_series,
            architecture: debian_architecture(),
            interfaces: interfaces().await,
            version: self.version.clone(),
        }
    }
}

/// `ID` and `VERSION_CODENAME` from os-release(5), empty when absent.
pub fn read_os_release(text: &str) -> (String, String) {
    let mut id = String::new();
    let mut codename = String::new();
    for line in text.lines() {
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim_matches('"').to_string();
            match key {
                "ID" => id = value,
                "VERSION_CODENAME" => codename = value,
                _ => {}
            }
        }
    }
    (id, codename)
}

fn debian_architecture() -> String {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "powerpc64" => "ppc64el",
        "s390x" => "s390x",
        "x86" => "i386",
        other => other,
    };
    format!("{arch}/generic")
}

/// Interface inventory as `ip --json addr` reports it, reshaped to
/// name -> {mac, addresses}.
async fn interfaces() -> Value {
    let output = match tokio::process::Command::new("ip")
        .args(["--json", "addr"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => output.stdout,
        Ok(output) => {
            warn!(status = %output.status, "ip addr failed");
            return json!({});
        }
        Err(err) => {
            warn!(%err, "cannot run ip addr");
            return json!({});
        }
    };
    match serde_json::from_slice::<Value>(&output) {
        Ok(parsed) => reshape_interfaces(&parsed),
        Err(err) => {
            warn!(%err, "cannot parse ip addr output");
            json!({})
        }
    }
}

pub fn reshape_interfaces(parsed: &Value) -> Value {
    let mut out = serde_json::Map::new();
    for link in parsed.as_array().into_iter().flatten() {
        let Some(name) = link["ifname"].as_str() else {
            continue;
        };
        if name == "lo" {
            continue;
        }
        let addresses: Vec<String> = link["addr_info"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|info| {
                let local = info["local"].as_str()?;
                let prefix = info["prefixlen"].as_u64()?;
                Some(format!("{local}/{prefix}"))
            })
            .collect();
        out.insert(
            name.to_string(),
            json!({
                "mac_address": link["address"].as_str().unwrap_or(""),
                "enabled": link["operstate"].as_str() == Some("UP"),
                "links": addresses,
            }),
        );
    }
    Value::Object(out)
}
