//! Applying and validating DHCP server configuration.

use async_trait::async_trait;
use std::fmt::Write as _;
use std::path::PathBuf;
use thiserror::Error;
use tracing::info;

use crate::rpc::messages::{ConfigureDhcpRequest, DhcpValidationError};

#[derive(Debug, Error)]
pub enum DhcpError {
    #[error("cannot write DHCP configuration: {0}")]
    Write(#[from] std::io::Error),
    #[error("cannot restart DHCP server: {0}")]
    Restart(String),
    #[error("cannot run the DHCP configuration check: {0}")]
    Validate(String),
}

/// The DHCP server under this rack's control, one instance per IP version.
#[async_trait]
pub trait DhcpService: Send + Sync {
    async fn configure_v4(&self, config: &ConfigureDhcpRequest) -> Result<(), DhcpError>;
    async fn configure_v6(&self, config: &ConfigureDhcpRequest) -> Result<(), DhcpError>;
    async fn validate(
        &self,
        config: &ConfigureDhcpRequest,
        v6: bool,
    ) -> Result<Vec<DhcpValidationError>, DhcpError>;
}

/// Drives isc-dhcp-server: render the configuration, write it atomically,
/// restart (or stop, when there is nothing to serve) the matching unit.
pub struct IscDhcpService {
    config_dir: PathBuf,
}

impl IscDhcpService {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    async fn apply(&self, config: &ConfigureDhcpRequest, v6: bool) -> Result<(), DhcpError> {
        let suffix = if v6 { "dhcpd6" } else { "dhcpd" };
        let path = self.config_dir.join(format!("{suffix}.conf"));
        let rendered = render(config, v6);
        let tmp = path.with_extension("conf.tmp");
        tokio::fs::write(&tmp, &rendered).await?;
        tokio::fs::rename(&tmp, &path).await?;

        let unit = if v6 { "isc-dhcp-server6" } else { "isc-dhcp-server" };
        let serving = config.shared_networks.iter().any(|n| !n.subnets.is_empty());
        let verb = if serving { "restart" } else { "stop" };
        let output = tokio::process::Command::new("systemctl")
            .args([verb, unit])
            .output()
            .await
            .map_err(|e| DhcpError::Restart(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DhcpError::Restart(stderr.trim().to_string()));
        }
        info!(unit, verb, interfaces = config.interfaces.len(), "DHCP reconfigured");
        Ok(())
    }
}

#[async_trait]
impl DhcpService for IscDhcpService {
    async fn configure_v4(&self, config: &ConfigureDhcpRequest) -> Result<(), DhcpError> {
        self.apply(config, false).await
    }

    async fn configure_v6(&self, config: &ConfigureDhcpRequest) -> Result<(), DhcpError> {
        self.apply(config, true).await
    }

    async fn validate(
        &self,
        config: &ConfigureDhcpRequest,
        v6: bool,
    ) -> Result<Vec<DhcpValidationError>, DhcpError> {
        let rendered = render(config, v6);
        let tmp = tempfile::NamedTempFile::new().map_err(DhcpError::Write)?;
        tokio::fs::write(tmp.path(), &rendered).await?;
        let output = tokio::process::Command::new("dhcpd")
            .arg(if v6 { "-6" } else { "-4" })
            .arg("-t")
            .arg("-cf")
            .arg(tmp.path())
            .output()
            .await
            .map_err(|e| DhcpError::Validate(e.to_string()))?;
        if output.status.success() {
            return Ok(Vec::new());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_dhcpd_errors(&stderr))
    }
}

/// `dhcpd -t` reports problems as `<file> line <n>: <message>` on stderr,
/// interleaved with banner noise that has no such shape.
pub fn parse_dhcpd_errors(stderr: &str) -> Vec<DhcpValidationError> {
    let mut errors = Vec::new();
    for line in stderr.lines() {
        let Some((location, message)) = line.split_once(": ") else {
            continue;
        };
        let Some((file, line_no)) = location.rsplit_once(" line ") else {
            continue;
        };
        let Ok(line_no) = line_no.parse::<u32>() else {
            continue;
        };
        errors.push(DhcpValidationError {
            file: Some(file.to_string()),
            line: Some(line_no),
            message: message.to_string(),
        });
    }
    if errors.is_empty() && !stderr.trim().is_empty() {
        errors.push(DhcpValidationError {
            file: None,
            line: None,
            message: stderr.trim().to_string(),
        });
    }
    errors
}

/// Minimal dhcpd.conf rendering; enough structure for `dhcpd -t` to judge.
pub fn render(config: &ConfigureDhcpRequest, v6: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# generated by rackline; do not edit");
    let _ = writeln!(out, "authoritative;");
    let _ = writeln!(
        out,
        "omapi-port {}; key omapi_key {{ algorithm hmac-md5; secret \"{}\"; }};",
        if v6 { 7912 } else { 7911 },
        config.shared_key
    );
    for snippet in &config.global_dhcp_snippets {
        let _ = writeln!(out, "# snippet: {}", snippet.name);
        let _ = writeln!(out, "{}", snippet.value);
    }
    for peer in &config.failover_peers {
        let _ = writeln!(out, "failover peer \"{}\" {{", peer.name);
        let _ = writeln!(out, "  {};", peer.mode);
        let _ = writeln!(out, "  address {};", peer.address);
        let _ = writeln!(out, "  peer address {};", peer.peer_address);
        let _ = writeln!(out, "}}");
    }
    for network in &config.shared_networks {
        let _ = writeln!(out, "shared-network \"{}\" {{", network.name);
        for subnet in &network.subnets {
            if v6 {
                let _ = writeln!(out, "  subnet6 {} {{", subnet.subnet_cidr);
            } else {
                let _ = writeln!(
                    out,
                    "  subnet {} netmask {} {{",
                    subnet.subnet, subnet.subnet_mask
                );
                let _ = writeln!(out, "    option routers {};", subnet.router_ip);
                let _ = writeln!(out, "    option broadcast-address {};", subnet.broadcast_ip);
            }
            if !subnet.dns_servers.is_empty() {
                let option = if v6 { "dhcp6.name-servers" } else { "domain-name-servers" };
                let _ = writeln!(out, "    option {option} {};", subnet.dns_servers.join(", "));
            }
            let _ = writeln!(out, "    option domain-name \"{}\";", subnet.domain_name);
            for pool in &subnet.pools {
                let _ = writeln!(out, "    pool {{");
                if let Some(peer) = &pool.failover_peer {
                    let _ = writeln!(out, "      failover peer \"{peer}\";");
                }
                let _ = writeln!(out, "      range {} {};", pool.ip_range_low, pool.ip_range_high);
                let _ = writeln!(out, "    }}");
            }
            let _ = writeln!(out, "  }}");
        }
        let _ = writeln!(out, "}}");
    }
    for host in &config.hosts {
        let _ = writeln!(
            out,
            "host {} {{ hardware ethernet {}; fixed-address {}; }}",
            host.host, host.mac, host.ip
        );
    }
    out
}
