//! The catalog of operations exchanged with the region, their argument and
//! result shapes, and the structured fault taxonomy.
//!
//! Payloads are JSON; binary fields (authentication message, salt, digest,
//! keyring data) travel as base64 strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Operation identifiers carried in the `command` field of a request frame.
///
/// The wire form is the kebab-case name; unknown names fail to parse and are
/// answered with an `unknown-command` fault rather than dropping the
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    Ping,
    StartTls,
    Identify,
    Authenticate,
    Register,
    ListBootImages,
    ListBootImagesV2,
    ImportBootImages,
    IsImportBootImagesRunning,
    DescribePowerTypes,
    DescribeNosTypes,
    PowerOn,
    PowerOff,
    PowerCycle,
    PowerQuery,
    ConfigureDhcpv4,
    ConfigureDhcpv4V2,
    ConfigureDhcpv6,
    ConfigureDhcpv6V2,
    ValidateDhcpv4Config,
    ValidateDhcpv4ConfigV2,
    ValidateDhcpv6Config,
    ValidateDhcpv6ConfigV2,
    EvaluateTag,
    RefreshRackControllerInfo,
    AddChassis,
    DiscoverPod,
    ComposeMachine,
    DecomposeMachine,
    ScanNetworks,
    DisableAndShutoffRackd,
    CheckIps,
}

impl Command {
    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(Value::String(name.to_string())).ok()
    }

    pub fn name(&self) -> String {
        match serde_json::to_value(self) {
            Ok(Value::String(s)) => s,
            _ => unreachable!("commands serialize to strings"),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Expected, typed failure conditions. Anything else is `Unhandled` and is
/// logged with a trace on the side where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    UnknownCommand,
    UnknownPowerType,
    PowerActionFail,
    PowerActionAlreadyInProgress,
    CannotConfigureDhcp,
    RefreshAlreadyInProgress,
    ScanNetworksAlreadyInProgress,
    UnknownPodType,
    PodActionFail,
    CannotDisableAndShutoffRackd,
    RegistrationRejected,
    Unhandled,
}

/// A structured fault returned to the remote caller in place of a result.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Handshake operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub ident: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    #[serde(with = "b64")]
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    #[serde(with = "b64")]
    pub digest: Vec<u8>,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub system_id: String,
    pub hostname: String,
    pub interfaces: Value,
    pub url: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub system_id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub uuid: Option<String>,
}

// ---------------------------------------------------------------------------
// Boot images
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootImage {
    pub osystem: String,
    pub architecture: String,
    pub subarchitecture: String,
    pub release: String,
    pub label: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListBootImagesResponse {
    pub images: Vec<BootImage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSourceSelection {
    pub os: String,
    pub release: String,
    #[serde(default)]
    pub arches: Vec<String>,
    #[serde(default)]
    pub subarches: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    pub url: String,
    #[serde(with = "b64", default)]
    pub keyring_data: Vec<u8>,
    #[serde(default)]
    pub selections: Vec<BootSourceSelection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportBootImagesRequest {
    pub sources: Vec<BootSource>,
    #[serde(default)]
    pub http_proxy: Option<String>,
    #[serde(default)]
    pub https_proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsImportRunningResponse {
    pub running: bool,
}

// ---------------------------------------------------------------------------
// Power control
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerParams {
    pub system_id: String,
    pub hostname: String,
    pub power_type: String,
    #[serde(default)]
    pub context: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerQueryResponse {
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

// ---------------------------------------------------------------------------
// DHCP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverPeer {
    pub name: String,
    pub mode: String,
    pub address: String,
    pub peer_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpPool {
    pub ip_range_low: String,
    pub ip_range_high: String,
    #[serde(default)]
    pub failover_peer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpSubnet {
    pub subnet: String,
    pub subnet_mask: String,
    pub subnet_cidr: String,
    pub broadcast_ip: String,
    pub router_ip: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub ntp_servers: Vec<String>,
    pub domain_name: String,
    #[serde(default)]
    pub pools: Vec<DhcpPool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpSharedNetwork {
    pub name: String,
    #[serde(default)]
    pub subnets: Vec<DhcpSubnet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpHost {
    pub host: String,
    pub mac: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpSnippet {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureDhcpRequest {
    pub shared_key: String,
    #[serde(default)]
    pub failover_peers: Vec<FailoverPeer>,
    #[serde(default)]
    pub shared_networks: Vec<DhcpSharedNetwork>,
    #[serde(default)]
    pub hosts: Vec<DhcpHost>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub global_dhcp_snippets: Vec<DhcpSnippet>,
}

/// First-generation subnet shape: DNS servers are a single space-separated
/// string and there is no NTP server list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyDhcpSubnet {
    pub subnet: String,
    pub subnet_mask: String,
    pub subnet_cidr: String,
    pub broadcast_ip: String,
    pub router_ip: String,
    #[serde(default)]
    pub dns_servers: String,
    #[serde(default)]
    pub ntp_server: String,
    pub domain_name: String,
    #[serde(default)]
    pub pools: Vec<DhcpPool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyDhcpSharedNetwork {
    pub name: String,
    #[serde(default)]
    pub subnets: Vec<LegacyDhcpSubnet>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyConfigureDhcpRequest {
    pub shared_key: String,
    #[serde(default)]
    pub failover_peers: Vec<FailoverPeer>,
    #[serde(default)]
    pub shared_networks: Vec<LegacyDhcpSharedNetwork>,
    #[serde(default)]
    pub hosts: Vec<DhcpHost>,
    #[serde(default)]
    pub interfaces: Vec<String>,
    #[serde(default)]
    pub global_dhcp_snippets: Vec<DhcpSnippet>,
}

impl LegacyConfigureDhcpRequest {
    /// Upgrade the legacy shared-network shape to the current one.
    pub fn upgrade(self) -> ConfigureDhcpRequest {
        let shared_networks = self
            .shared_networks
            .into_iter()
            .map(|network| DhcpSharedNetwork {
                name: network.name,
                subnets: network
                    .subnets
                    .into_iter()
                    .map(|s| DhcpSubnet {
                        subnet: s.subnet,
                        subnet_mask: s.subnet_mask,
                        subnet_cidr: s.subnet_cidr,
                        broadcast_ip: s.broadcast_ip,
                        router_ip: s.router_ip,
                        dns_servers: s
                            .dns_servers
                            .split_whitespace()
                            .map(str::to_string)
                            .collect(),
                        ntp_servers: if s.ntp_server.is_empty() {
                            Vec::new()
                        } else {
                            vec![s.ntp_server]
                        },
                        domain_name: s.domain_name,
                        pools: s.pools,
                    })
                    .collect(),
            })
            .collect();
        ConfigureDhcpRequest {
            shared_key: self.shared_key,
            failover_peers: self.failover_peers,
            shared_networks,
            hosts: self.hosts,
            interfaces: self.interfaces,
            global_dhcp_snippets: self.global_dhcp_snippets,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpValidationError {
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateDhcpResponse {
    pub errors: Vec<DhcpValidationError>,
}

// ---------------------------------------------------------------------------
// Tags
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagNamespace {
    pub prefix: String,
    pub uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagNode {
    pub system_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateTagRequest {
    pub tag_name: String,
    pub tag_definition: String,
    #[serde(default)]
    pub tag_nsmap: Vec<TagNamespace>,
    pub credentials: String,
    #[serde(default)]
    pub nodes: Vec<TagNode>,
}

// ---------------------------------------------------------------------------
// Refresh
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub system_id: String,
    pub consumer_key: String,
    pub token_key: String,
    pub token_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub osystem: String,
    pub distro_series: String,
    pub architecture: String,
    pub interfaces: Value,
    pub version: String,
}

// ---------------------------------------------------------------------------
// Chassis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddChassisRequest {
    pub user: String,
    pub chassis_type: String,
    pub hostname: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub accept_all: bool,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub prefix_filter: Option<String>,
    #[serde(default)]
    pub power_control: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<String>,
}

// ---------------------------------------------------------------------------
// Pods
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodParams {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub pod_id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverPodResponse {
    pub pod: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeMachineRequest {
    #[serde(flatten)]
    pub pod: PodParams,
    pub request: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeMachineResponse {
    pub machine: Value,
    pub hints: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecomposeMachineResponse {
    pub hints: Value,
}

// ---------------------------------------------------------------------------
// Network scanning and address checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanNetworksRequest {
    #[serde(default)]
    pub scan_all: bool,
    #[serde(default)]
    pub force_ping: bool,
    #[serde(default)]
    pub slow: bool,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub cidrs: Option<Vec<String>>,
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpCheck {
    pub ip_address: String,
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckIpsRequest {
    pub ip_addresses: Vec<IpCheck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckedIp {
    pub ip_address: String,
    #[serde(default)]
    pub interface: Option<String>,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckIpsResponse {
    pub ip_addresses: Vec<CheckedIp>,
}
