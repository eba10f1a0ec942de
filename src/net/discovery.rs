//! Region endpoint discovery.
//!
//! Each configured region URL is resolved to every address its hostname
//! carries, and `GET /rpc/` is issued against every candidate concurrently.
//! The responses advertise the region's event loops and their listening
//! addresses; the maps from all reachable candidates are merged. When no
//! configured URL yields anything, the last-known-good URLs persisted on disk
//! are tried the same way.

use reqwest::Url;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::lookup_host;
use tracing::{debug, warn};

use crate::util::peers::SavedPeerState;

/// Name of one region event loop, e.g. `region-1:pid=1234`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventLoopId(pub String);

impl std::fmt::Display for EventLoopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Deserialize)]
struct RpcInfo {
    eventloops: HashMap<String, Vec<(IpAddr, u16)>>,
}

pub struct Discovery {
    client: reqwest::Client,
    region_urls: Vec<String>,
    peers: Arc<SavedPeerState>,
}

impl Discovery {
    pub fn new(region_urls: Vec<String>, peers: Arc<SavedPeerState>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            region_urls,
            peers,
        })
    }

    /// One discovery pass. `None` means nothing answered anywhere, including
    /// the saved fallback.
    pub async fn discover(&self) -> Option<HashMap<EventLoopId, Vec<SocketAddr>>> {
        if let Some(map) = self.fetch_all(&self.region_urls).await {
            return Some(map);
        }
        let saved = self.peers.load();
        if saved.is_empty() {
            return None;
        }
        debug!(urls = saved.len(), "configured URLs failed, trying saved peers");
        self.fetch_all(&saved).await
    }

    async fn fetch_all(&self, urls: &[String]) -> Option<HashMap<EventLoopId, Vec<SocketAddr>>> {
        let mut candidates = Vec::new();
        for url in urls {
            match resolve_candidates(url).await {
                Ok(resolved) => candidates.extend(resolved),
                Err(err) => warn!(url, %err, "cannot resolve region URL"),
            }
        }
        if candidates.is_empty() {
            return None;
        }
        let fetches = candidates
            .iter()
            .map(|candidate| self.fetch_one(candidate.clone()));
        let mut merged: HashMap<EventLoopId, Vec<SocketAddr>> = HashMap::new();
        let mut any = false;
        for result in futures::future::join_all(fetches).await {
            if let Some(info) = result {
                any = true;
                for (name, addrs) in info.eventloops {
                    let addrs = addrs
                        .into_iter()
                        .map(|(ip, port)| SocketAddr::new(canonical_ip(ip), port))
                        .collect();
                    merged.insert(EventLoopId(name), addrs);
                }
            }
        }
        any.then_some(merged)
    }

    async fn fetch_one(&self, candidate: Url) -> Option<RpcInfo> {
        let response = match self.client.get(candidate.clone()).send().await {
            Ok(r) => r,
            Err(err) => {
                debug!(url = %candidate, %err, "RPC info request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            debug!(url = %candidate, status = %response.status(), "RPC info request rejected");
            return None;
        }
        match response.json::<RpcInfo>().await {
            Ok(info) => Some(info),
            Err(err) => {
                warn!(url = %candidate, %err, "RPC info response is malformed");
                None
            }
        }
    }
}

/// Resolve a region URL's host to concrete `/rpc/` endpoint URLs, one per
/// address, IPv6 first.
async fn resolve_candidates(url: &str) -> anyhow::Result<Vec<Url>> {
    let parsed = Url::parse(url)?;
    let host = parsed
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("region URL '{url}' has no host"))?;
    let port = parsed.port().unwrap_or(5240);
    let mut addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => lookup_host((host, port))
            .await?
            .map(|sa| sa.ip())
            .collect(),
    };
    addrs.sort_by_key(|ip| ip.is_ipv4());
    addrs.dedup();
    let mut out = Vec::with_capacity(addrs.len());
    for ip in addrs {
        let mut candidate = parsed.clone();
        let host = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        candidate
            .set_host(Some(&host))
            .map_err(|e| anyhow::anyhow!("rewrite host in '{url}': {e}"))?;
        candidate.set_path("/rpc/");
        out.push(candidate);
    }
    Ok(out)
}

/// Collapse IPv4-mapped IPv6 addresses so the same endpoint never appears
/// under two spellings.
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_hosts_resolve_without_dns() {
        let candidates = resolve_candidates("http://10.1.2.3:5240/").await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].as_str(), "http://10.1.2.3:5240/rpc/");
    }

    #[tokio::test]
    async fn ipv6_literals_keep_brackets() {
        let candidates = resolve_candidates("http://[::1]:5240/").await.unwrap();
        assert_eq!(candidates[0].as_str(), "http://[::1]:5240/rpc/");
    }

    #[tokio::test]
    async fn missing_port_defaults_to_5240() {
        let candidates = resolve_candidates("http://127.0.0.1/").await.unwrap();
        // reqwest::Url keeps the URL portless; the default matters only for
        // DNS lookups, the advertised eventloop ports drive connections.
        assert_eq!(candidates[0].host_str(), Some("127.0.0.1"));
    }

    #[test]
    fn mapped_v4_is_canonicalized() {
        let mapped: IpAddr = "::ffff:192.0.2.1".parse().unwrap();
        assert_eq!(canonical_ip(mapped), "192.0.2.1".parse::<IpAddr>().unwrap());
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(canonical_ip(v6), v6);
    }

    #[tokio::test]
    async fn rejects_urls_without_host() {
        assert!(resolve_candidates("file:///nope").await.is_err());
    }
}
