//! Pod (composable hardware) driver contract and registry.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PodError(pub String);

/// A composed machine plus the updated capacity hints for its pod.
pub struct Composed {
    pub machine: Value,
    pub hints: Value,
}

/// A hypervisor or similar resource pool that machines can be composed on.
#[async_trait]
pub trait PodDriver: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn schema(&self) -> Value;
    async fn discover(&self, context: &Value) -> Result<Value, PodError>;
    async fn compose(&self, context: &Value, request: &Value) -> Result<Composed, PodError>;
    async fn decompose(&self, context: &Value) -> Result<Value, PodError>;
}

pub struct PodDriverRegistry {
    drivers: BTreeMap<String, Arc<dyn PodDriver>>,
}

impl PodDriverRegistry {
    pub fn new(drivers: Vec<Arc<dyn PodDriver>>) -> Self {
        Self {
            drivers: drivers
                .into_iter()
                .map(|d| (d.name().to_string(), d))
                .collect(),
        }
    }

    pub fn builtin() -> Self {
        Self::new(vec![Arc::new(VirshPodDriver)])
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PodDriver>> {
        self.drivers.get(name).cloned()
    }

    pub fn describe(&self) -> Vec<Value> {
        self.drivers
            .values()
            .map(|d| {
                json!({
                    "name": d.name(),
                    "description": d.description(),
                    "fields": d.schema(),
                })
            })
            .collect()
    }
}

/// Libvirt pods addressed by connection URI.
pub struct VirshPodDriver;

impl VirshPodDriver {
    fn uri(context: &Value) -> Result<String, PodError> {
        context
            .get("power_address")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| PodError("missing libvirt connection URI".into()))
    }

    async fn virsh(&self, context: &Value, args: &[&str]) -> Result<String, PodError> {
        let uri = Self::uri(context)?;
        let output = tokio::process::Command::new("virsh")
            .arg("-c")
            .arg(&uri)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PodError(format!("cannot run virsh: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PodError(format!("virsh failed: {}", stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl PodDriver for VirshPodDriver {
    fn name(&self) -> &str {
        "virsh"
    }

    fn description(&self) -> &str {
        "Virsh (virtual systems)"
    }

    fn schema(&self) -> Value {
        json!([
            {"name": "power_address", "label": "Address", "required": true},
            {"name": "power_pass", "label": "Password", "required": false},
        ])
    }

    async fn discover(&self, context: &Value) -> Result<Value, PodError> {
        let nodeinfo = self.virsh(context, &["nodeinfo"]).await?;
        let mut cores = 0u64;
        let mut memory_kib = 0u64;
        for line in nodeinfo.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let value = value.trim();
                match key.trim() {
                    "CPU(s)" => cores = value.parse().unwrap_or(0),
                    "Memory size" => {
                        memory_kib = value
                            .split_whitespace()
                            .next()
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(0);
                    }
                    _ => {}
                }
            }
        }
        Ok(json!({
            "cores": cores,
            "memory": memory_kib / 1024,
            "capabilities": ["composable", "dynamic_local_storage"],
        }))
    }

    async fn compose(&self, _context: &Value, _request: &Value) -> Result<Composed, PodError> {
        // Defining new domains needs the full XML templating pipeline, which
        // lives region-side. TODO: grow a compose path once the region sends
        // storage layouts down with the request.
        Err(PodError("virsh pods cannot compose machines yet".into()))
    }

    async fn decompose(&self, context: &Value) -> Result<Value, PodError> {
        let name = context
            .get("node_name")
            .and_then(Value::as_str)
            .ok_or_else(|| PodError("missing domain name to decompose".into()))?;
        self.virsh(context, &["destroy", name]).await.ok();
        self.virsh(context, &["undefine", "--remove-all-storage", name])
            .await?;
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lookup_and_catalog() {
        let registry = PodDriverRegistry::builtin();
        assert!(registry.get("virsh").is_some());
        assert!(registry.get("lxd-next").is_none());
        let described = registry.describe();
        assert_eq!(described[0]["name"], "virsh");
    }

    #[test]
    fn virsh_needs_a_uri() {
        assert!(VirshPodDriver::uri(&json!({})).is_err());
        assert_eq!(
            VirshPodDriver::uri(&json!({"power_address": "qemu+ssh://host/system"})).unwrap(),
            "qemu+ssh://host/system"
        );
    }
}
