//! Chassis enlistment: probing a management controller for the machines it
//! fronts.
//!
//! The RPC layer validates the request against the chassis type's argument
//! contract, acks, and runs the probe in the background; probe failures are
//! logged, never sent back.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::rpc::messages::AddChassisRequest;

#[derive(Debug, Error)]
pub enum ChassisError {
    #[error("unknown chassis type '{0}'")]
    UnknownType(String),
    #[error("chassis type '{kind}' requires '{field}'")]
    MissingArgument { kind: String, field: String },
    #[error("probe failed: {0}")]
    ProbeFailed(String),
}

/// Probes one family of chassis and reports the machines found.
#[async_trait]
pub trait ChassisEnlister: Send + Sync {
    async fn enlist(&self, request: AddChassisRequest) -> Result<(), ChassisError>;
}

struct ChassisKind {
    needs_username: bool,
    needs_password: bool,
    needs_power_control: bool,
    enlister: Arc<dyn ChassisEnlister>,
}

/// The chassis types this rack knows how to probe, keyed by type name.
pub struct ChassisCatalog {
    kinds: BTreeMap<String, ChassisKind>,
}

impl ChassisCatalog {
    pub fn builtin() -> Self {
        let virsh: Arc<dyn ChassisEnlister> = Arc::new(VirshChassisEnlister);
        let mut kinds = BTreeMap::new();
        let mut add = |name: &str, username: bool, password: bool, power_control: bool| {
            kinds.insert(
                name.to_string(),
                ChassisKind {
                    needs_username: username,
                    needs_password: password,
                    needs_power_control: power_control,
                    enlister: virsh.clone(),
                },
            );
        };
        // virsh and powerkvm probe over libvirt; the password doubles as the
        // connection secret and may be absent for local sockets.
        add("virsh", false, false, false);
        add("powerkvm", false, false, false);
        add("vmware", true, true, false);
        add("recs_box", true, true, false);
        add("seamicro15k", true, true, true);
        add("mscm", true, true, false);
        add("msftocs", true, true, false);
        add("ucsm", true, true, false);
        Self { kinds }
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.kinds.keys().map(String::as_str).collect()
    }

    /// Check the request against its type's argument contract and return the
    /// prober to run.
    pub fn validate(
        &self,
        request: &AddChassisRequest,
    ) -> Result<Arc<dyn ChassisEnlister>, ChassisError> {
        let kind = self
            .kinds
            .get(&request.chassis_type)
            .ok_or_else(|| ChassisError::UnknownType(request.chassis_type.clone()))?;
        let missing = |field: &str| ChassisError::MissingArgument {
            kind: request.chassis_type.clone(),
            field: field.to_string(),
        };
        if kind.needs_username && request.username.as_deref().unwrap_or("").is_empty() {
            return Err(missing("username"));
        }
        if kind.needs_password && request.password.as_deref().unwrap_or("").is_empty() {
            return Err(missing("password"));
        }
        if kind.needs_power_control && request.power_control.as_deref().unwrap_or("").is_empty() {
            return Err(missing("power_control"));
        }
        Ok(kind.enlister.clone())
    }
}

/// Lists libvirt domains on the chassis host. Actual enlistment of the
/// discovered machines happens region-side; this end only reports them.
struct VirshChassisEnlister;

#[async_trait]
impl ChassisEnlister for VirshChassisEnlister {
    async fn enlist(&self, request: AddChassisRequest) -> Result<(), ChassisError> {
        let uri = format!("qemu+ssh://{}/system", request.hostname);
        let output = tokio::process::Command::new("virsh")
            .args(["-c", &uri, "list", "--all", "--name"])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ChassisError::ProbeFailed(format!("cannot run virsh: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ChassisError::ProbeFailed(stderr.trim().to_string()));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        for domain in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(prefix) = &request.prefix_filter {
                if !domain.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            info!(chassis = %request.hostname, %domain, "found machine on chassis");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(chassis_type: &str) -> AddChassisRequest {
        AddChassisRequest {
            user: "admin".into(),
            chassis_type: chassis_type.into(),
            hostname: "chassis.example".into(),
            username: None,
            password: None,
            accept_all: false,
            domain: None,
            prefix_filter: None,
            power_control: None,
            port: None,
            protocol: None,
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let catalog = ChassisCatalog::builtin();
        assert!(matches!(
            catalog.validate(&request("warp-core")),
            Err(ChassisError::UnknownType(_))
        ));
    }

    #[test]
    fn virsh_needs_no_credentials() {
        let catalog = ChassisCatalog::builtin();
        catalog.validate(&request("virsh")).unwrap();
    }

    #[test]
    fn vmware_needs_credentials() {
        let catalog = ChassisCatalog::builtin();
        assert!(matches!(
            catalog.validate(&request("vmware")),
            Err(ChassisError::MissingArgument { field, .. }) if field == "username"
        ));
        let mut req = request("vmware");
        req.username = Some("root".into());
        req.password = Some("s3cret".into());
        catalog.validate(&req).unwrap();
    }

    #[test]
    fn seamicro_needs_power_control() {
        let catalog = ChassisCatalog::builtin();
        let mut req = request("seamicro15k");
        req.username = Some("admin".into());
        req.password = Some("s3cret".into());
        assert!(matches!(
            catalog.validate(&req),
            Err(ChassisError::MissingArgument { field, .. }) if field == "power_control"
        ));
        req.power_control = Some("ipmi".into());
        catalog.validate(&req).unwrap();
    }
}
