//! Power driver contract and registry.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command as Process;

#[derive(Debug, Error)]
pub enum PowerError {
    #[error("{0}")]
    ActionFail(String),
    #[error("power type '{0}' does not support queries")]
    NotQueryable(String),
}

/// One BMC protocol. Implementations do the blocking or remote work however
/// they like; callers only see the `(context) -> result` contract.
#[async_trait]
pub trait PowerDriver: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Settings schema advertised to the region for its UI.
    fn schema(&self) -> Value;
    fn queryable(&self) -> bool {
        true
    }
    async fn power_on(&self, system_id: &str, context: &Value) -> Result<(), PowerError>;
    async fn power_off(&self, system_id: &str, context: &Value) -> Result<(), PowerError>;
    async fn power_query(&self, system_id: &str, context: &Value) -> Result<String, PowerError>;

    async fn power_cycle(&self, system_id: &str, context: &Value) -> Result<(), PowerError> {
        self.power_off(system_id, context).await?;
        self.power_on(system_id, context).await
    }
}

/// Constructed once at startup; lookups are by the driver's advertised name.
pub struct PowerDriverRegistry {
    drivers: BTreeMap<String, Arc<dyn PowerDriver>>,
}

impl PowerDriverRegistry {
    pub fn new(drivers: Vec<Arc<dyn PowerDriver>>) -> Self {
        Self {
            drivers: drivers
                .into_iter()
                .map(|d| (d.name().to_string(), d))
                .collect(),
        }
    }

    /// The drivers shipped with the service.
    pub fn builtin() -> Self {
        Self::new(vec![Arc::new(ManualPowerDriver), Arc::new(IpmiPowerDriver)])
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn PowerDriver>> {
        self.drivers.get(name).cloned()
    }

    /// Catalog for `describe-power-types`.
    pub fn describe(&self) -> Vec<Value> {
        self.drivers
            .values()
            .map(|d| {
                json!({
                    "name": d.name(),
                    "description": d.description(),
                    "fields": d.schema(),
                    "queryable": d.queryable(),
                })
            })
            .collect()
    }
}

/// Tracks power actions in flight so a second action on the same machine is
/// refused instead of racing the first.
#[derive(Default)]
pub struct InFlightActions {
    active: Arc<Mutex<HashSet<String>>>,
}

impl InFlightActions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when an action for `system_id` is already running.
    pub fn begin(&self, system_id: &str) -> Option<ActionGuard> {
        let mut active = self.active.lock();
        if !active.insert(system_id.to_string()) {
            return None;
        }
        Some(ActionGuard {
            active: self.active.clone(),
            system_id: system_id.to_string(),
        })
    }
}

pub struct ActionGuard {
    active: Arc<Mutex<HashSet<String>>>,
    system_id: String,
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.system_id);
    }
}

/// Machines with no controllable BMC. Actions succeed without doing anything
/// and the state can never be queried.
pub struct ManualPowerDriver;

#[async_trait]
impl PowerDriver for ManualPowerDriver {
    fn name(&self) -> &str {
        "manual"
    }

    fn description(&self) -> &str {
        "Manual power control"
    }

    fn schema(&self) -> Value {
        json!([])
    }

    fn queryable(&self) -> bool {
        false
    }

    async fn power_on(&self, _system_id: &str, _context: &Value) -> Result<(), PowerError> {
        Ok(())
    }

    async fn power_off(&self, _system_id: &str, _context: &Value) -> Result<(), PowerError> {
        Ok(())
    }

    async fn power_query(&self, _system_id: &str, _context: &Value) -> Result<String, PowerError> {
        Err(PowerError::NotQueryable("manual".into()))
    }
}

/// Drives a BMC through `ipmitool`.
pub struct IpmiPowerDriver;

impl IpmiPowerDriver {
    fn args(context: &Value) -> Result<Vec<String>, PowerError> {
        let field = |key: &str| {
            context
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| PowerError::ActionFail(format!("missing IPMI setting '{key}'")))
        };
        Ok(vec![
            "-I".into(),
            "lanplus".into(),
            "-H".into(),
            field("power_address")?,
            "-U".into(),
            field("power_user")?,
            "-P".into(),
            field("power_pass")?,
        ])
    }

    async fn chassis_power(
        &self,
        system_id: &str,
        context: &Value,
        action: &str,
    ) -> Result<String, PowerError> {
        let mut args = Self::args(context)?;
        args.extend(["chassis".into(), "power".into(), action.into()]);
        let output = Process::new("ipmitool")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PowerError::ActionFail(format!("cannot run ipmitool: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PowerError::ActionFail(format!(
                "ipmitool failed for {system_id}: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl PowerDriver for IpmiPowerDriver {
    fn name(&self) -> &str {
        "ipmi"
    }

    fn description(&self) -> &str {
        "IPMI (LAN 2.0)"
    }

    fn schema(&self) -> Value {
        json!([
            {"name": "power_address", "label": "IP address", "required": true},
            {"name": "power_user", "label": "Power user", "required": true},
            {"name": "power_pass", "label": "Power password", "required": true},
        ])
    }

    async fn power_on(&self, system_id: &str, context: &Value) -> Result<(), PowerError> {
        self.chassis_power(system_id, context, "on").await.map(|_| ())
    }

    async fn power_off(&self, system_id: &str, context: &Value) -> Result<(), PowerError> {
        self.chassis_power(system_id, context, "off").await.map(|_| ())
    }

    async fn power_query(&self, system_id: &str, context: &Value) -> Result<String, PowerError> {
        let stdout = self.chassis_power(system_id, context, "status").await?;
        if stdout.contains("Chassis Power is on") {
            Ok("on".into())
        } else if stdout.contains("Chassis Power is off") {
            Ok("off".into())
        } else {
            Err(PowerError::ActionFail(format!(
                "unrecognised power status: {}",
                stdout.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_describes_builtin_drivers() {
        let registry = PowerDriverRegistry::builtin();
        let described = registry.describe();
        let names: Vec<&str> = described
            .iter()
            .filter_map(|d| d["name"].as_str())
            .collect();
        assert!(names.contains(&"manual"));
        assert!(names.contains(&"ipmi"));
        let manual = described.iter().find(|d| d["name"] == "manual").unwrap();
        assert_eq!(manual["queryable"], false);
    }

    #[test]
    fn unknown_driver_is_none() {
        assert!(PowerDriverRegistry::builtin().get("flux-capacitor").is_none());
    }

    #[tokio::test]
    async fn manual_driver_acks_without_doing_anything() {
        let driver = ManualPowerDriver;
        driver.power_on("abc", &json!({})).await.unwrap();
        driver.power_off("abc", &json!({})).await.unwrap();
        assert!(matches!(
            driver.power_query("abc", &json!({})).await,
            Err(PowerError::NotQueryable(_))
        ));
    }

    #[test]
    fn in_flight_actions_exclude_per_machine() {
        let actions = InFlightActions::new();
        let guard = actions.begin("node-1").unwrap();
        assert!(actions.begin("node-1").is_none());
        // A different machine is unaffected.
        let _other = actions.begin("node-2").unwrap();
        drop(guard);
        assert!(actions.begin("node-1").is_some());
    }

    #[test]
    fn ipmi_args_require_all_settings() {
        let err = IpmiPowerDriver::args(&json!({"power_address": "10.0.0.9"})).unwrap_err();
        assert!(err.to_string().contains("power_user"));
    }
}
