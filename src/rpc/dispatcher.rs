//! Translating region requests into driver and collaborator calls.
//!
//! Every handler follows the same discipline: typed parameter parsing,
//! expected failures mapped to structured faults, unexpected failures logged
//! with their trace and surfaced generically, and anything long-running
//! either guarded by a host-wide lock or pushed into the background after an
//! early ack.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::drivers::chassis::{ChassisCatalog, ChassisError};
use crate::drivers::nos::NosRegistry;
use crate::drivers::pod::{PodDriverRegistry, PodError};
use crate::drivers::power::{InFlightActions, PowerDriverRegistry, PowerError};
use crate::external::boot_images::BootImageStore;
use crate::external::dhcp::DhcpService;
use crate::external::net::check_ips;
use crate::external::scan::NetworkScanner;
use crate::external::svc::ServiceController;
use crate::external::sysinfo::SystemInfoSource;
use crate::external::tags::TagEvaluator;
use crate::rpc::connection::RequestHandler;
use crate::rpc::messages::{
    AddChassisRequest, AuthenticateRequest, AuthenticateResponse, CheckIpsRequest, Command,
    ComposeMachineRequest, ComposeMachineResponse, ConfigureDhcpRequest, DecomposeMachineResponse,
    DiscoverPodResponse, EvaluateTagRequest, Fault, FaultKind, IdentifyResponse,
    ImportBootImagesRequest, IsImportRunningResponse, LegacyConfigureDhcpRequest,
    ListBootImagesResponse, PodParams, PowerParams, PowerQueryResponse, RefreshRequest,
    ScanNetworksRequest, ValidateDhcpResponse,
};
use crate::util::ident::{IdentStore, SharedSecret};
use crate::util::lock::{LockError, NamedLock, NamedLockGuard};

/// How long one DHCP reconfiguration may take before the caller gets a fault.
pub const DHCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything the dispatcher talks to, bundled so wiring and tests construct
/// it the same way.
pub struct Collaborators {
    pub power: PowerDriverRegistry,
    pub pods: PodDriverRegistry,
    pub chassis: ChassisCatalog,
    pub nos: NosRegistry,
    pub dhcp: Arc<dyn DhcpService>,
    pub boot_images: Arc<dyn BootImageStore>,
    pub sysinfo: Arc<dyn SystemInfoSource>,
    pub tags: Arc<dyn TagEvaluator>,
    pub scanner: Arc<NetworkScanner>,
    pub service: Arc<ServiceController>,
    pub ident: Arc<IdentStore>,
    pub secret: SharedSecret,
    pub lock_dir: PathBuf,
}

pub struct CommandDispatcher {
    c: Collaborators,
    in_flight: InFlightActions,
    dhcp_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(collaborators: Collaborators) -> Self {
        Self {
            c: collaborators,
            in_flight: InFlightActions::new(),
            dhcp_timeout: DHCP_TIMEOUT,
        }
    }

    #[cfg(test)]
    fn with_dhcp_timeout(mut self, timeout: Duration) -> Self {
        self.dhcp_timeout = timeout;
        self
    }

    // ------------------------------------------------------------------
    // Handshake commands the region may repeat on a live connection
    // ------------------------------------------------------------------

    fn identify(&self) -> Value {
        let ident = self.c.ident.get().unwrap_or_default();
        json!(IdentifyResponse { ident })
    }

    fn authenticate(&self, params: &Value) -> Result<Value, Fault> {
        let request: AuthenticateRequest = parse(params)?;
        let mut salt = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut salt);
        let digest = self.c.secret.calculate_digest(&request.message, &salt);
        Ok(json!(AuthenticateResponse {
            digest,
            salt: salt.to_vec(),
        }))
    }

    // ------------------------------------------------------------------
    // Boot images
    // ------------------------------------------------------------------

    async fn list_boot_images(&self) -> Result<Value, Fault> {
        let images = self.c.boot_images.list().await.map_err(unexpected)?;
        Ok(json!(ListBootImagesResponse { images }))
    }

    async fn import_boot_images(&self, params: &Value) -> Result<Value, Fault> {
        let request: ImportBootImagesRequest = parse(params)?;
        self.c
            .boot_images
            .start_import(request.sources, request.http_proxy, request.https_proxy)
            .await
            .map_err(unexpected)?;
        Ok(json!({}))
    }

    // ------------------------------------------------------------------
    // Power
    // ------------------------------------------------------------------

    async fn power_action(&self, command: Command, params: &Value) -> Result<Value, Fault> {
        let request: PowerParams = parse(params)?;
        let driver = self.c.power.get(&request.power_type).ok_or_else(|| {
            Fault::new(
                FaultKind::UnknownPowerType,
                format!("unknown power type '{}'", request.power_type),
            )
        })?;
        let _guard = self.in_flight.begin(&request.system_id).ok_or_else(|| {
            Fault::new(
                FaultKind::PowerActionAlreadyInProgress,
                format!(
                    "a power action for {} is already in progress",
                    request.system_id
                ),
            )
        })?;
        info!(system_id = %request.system_id, %command, power_type = %request.power_type, "power action");
        let outcome = match command {
            Command::PowerOn => driver.power_on(&request.system_id, &request.context).await,
            Command::PowerOff => driver.power_off(&request.system_id, &request.context).await,
            Command::PowerCycle => {
                driver
                    .power_cycle(&request.system_id, &request.context)
                    .await
            }
            _ => unreachable!("routed by caller"),
        };
        outcome.map_err(|err| Fault::new(FaultKind::PowerActionFail, err.to_string()))?;
        Ok(json!({}))
    }

    /// Driver trouble of any kind becomes `state = "error"`; a power query
    /// must never fail at the transport level.
    async fn power_query(&self, params: &Value) -> Result<Value, Fault> {
        let request: PowerParams = parse(params)?;
        let outcome = match self.c.power.get(&request.power_type) {
            Some(driver) => driver
                .power_query(&request.system_id, &request.context)
                .await,
            None => Err(PowerError::ActionFail(format!(
                "unknown power type '{}'",
                request.power_type
            ))),
        };
        let response = match outcome {
            Ok(state) => PowerQueryResponse {
                state,
                error_msg: None,
            },
            Err(err) => {
                warn!(system_id = %request.system_id, %err, "power query failed");
                PowerQueryResponse {
                    state: "error".into(),
                    error_msg: Some(err.to_string()),
                }
            }
        };
        Ok(json!(response))
    }

    // ------------------------------------------------------------------
    // DHCP
    // ------------------------------------------------------------------

    async fn configure_dhcp(&self, config: ConfigureDhcpRequest, v6: bool) -> Result<Value, Fault> {
        let name = if v6 { "dhcp-v6" } else { "dhcp-v4" };
        let configure = async {
            let _guard = self.wait_for_lock(name).await?;
            let result = if v6 {
                self.c.dhcp.configure_v6(&config).await
            } else {
                self.c.dhcp.configure_v4(&config).await
            };
            result.map_err(|err| Fault::new(FaultKind::CannotConfigureDhcp, err.to_string()))
        };
        match tokio::time::timeout(self.dhcp_timeout, configure).await {
            Ok(result) => result.map(|()| json!({})),
            Err(_) => Err(Fault::new(
                FaultKind::CannotConfigureDhcp,
                format!("configuring {name} took longer than {:?}", self.dhcp_timeout),
            )),
        }
    }

    /// DHCP reconfigurations queue behind each other rather than failing
    /// fast; the overall timeout bounds the wait.
    async fn wait_for_lock(&self, name: &str) -> Result<NamedLockGuard, Fault> {
        let lock = NamedLock::new(&self.c.lock_dir, name).map_err(unexpected)?;
        loop {
            match lock.try_acquire() {
                Ok(guard) => return Ok(guard),
                Err(LockError::NotAvailable(_)) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Err(err) => return Err(unexpected(err)),
            }
        }
    }

    async fn validate_dhcp(&self, config: ConfigureDhcpRequest, v6: bool) -> Result<Value, Fault> {
        let errors = self
            .c
            .dhcp
            .validate(&config, v6)
            .await
            .map_err(unexpected)?;
        Ok(json!(ValidateDhcpResponse { errors }))
    }

    // ------------------------------------------------------------------
    // Long-running host operations
    // ------------------------------------------------------------------

    async fn refresh(&self, params: &Value) -> Result<Value, Fault> {
        let request: RefreshRequest = parse(params)?;
        let lock = NamedLock::new(&self.c.lock_dir, "refresh").map_err(unexpected)?;
        let _guard = lock.try_acquire().map_err(|err| match err {
            LockError::NotAvailable(_) => Fault::new(
                FaultKind::RefreshAlreadyInProgress,
                "a refresh is already in progress",
            ),
            other => unexpected(other),
        })?;
        info!(system_id = %request.system_id, "refreshing rack controller info");
        let info = self.c.sysinfo.collect().await;
        Ok(json!(info))
    }

    async fn scan_networks(&self, params: &Value) -> Result<Value, Fault> {
        let request: ScanNetworksRequest = parse(params)?;
        let lock = NamedLock::new(&self.c.lock_dir, "scan-networks").map_err(unexpected)?;
        let guard = lock.try_acquire().map_err(|err| match err {
            LockError::NotAvailable(_) => Fault::new(
                FaultKind::ScanNetworksAlreadyInProgress,
                "a network scan is already in progress",
            ),
            other => unexpected(other),
        })?;
        let scanner = self.c.scanner.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(err) = scanner.scan(&request).await {
                warn!(%err, "network scan failed");
            }
        });
        Ok(json!({}))
    }

    fn evaluate_tag(&self, params: &Value) -> Result<Value, Fault> {
        let request: EvaluateTagRequest = parse(params)?;
        let tags = self.c.tags.clone();
        let tag_name = request.tag_name.clone();
        tokio::spawn(async move {
            if let Err(err) = tags.evaluate(request).await {
                warn!(tag = %tag_name, %err, "tag evaluation failed");
            }
        });
        Ok(json!({}))
    }

    /// Always acks; chassis probing is best-effort and its failures belong
    /// in the log, not on the wire.
    fn add_chassis(&self, params: &Value) -> Result<Value, Fault> {
        let request: AddChassisRequest = parse(params)?;
        match self.c.chassis.validate(&request) {
            Ok(enlister) => {
                let hostname = request.hostname.clone();
                tokio::spawn(async move {
                    if let Err(err) = enlister.enlist(request).await {
                        warn!(chassis = %hostname, %err, "chassis probe failed");
                    }
                });
            }
            Err(err @ ChassisError::UnknownType(_)) => {
                warn!(chassis_type = %request.chassis_type, %err, "ignoring add-chassis");
            }
            Err(err) => {
                warn!(chassis_type = %request.chassis_type, %err, "invalid add-chassis request");
            }
        }
        Ok(json!({}))
    }

    async fn disable_and_shutoff(&self) -> Result<Value, Fault> {
        self.c
            .service
            .disable_and_stop()
            .await
            .map_err(|err| Fault::new(FaultKind::CannotDisableAndShutoffRackd, err.to_string()))?;
        Ok(json!({}))
    }

    // ------------------------------------------------------------------
    // Pods
    // ------------------------------------------------------------------

    fn pod_driver(
        &self,
        params: &PodParams,
    ) -> Result<Arc<dyn crate::drivers::pod::PodDriver>, Fault> {
        self.c.pods.get(&params.type_name).ok_or_else(|| {
            Fault::new(
                FaultKind::UnknownPodType,
                format!("unknown pod type '{}'", params.type_name),
            )
        })
    }

    async fn discover_pod(&self, params: &Value) -> Result<Value, Fault> {
        let request: PodParams = parse(params)?;
        let driver = self.pod_driver(&request)?;
        let pod = driver.discover(&request.context).await.map_err(pod_fault)?;
        Ok(json!(DiscoverPodResponse { pod }))
    }

    async fn compose_machine(&self, params: &Value) -> Result<Value, Fault> {
        let request: ComposeMachineRequest = parse(params)?;
        let driver = self.pod_driver(&request.pod)?;
        let composed = driver
            .compose(&request.pod.context, &request.request)
            .await
            .map_err(pod_fault)?;
        Ok(json!(ComposeMachineResponse {
            machine: composed.machine,
            hints: composed.hints,
        }))
    }

    async fn decompose_machine(&self, params: &Value) -> Result<Value, Fault> {
        let request: PodParams = parse(params)?;
        let driver = self.pod_driver(&request)?;
        let hints = driver
            .decompose(&request.context)
            .await
            .map_err(pod_fault)?;
        Ok(json!(DecomposeMachineResponse { hints }))
    }
}

#[async_trait]
impl RequestHandler for CommandDispatcher {
    async fn handle(&self, command: Command, params: Value) -> Result<Value, Fault> {
        match command {
            Command::Ping => Ok(json!({})),
            Command::Identify => Ok(self.identify()),
            Command::Authenticate => self.authenticate(&params),
            Command::StartTls | Command::Register => Err(Fault::new(
                FaultKind::UnknownCommand,
                format!("'{command}' is only valid during connection setup"),
            )),

            Command::ListBootImages | Command::ListBootImagesV2 => self.list_boot_images().await,
            Command::ImportBootImages => self.import_boot_images(&params).await,
            Command::IsImportBootImagesRunning => Ok(json!(IsImportRunningResponse {
                running: self.c.boot_images.import_running(),
            })),

            Command::DescribePowerTypes => Ok(json!({"power_types": self.c.power.describe()})),
            Command::DescribeNosTypes => Ok(json!({"nos_types": self.c.nos.describe()})),
            Command::PowerOn | Command::PowerOff | Command::PowerCycle => {
                self.power_action(command, &params).await
            }
            Command::PowerQuery => self.power_query(&params).await,

            Command::ConfigureDhcpv4V2 => {
                let config: ConfigureDhcpRequest = parse(&params)?;
                self.configure_dhcp(config, false).await
            }
            Command::ConfigureDhcpv4 => {
                let config: LegacyConfigureDhcpRequest = parse(&params)?;
                self.configure_dhcp(config.upgrade(), false).await
            }
            Command::ConfigureDhcpv6V2 => {
                let config: ConfigureDhcpRequest = parse(&params)?;
                self.configure_dhcp(config, true).await
            }
            Command::ConfigureDhcpv6 => {
                let config: LegacyConfigureDhcpRequest = parse(&params)?;
                self.configure_dhcp(config.upgrade(), true).await
            }
            Command::ValidateDhcpv4ConfigV2 => {
                let config: ConfigureDhcpRequest = parse(&params)?;
                self.validate_dhcp(config, false).await
            }
            Command::ValidateDhcpv4Config => {
                let config: LegacyConfigureDhcpRequest = parse(&params)?;
                self.validate_dhcp(config.upgrade(), false).await
            }
            Command::ValidateDhcpv6ConfigV2 => {
                let config: ConfigureDhcpRequest = parse(&params)?;
                self.validate_dhcp(config, true).await
            }
            Command::ValidateDhcpv6Config => {
                let config: LegacyConfigureDhcpRequest = parse(&params)?;
                self.validate_dhcp(config.upgrade(), true).await
            }

            Command::EvaluateTag => self.evaluate_tag(&params),
            Command::RefreshRackControllerInfo => self.refresh(&params).await,
            Command::AddChassis => self.add_chassis(&params),
            Command::ScanNetworks => self.scan_networks(&params).await,
            Command::DisableAndShutoffRackd => self.disable_and_shutoff().await,

            Command::DiscoverPod => self.discover_pod(&params).await,
            Command::ComposeMachine => self.compose_machine(&params).await,
            Command::DecomposeMachine => self.decompose_machine(&params).await,

            Command::CheckIps => {
                let request: CheckIpsRequest = parse(&params)?;
                Ok(json!(check_ips(&request).await))
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, Fault> {
    serde_json::from_value(params.clone())
        .map_err(|e| Fault::new(FaultKind::Unhandled, format!("malformed parameters: {e}")))
}

fn pod_fault(err: PodError) -> Fault {
    Fault::new(FaultKind::PodActionFail, err.to_string())
}

/// Unexpected conditions get their trace in the log and a generic fault on
/// the wire.
fn unexpected(err: impl std::fmt::Display) -> Fault {
    error!(%err, "unexpected failure handling a region request");
    Fault::new(FaultKind::Unhandled, err.to_string())
}
