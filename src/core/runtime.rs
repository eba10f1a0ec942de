//! Wires configuration into the running service.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::info;

use crate::core::config::Config;
use crate::drivers::chassis::ChassisCatalog;
use crate::drivers::nos::NosRegistry;
use crate::drivers::pod::PodDriverRegistry;
use crate::drivers::power::PowerDriverRegistry;
use crate::external::boot_images::FilesystemBootImageStore;
use crate::external::dhcp::IscDhcpService;
use crate::external::scan::NetworkScanner;
use crate::external::svc::ServiceController;
use crate::external::sysinfo::{HostSystemInfo, SystemInfoSource};
use crate::external::tags::HelperTagEvaluator;
use crate::net::discovery::Discovery;
use crate::net::tls::TlsIdentity;
use crate::rpc::dispatcher::{Collaborators, CommandDispatcher};
use crate::rpc::handshake::Handshake;
use crate::rpc::health::HealthChecker;
use crate::rpc::pool::ConnectionPool;
use crate::util::ident::{IdentStore, SharedSecret};
use crate::util::peers::SavedPeerState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the full service from configuration and run it until interrupted.
pub async fn run(config: Config) -> Result<()> {
    std::fs::create_dir_all(&config.paths.data_dir).with_context(|| {
        format!("cannot create data dir {}", config.paths.data_dir.display())
    })?;

    let secret = SharedSecret::load(&config.paths.secret_path)
        .context("the cluster shared secret is required to reach the region")?;
    let ident = Arc::new(IdentStore::new(config.paths.data_dir.join("system_id")));
    let peers = Arc::new(SavedPeerState::new(config.paths.data_dir.join("peers")));

    let sysinfo = Arc::new(HostSystemInfo::new(VERSION.to_string()));
    let host = sysinfo.collect().await;
    info!(hostname = %host.hostname, version = VERSION, "starting rack controller link");

    let identity = match &config.tls {
        Some(tls) => TlsIdentity::from_pem_files(&tls.cert_path, &tls.key_path)?,
        None => TlsIdentity::generate(&host.hostname)?,
    };
    let connector = TlsConnector::from(Arc::new(identity.client_config()?));

    let advertised_url = config
        .region
        .advertised_url
        .clone()
        .unwrap_or_else(|| config.region.urls[0].clone());
    let handshake = Handshake {
        connector,
        secret: secret.clone(),
        ident: ident.clone(),
        hostname: host.hostname.clone(),
        interfaces: host.interfaces.clone(),
        advertised_url,
        version: VERSION.to_string(),
    };

    let dispatcher = Arc::new(CommandDispatcher::new(Collaborators {
        power: PowerDriverRegistry::builtin(),
        pods: PodDriverRegistry::builtin(),
        chassis: ChassisCatalog::builtin(),
        nos: NosRegistry::builtin(),
        dhcp: Arc::new(IscDhcpService::new(config.paths.dhcp_config_dir.clone())),
        boot_images: Arc::new(FilesystemBootImageStore::new(
            config.paths.boot_images_dir.clone(),
            config.commands.boot_image_importer.clone(),
        )),
        sysinfo: sysinfo.clone(),
        tags: Arc::new(HelperTagEvaluator::new(
            config.commands.helper.clone(),
            config.region.urls[0].clone(),
        )),
        scanner: Arc::new(NetworkScanner::new(config.commands.helper.clone())),
        service: Arc::new(ServiceController::new(config.commands.service_unit.clone())),
        ident,
        secret,
        lock_dir: config.paths.lock_dir.clone(),
    }));

    let discovery = Discovery::new(config.region.urls.clone(), peers.clone())?;
    let pool = Arc::new(ConnectionPool::new(
        discovery,
        handshake,
        dispatcher,
        peers,
        config.pool_config(),
    ));
    let checker = HealthChecker::new(pool.clone(), config.health_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool_task = tokio::spawn(pool.clone().run(shutdown_rx.clone()));
    let health_task = tokio::spawn(checker.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = pool_task.await;
    let _ = health_task.await;
    Ok(())
}
