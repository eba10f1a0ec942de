//! Liveness checking for established region connections.
//!
//! TCP keeps a half-dead connection looking healthy for a long time; an
//! application-level ping every interval catches region event loops that
//! stopped answering. A failed or overdue ping closes the connection, which
//! the pool then observes and repairs.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::rpc::pool::ConnectionPool;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
        }
    }
}

pub struct HealthChecker {
    pool: Arc<ConnectionPool>,
    config: HealthConfig,
}

impl HealthChecker {
    pub fn new(pool: Arc<ConnectionPool>, config: HealthConfig) -> Self {
        Self { pool, config }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.check_all().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn check_all(&self) {
        let clients = self.pool.get_all_clients();
        if clients.is_empty() {
            return;
        }
        debug!(connections = clients.len(), "pinging region connections");
        let timeout = self.config.ping_timeout;
        let checks = clients.into_iter().map(|client| async move {
            match tokio::time::timeout(timeout, client.ping()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(eventloop = %client.eventloop(), %err, "ping failed, closing");
                    client.force_close();
                }
                Err(_) => {
                    warn!(eventloop = %client.eventloop(), "ping timed out, closing");
                    client.force_close();
                }
            }
        });
        futures::future::join_all(checks).await;
    }
}
