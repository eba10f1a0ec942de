//! The pool of region connections.
//!
//! A single driver task runs discovery cycles: find the region's event loops,
//! open a handshaken connection to each one that lacks one, drop connections
//! to event loops that are no longer advertised, and persist the set of
//! region hosts we actually reached. Cycles are strictly serialized; a cycle
//! observes the fallout of the previous one before deciding what to do.
//!
//! Cycle pacing adapts to how complete the pool is: eager while the service
//! warms up or has nothing, moderate while partially connected, relaxed once
//! every event loop has a connection. Losing a connection snaps the pace back
//! to eager for the next cycle, then adapts to whatever that cycle finds.

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::net::discovery::{Discovery, EventLoopId};
use crate::rpc::connection::{Client, RequestHandler};
use crate::rpc::handshake::{Handshake, HandshakeError};
use crate::util::peers::SavedPeerState;

static CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pace while disconnected or during warmup.
    pub interval_low: Duration,
    /// Pace while partially connected.
    pub interval_mid: Duration,
    /// Pace while fully connected.
    pub interval_high: Duration,
    /// How long after startup the eager pace applies unconditionally.
    pub warmup: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            interval_low: Duration::from_secs(1),
            interval_mid: Duration::from_secs(5),
            interval_high: Duration::from_secs(30),
            warmup: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no region connections available")]
    NoConnectionsAvailable,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<EventLoopId, Client>,
    /// Event loops the last successful discovery advertised. `None` until a
    /// discovery pass has succeeded.
    known_eventloops: Option<usize>,
    /// A connection died since pacing was last evaluated. Forces one eager
    /// cycle, then clears.
    degraded: bool,
    fully_connected_logged: bool,
}

pub struct ConnectionPool {
    state: Mutex<PoolState>,
    discovery: Discovery,
    handshake: Handshake,
    handler: Arc<dyn RequestHandler>,
    peers: Arc<SavedPeerState>,
    config: PoolConfig,
    started: Instant,
    /// Wakes the driver for an immediate cycle.
    trigger: Notify,
    /// Bumped after every completed cycle; waiters subscribe before
    /// triggering so they cannot miss the completion.
    cycle_done: watch::Sender<u64>,
    removals_tx: mpsc::UnboundedSender<(EventLoopId, u64)>,
    removals_rx: Mutex<Option<mpsc::UnboundedReceiver<(EventLoopId, u64)>>>,
}

impl ConnectionPool {
    pub fn new(
        discovery: Discovery,
        handshake: Handshake,
        handler: Arc<dyn RequestHandler>,
        peers: Arc<SavedPeerState>,
        config: PoolConfig,
    ) -> Self {
        let (removals_tx, removals_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(PoolState::default()),
            discovery,
            handshake,
            handler,
            peers,
            config,
            started: Instant::now(),
            trigger: Notify::new(),
            cycle_done: watch::channel(0).0,
            removals_tx,
            removals_rx: Mutex::new(Some(removals_rx)),
        }
    }

    /// Any available connection, or `None` without waiting.
    pub fn get_client(&self) -> Option<Client> {
        let state = self.state.lock();
        let clients: Vec<&Client> = state.connections.values().collect();
        clients.choose(&mut rand::thread_rng()).map(|c| (*c).clone())
    }

    /// Any available connection, forcing an immediate discovery cycle and
    /// waiting for it when the pool is empty.
    pub async fn get_client_now(&self) -> Result<Client, PoolError> {
        for _ in 0..2 {
            if let Some(client) = self.get_client() {
                return Ok(client);
            }
            let mut done = self.cycle_done.subscribe();
            self.trigger.notify_one();
            if done.changed().await.is_err() {
                break;
            }
        }
        self.get_client().ok_or(PoolError::NoConnectionsAvailable)
    }

    pub fn get_all_clients(&self) -> Vec<Client> {
        self.state.lock().connections.values().cloned().collect()
    }

    pub fn connected_eventloops(&self) -> Vec<EventLoopId> {
        self.state.lock().connections.keys().cloned().collect()
    }

    /// Drive the pool until `shutdown` flips. Consumes the removal channel;
    /// calling this twice is a programming error.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut removals = match self.removals_rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("connection pool driver started twice");
                return;
            }
        };
        loop {
            self.update_cycle().await;
            self.cycle_done.send_modify(|n| *n += 1);

            let pause = self.calculate_interval();
            let sleep = tokio::time::sleep(pause);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    _ = self.trigger.notified() => break,
                    removal = removals.recv() => {
                        if let Some((eventloop, token)) = removal {
                            self.remove_connection(&eventloop, token);
                            break;
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            self.close_all();
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One discovery-and-reconcile pass.
    async fn update_cycle(&self) {
        let Some(advertised) = self.discovery.discover().await else {
            debug!("no region endpoints discovered");
            self.state.lock().known_eventloops = None;
            return;
        };

        let (to_drop, to_open) = {
            let mut state = self.state.lock();
            state.known_eventloops = Some(advertised.len());
            let to_drop: Vec<Client> = state
                .connections
                .iter()
                .filter(|(eventloop, _)| !advertised.contains_key(*eventloop))
                .map(|(_, client)| client.clone())
                .collect();
            let to_open: Vec<(EventLoopId, Vec<SocketAddr>)> = advertised
                .iter()
                .filter(|(eventloop, _)| !state.connections.contains_key(*eventloop))
                .map(|(eventloop, addrs)| (eventloop.clone(), addrs.clone()))
                .collect();
            (to_drop, to_open)
        };

        for client in to_drop {
            info!(eventloop = %client.eventloop(), "event loop no longer advertised, dropping");
            client.force_close();
        }

        let attempts = to_open
            .into_iter()
            .map(|(eventloop, addrs)| self.connect_one(eventloop, addrs));
        for outcome in futures::future::join_all(attempts).await {
            if let Some(client) = outcome {
                let mut state = self.state.lock();
                if state.connections.contains_key(client.eventloop()) {
                    // Someone beat us to this event loop; first writer wins.
                    drop(state);
                    client.force_close();
                } else {
                    state.connections.insert(client.eventloop().clone(), client);
                }
            }
        }

        self.after_cycle();
    }

    async fn connect_one(&self, eventloop: EventLoopId, addrs: Vec<SocketAddr>) -> Option<Client> {
        for address in addrs {
            match self.handshake.perform(address, &eventloop).await {
                Ok(established) => {
                    let token = CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed);
                    info!(%eventloop, %address, "connected to region event loop");
                    return Some(Client::spawn(
                        established.stream,
                        eventloop,
                        address,
                        token,
                        self.handler.clone(),
                        self.removals_tx.clone(),
                    ));
                }
                Err(err @ HandshakeError::WrongEventLoop { .. }) => {
                    warn!(%eventloop, %address, %err, "region presented a different event loop");
                }
                Err(err) if err.is_routine() => {
                    debug!(%eventloop, %address, %err, "connection attempt failed");
                }
                Err(err) => {
                    error!(%eventloop, %address, %err, "handshake failed");
                }
            }
        }
        None
    }

    fn after_cycle(&self) {
        let mut state = self.state.lock();
        let connected = state.connections.len();
        if state.known_eventloops == Some(connected) && connected > 0 {
            if !state.fully_connected_logged {
                info!(eventloops = connected, "fully connected to region");
                state.fully_connected_logged = true;
            }
        } else {
            state.fully_connected_logged = false;
        }

        let urls: BTreeSet<String> = state
            .connections
            .values()
            .map(|client| format!("http://{}:5240/", client.address().ip()))
            .collect();
        if !urls.is_empty() {
            if let Err(err) = self.peers.update(&urls) {
                warn!(%err, "cannot save region peer state");
            }
        }
    }

    fn remove_connection(&self, eventloop: &EventLoopId, token: u64) {
        let mut state = self.state.lock();
        // A replacement connection may already occupy the slot.
        if state
            .connections
            .get(eventloop)
            .is_some_and(|client| client.token() == token)
        {
            state.connections.remove(eventloop);
            state.degraded = true;
            info!(%eventloop, "lost region connection");
            if state.connections.is_empty() {
                warn!("no region connections remain");
            }
        }
    }

    fn close_all(&self) {
        let clients: Vec<Client> = {
            let mut state = self.state.lock();
            state.connections.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.force_close();
        }
    }

    fn calculate_interval(&self) -> Duration {
        let mut state = self.state.lock();
        let known_eventloops = state.known_eventloops;
        let connections = state.connections.len();
        calculate_interval(
            &self.config,
            self.started.elapsed(),
            known_eventloops,
            connections,
            &mut state.degraded,
        )
    }
}

fn calculate_interval(
    config: &PoolConfig,
    running_for: Duration,
    known_eventloops: Option<usize>,
    connections: usize,
    degraded: &mut bool,
) -> Duration {
    // A lost connection forces exactly one eager evaluation.
    if std::mem::take(degraded) {
        return config.interval_low;
    }
    if running_for <= config.warmup {
        return config.interval_low;
    }
    match known_eventloops {
        None | Some(0) => config.interval_low,
        Some(_) if connections == 0 => config.interval_low,
        Some(n) if connections < n => config.interval_mid,
        Some(_) => config.interval_high,
    }
}
