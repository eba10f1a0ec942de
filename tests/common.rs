//! Common test harness utilities for integration tests.
//!
//! The centerpiece is [`FakeRegion`]: a minimal region controller speaking
//! just enough of the protocol to exercise discovery, the handshake, pooling
//! and full-duplex RPC against a real TCP/TLS stack.

// Not all test files use all helpers; silence dead_code warnings for unused exports.
#![allow(dead_code)]

use parking_lot::Mutex;
use rand::RngCore;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use rackline::net::frame::{read_frame, write_frame, Envelope};
use rackline::net::tls::TlsIdentity;
use rackline::rpc::handshake::Handshake;
use rackline::rpc::messages::{Fault, FaultKind};
use rackline::util::ident::{IdentStore, SharedSecret};

pub type RegionCall = (String, Value, oneshot::Sender<Result<Value, Fault>>);

#[derive(Clone)]
pub struct FakeRegionConfig {
    pub name: String,
    /// Loopback address to listen on; distinct 127/8 addresses let tests
    /// tell regions apart by host.
    pub bind_ip: String,
    pub secret: Vec<u8>,
    pub assigned_system_id: String,
    pub reject_register: bool,
}

impl Default for FakeRegionConfig {
    fn default() -> Self {
        Self {
            name: "region-1:pid=1234".into(),
            bind_ip: "127.0.0.1".into(),
            secret: b"the-cluster-secret".to_vec(),
            assigned_system_id: "fxa3p4".into(),
            reject_register: false,
        }
    }
}

struct RegionState {
    config: FakeRegionConfig,
    registrations: AtomicUsize,
    /// Sender for region-initiated calls on the most recent connection.
    active: Mutex<Option<mpsc::UnboundedSender<RegionCall>>>,
    /// Per-connection serve tasks, so `stop` can cut live streams.
    connections: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

pub struct FakeRegion {
    pub rpc_addr: SocketAddr,
    pub http_url: String,
    state: Arc<RegionState>,
    listeners: Vec<tokio::task::JoinHandle<()>>,
}

impl FakeRegion {
    pub async fn start(config: FakeRegionConfig) -> Self {
        let bind = format!("{}:0", config.bind_ip);
        let state = Arc::new(RegionState {
            config,
            registrations: AtomicUsize::new(0),
            active: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
        });
        let mut listeners = Vec::new();

        let rpc_listener = TcpListener::bind(&bind).await.expect("bind rpc");
        let rpc_addr = rpc_listener.local_addr().expect("rpc addr");
        let identity = TlsIdentity::generate("fake-region").expect("region identity");
        let acceptor = TlsAcceptor::from(Arc::new(
            identity.server_config().expect("region server config"),
        ));
        {
            let state = state.clone();
            listeners.push(tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = rpc_listener.accept().await else {
                        return;
                    };
                    let conn_state = state.clone();
                    let acceptor = acceptor.clone();
                    let handle = tokio::spawn(async move {
                        let _ = serve_rpc(socket, acceptor, conn_state).await;
                    });
                    state.connections.lock().push(handle);
                }
            }));
        }

        let http_listener = TcpListener::bind(&bind).await.expect("bind http");
        let http_addr = http_listener.local_addr().expect("http addr");
        let http_url = format!("http://{http_addr}/");
        {
            let state = state.clone();
            listeners.push(tokio::spawn(async move {
                loop {
                    let Ok((mut socket, _)) = http_listener.accept().await else {
                        return;
                    };
                    let mut eventloops = serde_json::Map::new();
                    eventloops.insert(
                        state.config.name.clone(),
                        json!([[rpc_addr.ip().to_string(), rpc_addr.port()]]),
                    );
                    let body = json!({ "eventloops": eventloops }).to_string();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let _ = socket.read(&mut buf).await;
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                    });
                }
            }));
        }

        Self {
            rpc_addr,
            http_url,
            state,
            listeners,
        }
    }

    /// Take the region offline: stop advertising and cut live connections.
    pub fn stop(&self) {
        for listener in &self.listeners {
            listener.abort();
        }
        for connection in self.state.connections.lock().drain(..) {
            connection.abort();
        }
    }

    pub fn registrations(&self) -> usize {
        self.state.registrations.load(Ordering::SeqCst)
    }

    /// Issue a region-initiated request on the most recently registered
    /// connection.
    pub async fn call_rack(&self, command: &str, params: Value) -> Result<Value, Fault> {
        let sender = self
            .state
            .active
            .lock()
            .clone()
            .expect("no registered connection");
        let (tx, rx) = oneshot::channel();
        sender
            .send((command.to_string(), params, tx))
            .expect("connection task gone");
        rx.await.expect("call dropped")
    }
}

async fn serve_rpc(
    socket: TcpStream,
    acceptor: TlsAcceptor,
    state: Arc<RegionState>,
) -> std::io::Result<()> {
    let mut socket = socket;
    // Plaintext preamble: the rack asks for the TLS upgrade.
    loop {
        match read_frame(&mut socket).await {
            Ok(Some(Envelope::Request { id, command, .. })) if command == "start-tls" => {
                write_frame(&mut socket, &Envelope::Response { id, result: json!({}) })
                    .await
                    .ok();
                break;
            }
            Ok(Some(_)) => continue,
            _ => return Ok(()),
        }
    }

    let mut stream = acceptor.accept(socket).await?;
    let secret = SharedSecret::from_bytes(state.config.secret.clone());
    let (calls_tx, mut calls_rx) = mpsc::unbounded_channel::<RegionCall>();
    let mut next_id = 1_000_000u64;
    let mut pending: Vec<(u64, oneshot::Sender<Result<Value, Fault>>)> = Vec::new();

    loop {
        tokio::select! {
            frame = read_frame(&mut stream) => {
                let envelope = match frame {
                    Ok(Some(envelope)) => envelope,
                    _ => return Ok(()),
                };
                match envelope {
                    Envelope::Request { id, command, params } => {
                        let reply = answer(&command, &params, &state, &secret, &calls_tx);
                        let envelope = match reply {
                            Ok(result) => Envelope::Response { id, result },
                            Err(fault) => Envelope::Fault { id, fault },
                        };
                        if write_frame(&mut stream, &envelope).await.is_err() {
                            return Ok(());
                        }
                    }
                    Envelope::Response { id, result } => {
                        if let Some(pos) = pending.iter().position(|(p, _)| *p == id) {
                            let (_, tx) = pending.swap_remove(pos);
                            let _ = tx.send(Ok(result));
                        }
                    }
                    Envelope::Fault { id, fault } => {
                        if let Some(pos) = pending.iter().position(|(p, _)| *p == id) {
                            let (_, tx) = pending.swap_remove(pos);
                            let _ = tx.send(Err(fault));
                        }
                    }
                }
            }
            Some((command, params, tx)) = calls_rx.recv() => {
                next_id += 1;
                pending.push((next_id, tx));
                let envelope = Envelope::Request { id: next_id, command, params };
                if write_frame(&mut stream, &envelope).await.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

fn answer(
    command: &str,
    params: &Value,
    state: &Arc<RegionState>,
    secret: &SharedSecret,
    calls_tx: &mpsc::UnboundedSender<RegionCall>,
) -> Result<Value, Fault> {
    match command {
        "ping" => Ok(json!({})),
        "identify" => Ok(json!({"ident": state.config.name})),
        "authenticate" => {
            let message = params["message"]
                .as_str()
                .and_then(|m| base64_decode(m))
                .ok_or_else(|| Fault::new(FaultKind::Unhandled, "bad challenge"))?;
            let mut salt = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut salt);
            let digest = secret.calculate_digest(&message, &salt);
            Ok(json!({
                "digest": base64_encode(&digest),
                "salt": base64_encode(&salt),
            }))
        }
        "register" => {
            if state.config.reject_register {
                return Err(Fault::new(
                    FaultKind::RegistrationRejected,
                    "rack is not allowed in this zone",
                ));
            }
            state.registrations.fetch_add(1, Ordering::SeqCst);
            *state.active.lock() = Some(calls_tx.clone());
            Ok(json!({"system_id": state.config.assigned_system_id}))
        }
        other => Err(Fault::new(
            FaultKind::UnknownCommand,
            format!("region cannot answer '{other}'"),
        )),
    }
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(text: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(text).ok()
}

/// A rack-side handshake wired against temporary state.
pub fn rack_handshake(dir: &std::path::Path, secret: &[u8]) -> Handshake {
    let identity = TlsIdentity::generate("rack-test").expect("rack identity");
    let connector = TlsConnector::from(Arc::new(
        identity.client_config().expect("rack client config"),
    ));
    Handshake {
        connector,
        secret: SharedSecret::from_bytes(secret.to_vec()),
        ident: Arc::new(IdentStore::new(dir.join("system_id"))),
        hostname: "rack-test".into(),
        interfaces: json!({}),
        advertised_url: "http://rack-test:5240/".into(),
        version: "0.4.2".into(),
    }
}
