//! Connection pool integration tests: discovery over HTTP, handshake over
//! TLS, full-duplex traffic and reconnection.

mod common;

use async_trait::async_trait;
use common::{rack_handshake, FakeRegion, FakeRegionConfig};
use rackline::net::discovery::Discovery;
use rackline::rpc::connection::RequestHandler;
use rackline::rpc::messages::{Command, Fault};
use rackline::rpc::pool::{ConnectionPool, PoolConfig};
use rackline::util::peers::SavedPeerState;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

struct TestHandler;

#[async_trait]
impl RequestHandler for TestHandler {
    async fn handle(&self, command: Command, _params: Value) -> Result<Value, Fault> {
        match command {
            Command::Ping => Ok(json!({})),
            Command::DescribePowerTypes => Ok(json!({"power_types": [{"name": "manual"}]})),
            other => Ok(json!({"echo": other.name()})),
        }
    }
}

fn fast_config() -> PoolConfig {
    PoolConfig {
        interval_low: Duration::from_millis(50),
        interval_mid: Duration::from_millis(100),
        interval_high: Duration::from_millis(200),
        warmup: Duration::from_millis(0),
    }
}

async fn start_pool(
    region: &FakeRegion,
    secret: &[u8],
    dir: &std::path::Path,
) -> (Arc<ConnectionPool>, watch::Sender<bool>) {
    let peers = Arc::new(SavedPeerState::new(dir.join("peers")));
    let discovery = Discovery::new(vec![region.http_url.clone()], peers.clone()).unwrap();
    let handshake = rack_handshake(dir, secret);
    let pool = Arc::new(ConnectionPool::new(
        discovery,
        handshake,
        Arc::new(TestHandler),
        peers,
        fast_config(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(pool.clone().run(shutdown_rx));
    (pool, shutdown_tx)
}

#[tokio::test]
async fn pool_discovers_connects_and_pings() {
    let config = FakeRegionConfig::default();
    let region = FakeRegion::start(config.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, shutdown) = start_pool(&region, &config.secret, dir.path()).await;

    let client = pool.get_client_now().await.unwrap();
    assert_eq!(client.eventloop().0, config.name);
    client.ping().await.unwrap();
    assert_eq!(region.registrations(), 1);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn region_initiated_requests_reach_the_handler() {
    let config = FakeRegionConfig::default();
    let region = FakeRegion::start(config.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, shutdown) = start_pool(&region, &config.secret, dir.path()).await;

    pool.get_client_now().await.unwrap();
    let result = region
        .call_rack("describe-power-types", json!({}))
        .await
        .unwrap();
    assert_eq!(result["power_types"][0]["name"], "manual");

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn lost_connections_are_reestablished() {
    let config = FakeRegionConfig::default();
    let region = FakeRegion::start(config.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, shutdown) = start_pool(&region, &config.secret, dir.path()).await;

    let client = pool.get_client_now().await.unwrap();
    client.force_close();

    let mut reconnected = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if region.registrations() >= 2 {
            if let Some(client) = pool.get_client() {
                if client.ping().await.is_ok() {
                    reconnected = true;
                    break;
                }
            }
        }
    }
    assert!(reconnected, "pool never replaced the lost connection");

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn connected_peer_hosts_are_persisted() {
    let config = FakeRegionConfig::default();
    let region = FakeRegion::start(config.clone()).await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, shutdown) = start_pool(&region, &config.secret, dir.path()).await;

    pool.get_client_now().await.unwrap();
    let saved = SavedPeerState::new(dir.path().join("peers"));
    let urls = saved.load();
    assert_eq!(urls, vec!["http://127.0.0.1:5240/".to_string()]);

    let _ = shutdown.send(true);
}

#[tokio::test]
async fn connects_to_every_advertised_event_loop() {
    let config_a = FakeRegionConfig::default();
    let config_b = FakeRegionConfig {
        name: "region-2:pid=5678".into(),
        ..FakeRegionConfig::default()
    };
    let region_a = FakeRegion::start(config_a.clone()).await;
    let region_b = FakeRegion::start(config_b.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let peers = Arc::new(SavedPeerState::new(dir.path().join("peers")));
    let discovery = Discovery::new(
        vec![region_a.http_url.clone(), region_b.http_url.clone()],
        peers.clone(),
    )
    .unwrap();
    let handshake = rack_handshake(dir.path(), &config_a.secret);
    let pool = Arc::new(ConnectionPool::new(
        discovery,
        handshake,
        Arc::new(TestHandler),
        peers,
        fast_config(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(pool.clone().run(shutdown_rx));

    pool.get_client_now().await.unwrap();
    let mut both = false;
    for _ in 0..100 {
        if pool.get_all_clients().len() == 2 {
            both = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(both, "pool never connected to both event loops");
    let mut names: Vec<String> = pool
        .connected_eventloops()
        .into_iter()
        .map(|e| e.0)
        .collect();
    names.sort();
    assert_eq!(names, vec![config_a.name, config_b.name]);

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn peer_state_is_rewritten_when_a_region_goes_away() {
    let config_a = FakeRegionConfig::default();
    let config_b = FakeRegionConfig {
        name: "region-2:pid=5678".into(),
        bind_ip: "127.0.0.2".into(),
        ..FakeRegionConfig::default()
    };
    let region_a = FakeRegion::start(config_a.clone()).await;
    let region_b = FakeRegion::start(config_b.clone()).await;
    let dir = tempfile::tempdir().unwrap();

    let peers = Arc::new(SavedPeerState::new(dir.path().join("peers")));
    let discovery = Discovery::new(
        vec![region_a.http_url.clone(), region_b.http_url.clone()],
        peers.clone(),
    )
    .unwrap();
    let handshake = rack_handshake(dir.path(), &config_a.secret);
    let pool = Arc::new(ConnectionPool::new(
        discovery,
        handshake,
        Arc::new(TestHandler),
        peers,
        fast_config(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(pool.clone().run(shutdown_rx));

    pool.get_client_now().await.unwrap();
    let saved = SavedPeerState::new(dir.path().join("peers"));
    let both = vec![
        "http://127.0.0.1:5240/".to_string(),
        "http://127.0.0.2:5240/".to_string(),
    ];
    let mut recorded = false;
    for _ in 0..250 {
        if saved.load() == both {
            recorded = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(recorded, "peer state never recorded both region hosts");

    region_b.stop();
    let mut rewritten = false;
    for _ in 0..250 {
        if saved.load() == vec!["http://127.0.0.1:5240/".to_string()] {
            rewritten = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(rewritten, "peer state kept the lost region host");

    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn empty_world_yields_no_connections() {
    let dir = tempfile::tempdir().unwrap();
    let peers = Arc::new(SavedPeerState::new(dir.path().join("peers")));
    // A URL nothing serves.
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/", dead.local_addr().unwrap());
    drop(dead);
    let discovery = Discovery::new(vec![url], peers.clone()).unwrap();
    let handshake = rack_handshake(dir.path(), b"secret");
    let pool = Arc::new(ConnectionPool::new(
        discovery,
        handshake,
        Arc::new(TestHandler),
        peers,
        fast_config(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(pool.clone().run(shutdown_rx));

    assert!(pool.get_client_now().await.is_err());
    let _ = shutdown_tx.send(true);
}
