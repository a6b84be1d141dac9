//! Shared harness for the integration suites: in-process meshes wired
//! through the in-memory transport hub, with injectable failures.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lattica::{
    CacheConfig, Dht, DhtConfig, Discovery, DiscoveryConfig, EventBus, InMemoryTransport, Peer,
    PeerCache, TransportHub,
};

/// Short request timeout so failure paths resolve quickly in tests.
pub const TEST_PING_TIMEOUT: Duration = Duration::from_millis(500);

pub async fn spawn_dht(hub: &TransportHub, port: u16, k: usize, alpha: usize) -> Dht<InMemoryTransport> {
    let endpoint = format!("127.0.0.1:{port}");
    let (transport, inbox) = hub.register(&endpoint).await;
    let config = DhtConfig { k, alpha, ping_timeout: TEST_PING_TIMEOUT, ..DhtConfig::default() };
    let dht = Dht::new(config, "127.0.0.1", port, transport).expect("test config is valid");
    dht.run_inbox(inbox);
    dht
}

/// Spawn `n` DHT nodes and introduce every node to every other.
pub async fn spawn_full_mesh(
    hub: &TransportHub,
    base_port: u16,
    n: usize,
    k: usize,
    alpha: usize,
) -> Vec<Dht<InMemoryTransport>> {
    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        nodes.push(spawn_dht(hub, base_port + i as u16, k, alpha).await);
    }
    for a in &nodes {
        for b in &nodes {
            if a.node_id() != b.node_id() {
                a.add_node(b.local_node()).await;
            }
        }
    }
    nodes
}

/// Spawn `n` DHT nodes in a chain: node i only knows node i + 1.
pub async fn spawn_chain(
    hub: &TransportHub,
    base_port: u16,
    n: usize,
    k: usize,
    alpha: usize,
) -> Vec<Dht<InMemoryTransport>> {
    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        nodes.push(spawn_dht(hub, base_port + i as u16, k, alpha).await);
    }
    for i in 0..n.saturating_sub(1) {
        let next = nodes[i + 1].local_node();
        nodes[i].add_node(next).await;
    }
    nodes
}

pub async fn spawn_discovery(
    hub: &TransportHub,
    port: u16,
    config: DiscoveryConfig,
) -> Discovery<InMemoryTransport> {
    let dht = spawn_dht(hub, port, 8, 2).await;
    let cache = PeerCache::new(CacheConfig::default()).expect("cache config is valid");
    Discovery::new(dht, cache, Arc::new(EventBus::new()), config).expect("discovery config is valid")
}

pub fn peer_of(dht: &Dht<InMemoryTransport>) -> Peer {
    Peer::from_node(&dht.local_node())
}

/// Poll `probe` every 25ms until it returns true or the deadline hits.
pub async fn wait_until<F, Fut>(deadline: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    loop {
        if probe().await {
            return true;
        }
        if start.elapsed() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
