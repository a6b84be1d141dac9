//! Peer-discovery orchestrator.
//!
//! [`Discovery`] ties the subsystems together: it bootstraps the DHT
//! from seed peers, runs periodic random-target lookups, feeds what it
//! finds into the [`PeerCache`], enforces lifecycle rules (expiry,
//! bootstrap retry), and reports every observable change through the
//! [`EventBus`].
//!
//! Background loops never die on error: a failed discovery round
//! doubles the next delay (bounded) and reports a recoverable
//! [`EventPayload::DiscoveryError`]; the loop itself continues.
//!
//! The orchestrator's status is an observable: a current value plus a
//! change stream, backed by a [`tokio::sync::watch`] pair.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cache::PeerCache;
use crate::dht::Dht;
use crate::events::{ErrorSeverity, EventBus, EventPayload};
use crate::node_id::NodeId;
use crate::peer::{now_ms, Peer};
use crate::transport::Transport;
use crate::ConfigError;

/// Known-peer floor below which bootstrap retry kicks in.
const MIN_VIABLE_PEERS: usize = 5;

/// Cap on the periodic-discovery backoff multiplier.
const MAX_BACKOFF_FACTOR: u32 = 32;

/// Orchestrator lifecycle, streamed to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// Discovery configuration. Validated before start.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub discovery_interval: Duration,
    /// Cap on peers adopted from a single discovery round.
    pub max_peers_to_discover: usize,
    /// Target bound on the number of peers the orchestrator keeps.
    pub peer_cache_size: usize,
    /// Peers unseen for this long are dropped by the sweep (bootstrap
    /// and connected peers excepted).
    pub peer_cache_expiry: Duration,
    pub bootstrap_retry_interval: Duration,
    pub max_bootstrap_retries: usize,
    pub enable_periodic_discovery: bool,
    pub enable_bootstrap_retry: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(30),
            max_peers_to_discover: 50,
            peer_cache_size: 200,
            peer_cache_expiry: Duration::from_secs(60 * 60),
            bootstrap_retry_interval: Duration::from_secs(60),
            max_bootstrap_retries: 5,
            enable_periodic_discovery: true,
            enable_bootstrap_retry: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery_interval.is_zero() {
            return Err(ConfigError::new("discovery_interval must be positive"));
        }
        if self.max_peers_to_discover == 0 {
            return Err(ConfigError::new("max_peers_to_discover must be positive"));
        }
        if self.peer_cache_size == 0 {
            return Err(ConfigError::new("peer_cache_size must be positive"));
        }
        if self.peer_cache_expiry.is_zero() {
            return Err(ConfigError::new("peer_cache_expiry must be positive"));
        }
        if self.bootstrap_retry_interval.is_zero() {
            return Err(ConfigError::new("bootstrap_retry_interval must be positive"));
        }
        Ok(())
    }
}

/// Orchestrator counters plus current population sizes.
#[derive(Clone, Debug, Default)]
pub struct DiscoveryStats {
    pub discovery_rounds: u64,
    pub peers_discovered: u64,
    pub peers_lost: u64,
    pub bootstrap_attempts: u64,
    pub errors: u64,
    pub known_peers: usize,
    pub connected_peers: usize,
}

struct DiscoveryInner {
    started: bool,
    stopped: bool,
    connected: HashSet<String>,
    bootstrap_retries_used: usize,
    below_floor: bool,
    discovery_rounds: u64,
    peers_discovered: u64,
    peers_lost: u64,
    bootstrap_attempts: u64,
    errors: u64,
    tasks: Vec<JoinHandle<()>>,
}

/// The discovery orchestrator. Cloning shares all state.
pub struct Discovery<T: Transport> {
    dht: Dht<T>,
    cache: PeerCache,
    events: Arc<EventBus>,
    config: DiscoveryConfig,
    status_tx: Arc<watch::Sender<NetworkStatus>>,
    inner: Arc<Mutex<DiscoveryInner>>,
}

impl<T: Transport> Clone for Discovery<T> {
    fn clone(&self) -> Self {
        Self {
            dht: self.dht.clone(),
            cache: self.cache.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            status_tx: self.status_tx.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Discovery<T> {
    /// # Errors
    /// Returns [`ConfigError`] for out-of-range configuration.
    pub fn new(
        dht: Dht<T>,
        cache: PeerCache,
        events: Arc<EventBus>,
        config: DiscoveryConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (status_tx, _) = watch::channel(NetworkStatus::Stopped);
        Ok(Self {
            dht,
            cache,
            events,
            config,
            status_tx: Arc::new(status_tx),
            inner: Arc::new(Mutex::new(DiscoveryInner {
                started: false,
                stopped: false,
                connected: HashSet::new(),
                bootstrap_retries_used: 0,
                below_floor: true,
                discovery_rounds: 0,
                peers_discovered: 0,
                peers_lost: 0,
                bootstrap_attempts: 0,
                errors: 0,
                tasks: Vec::new(),
            })),
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn dht(&self) -> &Dht<T> {
        &self.dht
    }

    pub fn cache(&self) -> &PeerCache {
        &self.cache
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Register a callback for discovery events. Delegates to the
    /// bus; use [`Discovery::events`] for filtered or typed
    /// registrations.
    pub async fn register_callback(
        &self,
        handler: impl crate::events::EventHandler,
        priority: i32,
        mode: crate::events::DispatchMode,
    ) -> u64 {
        self.events.register_handler(handler, priority, None, mode).await
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status_tx.borrow()
    }

    /// Current status plus subsequent transitions, in order.
    pub fn subscribe_status(&self) -> watch::Receiver<NetworkStatus> {
        self.status_tx.subscribe()
    }

    /// Bootstrap from the given seeds and launch the background
    /// loops. Idempotent: a second call is a no-op.
    pub async fn start(&self, bootstrap_peers: Vec<Peer>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.started || inner.stopped {
                return Ok(());
            }
            inner.started = true;
        }
        let _ = self.status_tx.send(NetworkStatus::Starting);

        if let Err(error) = self.events.emit(EventPayload::DiscoveryStarted).await {
            let _ = self.status_tx.send(NetworkStatus::Error);
            return Err(error).context("failed to announce discovery start");
        }

        self.dht.start().await;
        self.cache.start().await;
        self.bootstrap(&bootstrap_peers).await;

        let mut tasks = Vec::new();
        if self.config.enable_periodic_discovery {
            tasks.push(self.spawn_discovery_loop());
        }
        if self.config.enable_bootstrap_retry {
            tasks.push(self.spawn_bootstrap_retry_loop());
        }
        tasks.push(self.spawn_expiry_sweep_loop());
        self.inner.lock().await.tasks.extend(tasks);

        let _ = self.status_tx.send(NetworkStatus::Running);
        info!(node = %self.dht.node_id(), seeds = bootstrap_peers.len(), "discovery running");
        Ok(())
    }

    /// Stop the loops and the underlying components. Idempotent.
    pub async fn stop(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.stopped {
                return;
            }
            inner.stopped = true;
            inner.started = false;
            for task in inner.tasks.drain(..) {
                task.abort();
            }
        }
        let _ = self.status_tx.send(NetworkStatus::Stopping);

        self.dht.stop().await;
        self.cache.stop().await;
        let _ = self.events.emit(EventPayload::DiscoveryStopped).await;
        let _ = self.status_tx.send(NetworkStatus::Stopped);
        info!(node = %self.dht.node_id(), "discovery stopped");
    }

    /// Seed the cache and the DHT routing table.
    async fn bootstrap(&self, seeds: &[Peer]) {
        if seeds.is_empty() {
            return;
        }
        self.inner.lock().await.bootstrap_attempts += 1;

        let mut seed_nodes = Vec::new();
        for seed in seeds {
            self.cache.put_bootstrap(seed.clone()).await;
            match seed.to_node() {
                Some(node) => seed_nodes.push(node),
                None => warn!(peer = %seed.peer_id, "seed peer id is not a node id; kept in cache only"),
            }
        }
        if self.cache.config().auto_warming_enabled {
            // Seeds double as warm-start peers for the cache tiers.
            self.cache.warm_cache(seeds.to_vec()).await;
        }

        let started = Instant::now();
        let result = self.dht.bootstrap(&seed_nodes).await;
        let _ = self
            .events
            .emit(EventPayload::DhtOperation {
                operation: "bootstrap".into(),
                key: Some(self.dht.node_id().to_hex()),
                success: !result.nodes.is_empty() || !seed_nodes.is_empty(),
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await;

        for node in result.nodes {
            self.adopt_peer(Peer::from_node(&node)).await;
        }
    }

    /// One discovery round: look up a random target and adopt what
    /// comes back. Also the manual trigger.
    pub async fn discover_peers(&self) -> Vec<Peer> {
        self.discovery_round().await.unwrap_or_default()
    }

    async fn discovery_round(&self) -> Result<Vec<Peer>> {
        let target = NodeId::random();
        let started = Instant::now();
        let result = self.dht.find_node(target).await;

        {
            let mut inner = self.inner.lock().await;
            inner.discovery_rounds += 1;
        }
        self.events
            .emit(EventPayload::DhtOperation {
                operation: "find_node".into(),
                key: Some(target.to_hex()),
                success: !result.nodes.is_empty(),
                duration_ms: started.elapsed().as_millis() as u64,
            })
            .await
            .context("event bus rejected discovery report")?;

        let mut adopted = Vec::new();
        for node in result.nodes.into_iter().take(self.config.max_peers_to_discover) {
            if node.id == self.dht.node_id() {
                continue;
            }
            let peer = Peer::from_node(&node);
            if self.adopt_peer(peer.clone()).await {
                adopted.push(peer);
            }
        }

        self.check_floor_recovery().await;
        trace!(target = %target, adopted = adopted.len(), "discovery round");
        Ok(adopted)
    }

    /// Feed an externally-supplied peer into the cache, the DHT, and
    /// the event stream.
    pub async fn add_discovered_peer(&self, peer: Peer) {
        self.adopt_peer(peer).await;
        self.check_floor_recovery().await;
    }

    /// Returns true when the peer was new to the cache.
    async fn adopt_peer(&self, mut peer: Peer) -> bool {
        let is_new = !self.cache.contains(&peer.peer_id).await;
        peer.touch();

        self.cache
            .put(
                peer.clone(),
                crate::cache::PeerPriority::Normal,
                None,
                HashSet::new(),
                HashMap::new(),
            )
            .await;
        if let Some(node) = peer.to_node() {
            self.dht.add_node(node).await;
        }

        if is_new {
            self.inner.lock().await.peers_discovered += 1;
            let _ = self.events.emit(EventPayload::PeerDiscovered { peer }).await;
        }
        is_new
    }

    pub async fn mark_peer_connected(&self, peer_id: &str) {
        let newly_connected = {
            let mut inner = self.inner.lock().await;
            inner.connected.insert(peer_id.to_string())
        };
        self.cache.set_connected(peer_id, true).await;
        if newly_connected {
            let _ = self
                .events
                .emit(EventPayload::PeerConnected { peer_id: peer_id.to_string() })
                .await;
            let _ = self
                .events
                .emit(EventPayload::PeerStatusChanged {
                    peer_id: peer_id.to_string(),
                    connected: true,
                })
                .await;
        }
    }

    pub async fn mark_peer_disconnected(&self, peer_id: &str) {
        let was_connected = {
            let mut inner = self.inner.lock().await;
            inner.connected.remove(peer_id)
        };
        self.cache.set_connected(peer_id, false).await;
        if was_connected {
            let _ = self
                .events
                .emit(EventPayload::PeerDisconnected { peer_id: peer_id.to_string() })
                .await;
            let _ = self
                .events
                .emit(EventPayload::PeerStatusChanged {
                    peer_id: peer_id.to_string(),
                    connected: false,
                })
                .await;
        }
    }

    /// Drop a peer everywhere and report the loss.
    pub async fn remove_peer(&self, peer_id: &str) -> bool {
        let removed = self.cache.remove(peer_id).await.is_some();
        {
            let mut inner = self.inner.lock().await;
            inner.connected.remove(peer_id);
            if removed {
                inner.peers_lost += 1;
            }
        }
        if let Ok(node_id) = NodeId::from_hex(peer_id) {
            self.dht.remove_node(&node_id).await;
        }
        if removed {
            let _ = self
                .events
                .emit(EventPayload::PeerLost { peer_id: peer_id.to_string() })
                .await;
        }
        removed
    }

    /// Every peer the orchestrator currently knows.
    pub async fn cached_peers(&self) -> Vec<Peer> {
        self.cache.all_peers().await
    }

    /// Known peers, most recently seen first.
    pub async fn discovered_peers(&self) -> Vec<Peer> {
        let mut peers = self.cache.all_peers().await;
        peers.sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
        peers
    }

    pub async fn connected_peers(&self) -> Vec<Peer> {
        let connected: HashSet<String> = self.inner.lock().await.connected.clone();
        self.cache
            .all_peers()
            .await
            .into_iter()
            .filter(|p| connected.contains(&p.peer_id))
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connected.len()
    }

    pub async fn stats(&self) -> DiscoveryStats {
        let known_peers = self.cache.len().await;
        let inner = self.inner.lock().await;
        DiscoveryStats {
            discovery_rounds: inner.discovery_rounds,
            peers_discovered: inner.peers_discovered,
            peers_lost: inner.peers_lost,
            bootstrap_attempts: inner.bootstrap_attempts,
            errors: inner.errors,
            known_peers,
            connected_peers: inner.connected.len(),
        }
    }

    /// Merge two peer lists for a composing overlay manager: per peer
    /// id the fresher record wins, and the result is ordered most
    /// recently seen first.
    pub fn merge_peer_lists(ours: Vec<Peer>, theirs: Vec<Peer>) -> Vec<Peer> {
        let mut by_id: HashMap<String, Peer> = HashMap::new();
        for peer in ours.into_iter().chain(theirs) {
            match by_id.get(&peer.peer_id) {
                Some(existing) if existing.last_seen_ms >= peer.last_seen_ms => {}
                _ => {
                    by_id.insert(peer.peer_id.clone(), peer);
                }
            }
        }
        let mut merged: Vec<Peer> = by_id.into_values().collect();
        merged.sort_by(|a, b| {
            b.last_seen_ms.cmp(&a.last_seen_ms).then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        merged
    }

    // ------------------------------------------------------------------
    // Background loops
    // ------------------------------------------------------------------

    fn spawn_discovery_loop(&self) -> JoinHandle<()> {
        let discovery = self.clone();
        tokio::spawn(async move {
            let base = discovery.config.discovery_interval;
            let mut delay = base;
            loop {
                tokio::time::sleep(delay).await;
                match discovery.try_discovery_round().await {
                    Ok(_) => delay = base,
                    Err(error) => {
                        {
                            let mut inner = discovery.inner.lock().await;
                            inner.errors += 1;
                        }
                        warn!(error = %error, next_delay = ?delay, "discovery round failed");
                        let _ = discovery
                            .events
                            .emit(EventPayload::DiscoveryError {
                                message: format!("discovery round failed: {error}"),
                                severity: ErrorSeverity::Medium,
                                recoverable: true,
                            })
                            .await;
                        delay = (delay * 2).min(base * MAX_BACKOFF_FACTOR);
                    }
                }
            }
        })
    }

    async fn try_discovery_round(&self) -> Result<usize> {
        let adopted = self.discovery_round().await?;
        Ok(adopted.len())
    }

    fn spawn_bootstrap_retry_loop(&self) -> JoinHandle<()> {
        let discovery = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(discovery.config.bootstrap_retry_interval);
            interval.tick().await;
            loop {
                interval.tick().await;

                let known = discovery.cache.len().await;
                if known >= MIN_VIABLE_PEERS {
                    let mut inner = discovery.inner.lock().await;
                    inner.bootstrap_retries_used = 0;
                    inner.below_floor = false;
                    continue;
                }

                let attempt = {
                    let mut inner = discovery.inner.lock().await;
                    inner.below_floor = true;
                    if inner.bootstrap_retries_used >= discovery.config.max_bootstrap_retries {
                        None
                    } else {
                        inner.bootstrap_retries_used += 1;
                        Some(inner.bootstrap_retries_used)
                    }
                };
                let Some(attempt) = attempt else {
                    trace!(known, "bootstrap retries exhausted");
                    continue;
                };

                debug!(known, attempt, "re-bootstrapping from cached seeds");
                let seeds: Vec<Peer> = discovery
                    .cache
                    .bootstrap_peers()
                    .await
                    .into_iter()
                    .map(|entry| entry.peer)
                    .collect();
                if seeds.is_empty() {
                    let _ = discovery
                        .events
                        .emit(EventPayload::DiscoveryError {
                            message: "peer count below floor and no bootstrap seeds cached".into(),
                            severity: ErrorSeverity::High,
                            recoverable: false,
                        })
                        .await;
                    continue;
                }
                discovery.bootstrap(&seeds).await;
            }
        })
    }

    fn spawn_expiry_sweep_loop(&self) -> JoinHandle<()> {
        let discovery = self.clone();
        tokio::spawn(async move {
            let period = (discovery.config.peer_cache_expiry / 4).max(Duration::from_millis(50));
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                discovery.run_expiry_sweep().await;
            }
        })
    }

    /// Drop peers unseen for longer than the expiry window, then
    /// enforce the cache-size target. Bootstrap and connected peers
    /// are exempt.
    async fn run_expiry_sweep(&self) {
        let expiry_ms = self.config.peer_cache_expiry.as_millis() as u64;
        let now = now_ms();

        let entries = self.cache.snapshot().await;
        let known_before = entries.len();
        let connected: HashSet<String> = self.inner.lock().await.connected.clone();

        let mut stale: Vec<String> = entries
            .iter()
            .filter(|e| {
                !e.bootstrap
                    && !connected.contains(&e.peer.peer_id)
                    && now.saturating_sub(e.peer.last_seen_ms) > expiry_ms
            })
            .map(|e| e.peer.peer_id.clone())
            .collect();

        // Size enforcement: oldest removable peers beyond the target.
        let overflow = known_before.saturating_sub(self.config.peer_cache_size);
        if overflow > stale.len() {
            let mut removable: Vec<&crate::cache::CachedPeer> = entries
                .iter()
                .filter(|e| {
                    !e.bootstrap
                        && !connected.contains(&e.peer.peer_id)
                        && !stale.contains(&e.peer.peer_id)
                })
                .collect();
            removable.sort_by_key(|e| e.peer.last_seen_ms);
            for entry in removable.into_iter().take(overflow - stale.len()) {
                stale.push(entry.peer.peer_id.clone());
            }
        }

        if stale.is_empty() {
            return;
        }

        let removed_count = stale.len();
        for peer_id in stale {
            self.remove_peer(&peer_id).await;
        }
        debug!(removed = removed_count, known_before, "cache expiry sweep");

        // Losing at least half of the known overlay at once is a
        // partition signal, not routine churn.
        if known_before > 0 && removed_count * 2 >= known_before {
            let _ = self
                .events
                .emit(EventPayload::NetworkPartition { lost_peers: removed_count })
                .await;
        }
        if self.cache.len().await < MIN_VIABLE_PEERS {
            self.inner.lock().await.below_floor = true;
        }
    }

    /// Emit a merge signal when the overlay recovers past the
    /// minimum-viable floor.
    async fn check_floor_recovery(&self) {
        let known = self.cache.len().await;
        if known < MIN_VIABLE_PEERS {
            return;
        }
        let recovered = {
            let mut inner = self.inner.lock().await;
            let recovered = inner.below_floor;
            inner.below_floor = false;
            recovered
        };
        if recovered {
            let _ = self
                .events
                .emit(EventPayload::NetworkMerge { gained_peers: known })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::dht::DhtConfig;
    use crate::transport::{InMemoryTransport, TransportHub};

    async fn discovery_on_hub(
        hub: &TransportHub,
        port: u16,
        config: DiscoveryConfig,
    ) -> Discovery<InMemoryTransport> {
        let endpoint = format!("127.0.0.1:{port}");
        let (transport, inbox) = hub.register(&endpoint).await;
        let dht_config = DhtConfig {
            k: 8,
            alpha: 2,
            ping_timeout: Duration::from_millis(500),
            ..DhtConfig::default()
        };
        let dht = Dht::new(dht_config, "127.0.0.1", port, transport).expect("dht config valid");
        dht.run_inbox(inbox);
        let cache = PeerCache::new(CacheConfig::default()).expect("cache config valid");
        Discovery::new(dht, cache, Arc::new(EventBus::new()), config).expect("config valid")
    }

    fn peer_at(port: u16) -> Peer {
        Peer::new(NodeId::random().to_hex(), "127.0.0.1", port)
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        assert!(DiscoveryConfig::default().validate().is_ok());
        assert!(DiscoveryConfig { discovery_interval: Duration::ZERO, ..DiscoveryConfig::default() }
            .validate()
            .is_err());
        assert!(DiscoveryConfig { peer_cache_size: 0, ..DiscoveryConfig::default() }
            .validate()
            .is_err());
    }

    #[test]
    fn merge_keeps_the_fresher_record_per_peer() {
        let mut stale = Peer::new("aa", "10.0.0.1", 1);
        stale.last_seen_ms = 100;
        let mut fresh = Peer::new("aa", "10.0.0.2", 2);
        fresh.last_seen_ms = 200;
        let mut other = Peer::new("bb", "10.0.0.3", 3);
        other.last_seen_ms = 150;

        let merged = Discovery::<InMemoryTransport>::merge_peer_lists(
            vec![stale, other.clone()],
            vec![fresh.clone()],
        );

        assert_eq!(merged.len(), 2);
        // Descending by last_seen: the fresher "aa" record first.
        assert_eq!(merged[0].peer_id, "aa");
        assert_eq!(merged[0].address, "10.0.0.2");
        assert_eq!(merged[1].peer_id, "bb");
    }

    #[tokio::test]
    async fn start_transitions_status_and_is_idempotent() {
        let hub = TransportHub::new();
        let discovery = discovery_on_hub(
            &hub,
            5000,
            DiscoveryConfig {
                enable_periodic_discovery: false,
                enable_bootstrap_retry: false,
                ..DiscoveryConfig::default()
            },
        )
        .await;

        assert_eq!(discovery.status(), NetworkStatus::Stopped);
        discovery.start(Vec::new()).await.unwrap();
        assert_eq!(discovery.status(), NetworkStatus::Running);
        discovery.start(Vec::new()).await.unwrap();

        discovery.stop().await;
        assert_eq!(discovery.status(), NetworkStatus::Stopped);
        discovery.stop().await;
        assert_eq!(discovery.status(), NetworkStatus::Stopped);
    }

    #[tokio::test]
    async fn bootstrap_seeds_cache_and_routing() {
        let hub = TransportHub::new();
        let discovery = discovery_on_hub(
            &hub,
            5010,
            DiscoveryConfig {
                enable_periodic_discovery: false,
                enable_bootstrap_retry: false,
                ..DiscoveryConfig::default()
            },
        )
        .await;
        let other = discovery_on_hub(
            &hub,
            5011,
            DiscoveryConfig {
                enable_periodic_discovery: false,
                enable_bootstrap_retry: false,
                ..DiscoveryConfig::default()
            },
        )
        .await;

        let seed = Peer::from_node(&other.dht().local_node());
        discovery.start(vec![seed.clone()]).await.unwrap();

        let seeds = discovery.cache().bootstrap_peers().await;
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].peer.peer_id, seed.peer_id);
        assert!(discovery.dht().routing_table_size().await >= 1);

        discovery.stop().await;
        other.stop().await;
    }

    #[tokio::test]
    async fn discovered_peers_flow_into_cache_and_events() {
        let hub = TransportHub::new();
        let discovery = discovery_on_hub(
            &hub,
            5020,
            DiscoveryConfig {
                enable_periodic_discovery: false,
                enable_bootstrap_retry: false,
                ..DiscoveryConfig::default()
            },
        )
        .await;

        let peer = peer_at(5999);
        discovery.add_discovered_peer(peer.clone()).await;

        assert!(discovery.cache().contains(&peer.peer_id).await);
        let listed = discovery.cached_peers().await;
        assert!(listed.iter().any(|p| p.peer_id == peer.peer_id));

        discovery.events().flush().await;
        let history = discovery
            .events()
            .history(Some(crate::events::EventKind::PeerDiscovered), None, None)
            .await;
        assert_eq!(history.len(), 1);

        // Re-adding the same peer does not re-announce it.
        discovery.add_discovered_peer(peer.clone()).await;
        discovery.events().flush().await;
        let history = discovery
            .events()
            .history(Some(crate::events::EventKind::PeerDiscovered), None, None)
            .await;
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn connection_marking_emits_transitions_once() {
        let hub = TransportHub::new();
        let discovery = discovery_on_hub(
            &hub,
            5030,
            DiscoveryConfig {
                enable_periodic_discovery: false,
                enable_bootstrap_retry: false,
                ..DiscoveryConfig::default()
            },
        )
        .await;

        let peer = peer_at(5998);
        discovery.add_discovered_peer(peer.clone()).await;

        discovery.mark_peer_connected(&peer.peer_id).await;
        discovery.mark_peer_connected(&peer.peer_id).await;
        assert_eq!(discovery.connection_count().await, 1);
        let connected = discovery.connected_peers().await;
        assert_eq!(connected.len(), 1);
        assert_eq!(connected[0].peer_id, peer.peer_id);

        discovery.mark_peer_disconnected(&peer.peer_id).await;
        assert_eq!(discovery.connection_count().await, 0);

        discovery.events().flush().await;
        let events = discovery.events();
        assert_eq!(events.history(Some(crate::events::EventKind::PeerConnected), None, None).await.len(), 1);
        assert_eq!(events.history(Some(crate::events::EventKind::PeerDisconnected), None, None).await.len(), 1);
        assert_eq!(
            events.history(Some(crate::events::EventKind::PeerStatusChanged), None, None).await.len(),
            2
        );
    }

    #[tokio::test]
    async fn expiry_sweep_drops_stale_unprotected_peers() {
        let hub = TransportHub::new();
        let discovery = discovery_on_hub(
            &hub,
            5040,
            DiscoveryConfig {
                peer_cache_expiry: Duration::from_millis(50),
                enable_periodic_discovery: false,
                enable_bootstrap_retry: false,
                ..DiscoveryConfig::default()
            },
        )
        .await;

        let stale = peer_at(5901);
        let protected = peer_at(5902);
        discovery.add_discovered_peer(stale.clone()).await;
        discovery.add_discovered_peer(protected.clone()).await;
        discovery.mark_peer_connected(&protected.peer_id).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        discovery.run_expiry_sweep().await;

        assert!(!discovery.cache().contains(&stale.peer_id).await);
        assert!(discovery.cache().contains(&protected.peer_id).await);

        discovery.events().flush().await;
        let lost = discovery
            .events()
            .history(Some(crate::events::EventKind::PeerLost), None, None)
            .await;
        assert_eq!(lost.len(), 1);

        let stats = discovery.stats().await;
        assert_eq!(stats.peers_lost, 1);
    }

    #[tokio::test]
    async fn remove_peer_reports_loss_once() {
        let hub = TransportHub::new();
        let discovery = discovery_on_hub(
            &hub,
            5050,
            DiscoveryConfig {
                enable_periodic_discovery: false,
                enable_bootstrap_retry: false,
                ..DiscoveryConfig::default()
            },
        )
        .await;

        let peer = peer_at(5903);
        discovery.add_discovered_peer(peer.clone()).await;
        assert!(discovery.remove_peer(&peer.peer_id).await);
        assert!(!discovery.remove_peer(&peer.peer_id).await);

        discovery.events().flush().await;
        let lost = discovery
            .events()
            .history(Some(crate::events::EventKind::PeerLost), None, None)
            .await;
        assert_eq!(lost.len(), 1);
    }
}
