//! Two-tier peer cache with pluggable eviction and reputation.
//!
//! Discovered peers land in a size-bounded hot tier backed by a larger
//! cold tier. When the hot tier overflows, the worst-ranked
//! non-critical entries spill to cold (while it has room); a cold hit
//! promotes the entry back to hot. Entries expire by TTL, checked on
//! access and by a background sweep, and every peer carries a
//! reputation in `[0, 1]` adjusted by connection outcomes and decayed
//! over time.
//!
//! Eviction ranking is selected at construction via
//! [`EvictionPolicy`]; the default weighs recency, frequency,
//! reputation, and remaining TTL together (see [`CachedPeer::score`]).
//!
//! All state sits behind one async mutex; every public method is a
//! suspension point and observes a consistent snapshot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::peer::{now_ms, Peer};
use crate::ConfigError;

/// Reputation adjustment for one connection outcome.
const REPUTATION_STEP: f64 = 0.1;

/// Reputation applied to never-before-seen peers.
const INITIAL_REPUTATION: f64 = 0.5;

/// Period of the reputation decay sweep.
const DECAY_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Window size for retrieval latency statistics.
const RETRIEVAL_WINDOW: usize = 100;

/// Saturation point of the frequency term in the hybrid score.
const SCORE_ACCESS_SATURATION: f64 = 100.0;

/// Age at which the recency term of the hybrid score bottoms out.
const SCORE_RECENCY_HORIZON_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// Cache priority classes. Ordering matters: higher priorities rank
/// later in eviction and `Critical` is never evicted from hot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PeerPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// Hot-tier eviction ranking, selected at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    /// Least recently accessed first.
    Lru,
    /// Least frequently accessed first.
    Lfu,
    /// Soonest-expiring first.
    Ttl,
    /// Lowest reputation first.
    Reputation,
    /// Lowest hybrid score first (recency + frequency + reputation +
    /// remaining TTL).
    LruWithReputation,
    /// Highest network distance first.
    NetworkDistance,
}

/// One recorded connection attempt toward a peer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionAttempt {
    pub timestamp_ms: u64,
    pub success: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
    pub method: String,
}

/// A peer as the cache tracks it: the record plus access, scoring,
/// and history metadata. Field round-trip equality (history order
/// included) is preserved across tiers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedPeer {
    pub peer: Peer,
    pub cached_at_ms: u64,
    pub last_accessed_ms: u64,
    pub access_count: u64,
    pub ttl: Duration,
    pub priority: PeerPriority,
    pub reputation: f64,
    pub bootstrap: bool,
    pub connection_history: VecDeque<ConnectionAttempt>,
    pub network_distance: Option<u32>,
    pub tags: HashSet<String>,
    pub metadata: HashMap<String, String>,
}

impl CachedPeer {
    fn new(peer: Peer, priority: PeerPriority, ttl: Duration) -> Self {
        let now = now_ms();
        Self {
            peer,
            cached_at_ms: now,
            last_accessed_ms: now,
            access_count: 0,
            ttl,
            priority,
            reputation: INITIAL_REPUTATION,
            bootstrap: false,
            connection_history: VecDeque::new(),
            network_distance: None,
            tags: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    /// Whether the entry has outlived its TTL. Bootstrap peers never
    /// expire while flagged.
    pub fn is_expired(&self, now: u64) -> bool {
        if self.bootstrap {
            return false;
        }
        now.saturating_sub(self.cached_at_ms) > self.ttl.as_millis() as u64
    }

    /// Hybrid retention score; higher is more valuable.
    ///
    /// `0.30·reputation + 0.25·frequency + 0.25·recency + 0.20·ttl_remaining`,
    /// with each term normalized into `[0, 1]`.
    pub fn score(&self, now: u64) -> f64 {
        let frequency = (self.access_count as f64 / SCORE_ACCESS_SATURATION).min(1.0);
        let age_since_access = now.saturating_sub(self.last_accessed_ms) as f64;
        let recency = 1.0 - (age_since_access / SCORE_RECENCY_HORIZON_MS).min(1.0);
        let ttl_ms = (self.ttl.as_millis() as f64).max(1.0);
        let age_since_cached = now.saturating_sub(self.cached_at_ms) as f64;
        let freshness = 1.0 - (age_since_cached / ttl_ms).min(1.0);

        0.30 * self.reputation + 0.25 * frequency + 0.25 * recency + 0.20 * freshness
    }

    fn record_access(&mut self) {
        self.last_accessed_ms = now_ms();
        self.access_count = self.access_count.saturating_add(1);
    }
}

/// Cache configuration. Sizes are entry counts.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub max_memory_cache_size: usize,
    pub max_disk_cache_size: usize,
    pub default_ttl: Duration,
    /// TTL applied to `High` and `Critical` insertions.
    pub high_priority_ttl: Duration,
    pub cleanup_interval: Duration,
    pub persistence_enabled: bool,
    pub compression_enabled: bool,
    pub eviction_policy: EvictionPolicy,
    /// Fraction of reputation lost per decay sweep.
    pub reputation_decay_rate: f64,
    pub connection_history_size: usize,
    pub auto_warming_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_cache_size: 500,
            max_disk_cache_size: 2000,
            default_ttl: Duration::from_secs(24 * 60 * 60),
            high_priority_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            persistence_enabled: true,
            compression_enabled: true,
            eviction_policy: EvictionPolicy::LruWithReputation,
            reputation_decay_rate: 0.1,
            connection_history_size: 10,
            auto_warming_enabled: true,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memory_cache_size == 0 || self.max_disk_cache_size == 0 {
            return Err(ConfigError::new("cache tier sizes must be positive"));
        }
        if self.default_ttl.is_zero() || self.high_priority_ttl.is_zero() {
            return Err(ConfigError::new("cache TTLs must be positive"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::new("cleanup_interval must be positive"));
        }
        if !(0.0..=1.0).contains(&self.reputation_decay_rate) {
            return Err(ConfigError::new("reputation_decay_rate must be within [0, 1]"));
        }
        if self.connection_history_size == 0 {
            return Err(ConfigError::new("connection_history_size must be positive"));
        }
        Ok(())
    }

    fn ttl_for(&self, priority: PeerPriority) -> Duration {
        match priority {
            PeerPriority::High | PeerPriority::Critical => self.high_priority_ttl,
            PeerPriority::Low | PeerPriority::Normal => self.default_ttl,
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Clone, Debug, Default)]
pub struct CacheStats {
    pub hot_size: usize,
    pub cold_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub insertions: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub promotions: u64,
    pub decay_sweeps: u64,
    pub avg_retrieval_ms: f64,
    /// Hot + cold entry counts per priority class.
    pub by_priority: HashMap<PeerPriority, usize>,
}

struct CacheInner {
    hot: HashMap<String, CachedPeer>,
    cold: LruCache<String, CachedPeer>,
    hits: u64,
    misses: u64,
    insertions: u64,
    evictions: u64,
    expirations: u64,
    promotions: u64,
    decay_sweeps: u64,
    retrieval_times: VecDeque<f64>,
}

struct RunState {
    started: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// The two-tier peer cache. Cloning shares all state.
#[derive(Clone)]
pub struct PeerCache {
    config: CacheConfig,
    inner: Arc<Mutex<CacheInner>>,
    run_state: Arc<Mutex<RunState>>,
}

impl PeerCache {
    /// # Errors
    /// Returns [`ConfigError`] for out-of-range configuration.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cold_cap = NonZeroUsize::new(config.max_disk_cache_size)
            .expect("validated max_disk_cache_size is non-zero");
        Ok(Self {
            config,
            inner: Arc::new(Mutex::new(CacheInner {
                hot: HashMap::new(),
                cold: LruCache::new(cold_cap),
                hits: 0,
                misses: 0,
                insertions: 0,
                evictions: 0,
                expirations: 0,
                promotions: 0,
                decay_sweeps: 0,
                retrieval_times: VecDeque::with_capacity(RETRIEVAL_WINDOW),
            })),
            run_state: Arc::new(Mutex::new(RunState { started: false, tasks: Vec::new() })),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Spawn the TTL sweep and reputation decay loops. Idempotent.
    pub async fn start(&self) {
        let mut run = self.run_state.lock().await;
        if run.started {
            return;
        }
        run.started = true;

        let cache = self.clone();
        run.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(cache.config.cleanup_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = cache.sweep_expired_once().await;
                if removed > 0 {
                    debug!(removed, "cache expiry sweep");
                }
            }
        }));

        let cache = self.clone();
        run.tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(DECAY_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                cache.decay_reputation_once().await;
            }
        }));
    }

    /// Cancel background loops. Idempotent.
    pub async fn stop(&self) {
        let mut run = self.run_state.lock().await;
        run.started = false;
        for task in run.tasks.drain(..) {
            task.abort();
        }
    }

    /// Insert or update a peer.
    ///
    /// Updates keep `cached_at`, reputation, bootstrap flag, and
    /// connection history, refresh `last_accessed`, bump the access
    /// count, and adopt the supplied priority, TTL, tags, and
    /// metadata.
    pub async fn put(
        &self,
        peer: Peer,
        priority: PeerPriority,
        ttl: Option<Duration>,
        tags: HashSet<String>,
        metadata: HashMap<String, String>,
    ) {
        self.put_full(peer, priority, ttl, tags, metadata, None).await;
    }

    /// Insert a bootstrap seed: high priority, flagged so TTL expiry
    /// never removes it.
    pub async fn put_bootstrap(&self, peer: Peer) {
        self.put_full(peer, PeerPriority::High, None, HashSet::new(), HashMap::new(), Some(true))
            .await;
    }

    async fn put_full(
        &self,
        peer: Peer,
        priority: PeerPriority,
        ttl: Option<Duration>,
        tags: HashSet<String>,
        metadata: HashMap<String, String>,
        bootstrap: Option<bool>,
    ) {
        let ttl = ttl.unwrap_or_else(|| self.config.ttl_for(priority));
        let peer_id = peer.peer_id.clone();
        let mut inner = self.inner.lock().await;

        let existing = inner.hot.remove(&peer_id).or_else(|| inner.cold.pop(&peer_id));
        let entry = match existing {
            Some(mut entry) => {
                entry.peer = peer;
                entry.priority = priority;
                entry.ttl = ttl;
                entry.tags = tags;
                entry.metadata = metadata;
                if let Some(flag) = bootstrap {
                    entry.bootstrap = flag;
                }
                entry.record_access();
                entry
            }
            None => {
                inner.insertions += 1;
                let mut entry = CachedPeer::new(peer, priority, ttl);
                if let Some(flag) = bootstrap {
                    entry.bootstrap = flag;
                }
                entry.tags = tags;
                entry.metadata = metadata;
                entry
            }
        };

        inner.hot.insert(peer_id, entry);
        self.enforce_hot_capacity(&mut inner);
    }

    /// Fetch a peer: hot tier first, then cold with promotion.
    /// Expired entries are dropped and reported as misses.
    pub async fn get(&self, peer_id: &str) -> Option<CachedPeer> {
        let started = Instant::now();
        let now = now_ms();
        let mut inner = self.inner.lock().await;

        let mut result: Option<CachedPeer> = None;
        let mut hot_expired = false;

        match inner.hot.get_mut(peer_id) {
            Some(entry) if entry.is_expired(now) => hot_expired = true,
            Some(entry) => {
                entry.record_access();
                result = Some(entry.clone());
            }
            None => {}
        }
        if hot_expired {
            inner.hot.remove(peer_id);
            inner.expirations += 1;
        }

        if result.is_none() && !hot_expired {
            if let Some(mut entry) = inner.cold.pop(peer_id) {
                if entry.is_expired(now) {
                    inner.expirations += 1;
                } else {
                    entry.record_access();
                    inner.promotions += 1;
                    inner.hot.insert(peer_id.to_string(), entry.clone());
                    self.enforce_hot_capacity(&mut inner);
                    result = Some(entry);
                }
            }
        }

        match &result {
            Some(_) => inner.hits += 1,
            None => inner.misses += 1,
        }
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if inner.retrieval_times.len() == RETRIEVAL_WINDOW {
            inner.retrieval_times.pop_front();
        }
        inner.retrieval_times.push_back(elapsed_ms);

        result
    }

    /// Adjust reputation by `delta`, clamped into `[0, 1]`.
    pub async fn update_reputation(&self, peer_id: &str, delta: f64) -> bool {
        let mut inner = self.inner.lock().await;
        match entry_mut(&mut inner, peer_id) {
            Some(entry) => {
                entry.reputation = (entry.reputation + delta).clamp(0.0, 1.0);
                true
            }
            None => false,
        }
    }

    /// Record a connection outcome: appended to the history (FIFO,
    /// bounded) and reflected in reputation.
    pub async fn record_connection_attempt(
        &self,
        peer_id: &str,
        success: bool,
        latency: Duration,
        error: Option<String>,
        method: impl Into<String>,
    ) -> bool {
        let cap = self.config.connection_history_size;
        let mut inner = self.inner.lock().await;
        let Some(entry) = entry_mut(&mut inner, peer_id) else {
            return false;
        };

        if entry.connection_history.len() == cap {
            entry.connection_history.pop_front();
        }
        entry.connection_history.push_back(ConnectionAttempt {
            timestamp_ms: now_ms(),
            success,
            latency_ms: latency.as_millis() as u64,
            error,
            method: method.into(),
        });

        let delta = if success { REPUTATION_STEP } else { -REPUTATION_STEP };
        entry.reputation = (entry.reputation + delta).clamp(0.0, 1.0);
        true
    }

    pub async fn update_network_distance(&self, peer_id: &str, distance: u32) -> bool {
        let mut inner = self.inner.lock().await;
        match entry_mut(&mut inner, peer_id) {
            Some(entry) => {
                entry.network_distance = Some(distance);
                true
            }
            None => false,
        }
    }

    pub async fn set_connected(&self, peer_id: &str, connected: bool) -> bool {
        let mut inner = self.inner.lock().await;
        match entry_mut(&mut inner, peer_id) {
            Some(entry) => {
                entry.peer.connected = connected;
                if connected {
                    entry.peer.touch();
                }
                true
            }
            None => false,
        }
    }

    pub async fn get_by_priority(&self, priority: PeerPriority) -> Vec<CachedPeer> {
        let inner = self.inner.lock().await;
        all_entries(&inner).filter(|e| e.priority == priority).cloned().collect()
    }

    /// Entries carrying any of the given tags.
    pub async fn get_by_tags(&self, tags: &[String]) -> Vec<CachedPeer> {
        let inner = self.inner.lock().await;
        all_entries(&inner)
            .filter(|e| tags.iter().any(|t| e.tags.contains(t)))
            .cloned()
            .collect()
    }

    pub async fn bootstrap_peers(&self) -> Vec<CachedPeer> {
        let inner = self.inner.lock().await;
        all_entries(&inner).filter(|e| e.bootstrap).cloned().collect()
    }

    /// The `limit` best-reputed entries, descending.
    pub async fn top_by_reputation(&self, limit: usize) -> Vec<CachedPeer> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<CachedPeer> = all_entries(&inner).cloned().collect();
        entries.sort_by(|a, b| b.reputation.total_cmp(&a.reputation));
        entries.truncate(limit);
        entries
    }

    /// Bulk-insert peers at high priority (cache warming).
    pub async fn warm_cache(&self, peers: Vec<Peer>) -> usize {
        let count = peers.len();
        for peer in peers {
            self.put(peer, PeerPriority::High, None, HashSet::new(), HashMap::new()).await;
        }
        count
    }

    pub async fn remove(&self, peer_id: &str) -> Option<CachedPeer> {
        let mut inner = self.inner.lock().await;
        inner.hot.remove(peer_id).or_else(|| inner.cold.pop(peer_id))
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.hot.clear();
        inner.cold.clear();
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.hot.contains_key(peer_id) || inner.cold.contains(peer_id)
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.hot.len() + inner.cold.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn hot_len(&self) -> usize {
        self.inner.lock().await.hot.len()
    }

    /// Hot-tier snapshot in application form.
    pub async fn cached_peers(&self) -> Vec<Peer> {
        let inner = self.inner.lock().await;
        inner.hot.values().map(|e| e.peer.clone()).collect()
    }

    /// Every live entry (both tiers) in application form, without
    /// touching access statistics.
    pub async fn all_peers(&self) -> Vec<Peer> {
        let inner = self.inner.lock().await;
        all_entries(&inner).map(|e| e.peer.clone()).collect()
    }

    /// Full-entry snapshot of both tiers, without touching access
    /// statistics.
    pub async fn snapshot(&self) -> Vec<CachedPeer> {
        let inner = self.inner.lock().await;
        all_entries(&inner).cloned().collect()
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        let total = (inner.hits + inner.misses) as f64;
        let hit_rate = if total > 0.0 { inner.hits as f64 / total } else { 0.0 };
        let avg_retrieval_ms = if inner.retrieval_times.is_empty() {
            0.0
        } else {
            inner.retrieval_times.iter().sum::<f64>() / inner.retrieval_times.len() as f64
        };

        let mut by_priority: HashMap<PeerPriority, usize> = HashMap::new();
        for entry in all_entries(&inner) {
            *by_priority.entry(entry.priority).or_insert(0) += 1;
        }

        CacheStats {
            hot_size: inner.hot.len(),
            cold_size: inner.cold.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate,
            miss_rate: if total > 0.0 { 1.0 - hit_rate } else { 0.0 },
            insertions: inner.insertions,
            evictions: inner.evictions,
            expirations: inner.expirations,
            promotions: inner.promotions,
            decay_sweeps: inner.decay_sweeps,
            avg_retrieval_ms,
            by_priority,
        }
    }

    /// Drop expired entries from both tiers. Returns the removal
    /// count. The background sweep calls this on `cleanup_interval`.
    pub async fn sweep_expired_once(&self) -> usize {
        let now = now_ms();
        let mut inner = self.inner.lock().await;

        let hot_expired: Vec<String> = inner
            .hot
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &hot_expired {
            inner.hot.remove(id);
        }

        let cold_expired: Vec<String> = inner
            .cold
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &cold_expired {
            inner.cold.pop(id);
        }

        let removed = hot_expired.len() + cold_expired.len();
        inner.expirations += removed as u64;
        removed
    }

    /// Multiply every reputation by `1 - decay_rate`. The background
    /// loop runs this daily.
    pub async fn decay_reputation_once(&self) {
        let rate = self.config.reputation_decay_rate;
        let mut inner = self.inner.lock().await;
        for entry in inner.hot.values_mut() {
            entry.reputation = (entry.reputation * (1.0 - rate)).clamp(0.0, 1.0);
        }
        // LruCache exposes mutation through iter_mut.
        for (_, entry) in inner.cold.iter_mut() {
            entry.reputation = (entry.reputation * (1.0 - rate)).clamp(0.0, 1.0);
        }
        inner.decay_sweeps += 1;
        trace!(rate, "reputation decay sweep");
    }

    /// Spill worst-ranked non-critical entries until the hot tier fits
    /// its bound. Spilled entries go cold while there is room.
    fn enforce_hot_capacity(&self, inner: &mut CacheInner) {
        let bound = self.config.max_memory_cache_size;
        let now = now_ms();

        while inner.hot.len() > bound {
            let victim = self.pick_eviction_victim(&inner.hot, now);
            let Some(victim_id) = victim else {
                // Everything left is critical; the bound yields to the
                // retention guarantee.
                warn!(
                    size = inner.hot.len(),
                    bound, "hot tier over capacity with only critical entries"
                );
                break;
            };
            let Some(entry) = inner.hot.remove(&victim_id) else { break };
            inner.evictions += 1;

            if inner.cold.len() < self.config.max_disk_cache_size {
                inner.cold.put(victim_id, entry);
            }
        }
    }

    /// The worst-ranked non-critical hot entry under the configured
    /// policy, or `None` when only critical entries remain.
    fn pick_eviction_victim(&self, hot: &HashMap<String, CachedPeer>, now: u64) -> Option<String> {
        let candidates = hot.iter().filter(|(_, e)| e.priority != PeerPriority::Critical);

        let victim = match self.config.eviction_policy {
            EvictionPolicy::Lru => candidates.min_by_key(|(_, e)| e.last_accessed_ms),
            EvictionPolicy::Lfu => candidates.min_by_key(|(_, e)| e.access_count),
            EvictionPolicy::Ttl => {
                candidates.min_by_key(|(_, e)| e.cached_at_ms + e.ttl.as_millis() as u64)
            }
            EvictionPolicy::Reputation => {
                candidates.min_by(|(_, a), (_, b)| a.reputation.total_cmp(&b.reputation))
            }
            EvictionPolicy::LruWithReputation => {
                candidates.min_by(|(_, a), (_, b)| a.score(now).total_cmp(&b.score(now)))
            }
            EvictionPolicy::NetworkDistance => {
                // Unknown distance ranks as nearest so fresh entries
                // are not evicted before they get measured.
                candidates.max_by_key(|(_, e)| e.network_distance.unwrap_or(0))
            }
        };
        victim.map(|(id, _)| id.clone())
    }
}

fn entry_mut<'a>(inner: &'a mut CacheInner, peer_id: &str) -> Option<&'a mut CachedPeer> {
    if inner.hot.contains_key(peer_id) {
        return inner.hot.get_mut(peer_id);
    }
    inner.cold.get_mut(peer_id)
}

fn all_entries(inner: &CacheInner) -> impl Iterator<Item = &CachedPeer> {
    inner.hot.values().chain(inner.cold.iter().map(|(_, e)| e))
}
