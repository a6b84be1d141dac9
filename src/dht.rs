//! Kademlia DHT engine.
//!
//! Iterative α-parallel lookups over 160-bit XOR keyspace, a local
//! key-value store with republish and expiry, and the maintenance
//! loops that keep routing state fresh.
//!
//! ## Key operations
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `store(key, value)` | Write locally and replicate to the k closest nodes |
//! | `find_value(key)` | Local hit short-circuits, else iterative lookup |
//! | `find_node(target)` | Iterative lookup for the k closest contacts |
//! | `ping(node)` | One-shot liveness probe with timeout |
//! | `bootstrap(seeds)` | Seed routing and look up the local id |
//!
//! ## Actor architecture
//!
//! [`Dht`] is a cheaply-cloneable handle; a private `DhtActor` owns
//! the routing table, the data store, and the pending-request map, and
//! processes commands sequentially off an mpsc channel. Network I/O
//! never runs on the actor: lookups fan out from the handle via
//! [`tokio::task::JoinSet`] and talk to the actor only for state.
//!
//! Request/response correlation is by `request_id`: the sender parks a
//! oneshot waiter in the actor's pending map, and the first matching
//! response completes it. A waiter completes exactly once, with a
//! response, a timeout, or a cancellation at shutdown.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::messages::{DhtMessage, MessageKind, MAX_VALUE_SIZE};
use crate::node_id::{distance_cmp, random_id_in_bucket, Key, NodeId};
use crate::peer::{now_ms, Node};
use crate::routing::RoutingTable;
use crate::transport::Transport;
use crate::ConfigError;

/// Default replication factor (bucket size).
pub const DEFAULT_K: usize = 20;

/// Default lookup concurrency.
pub const DEFAULT_ALPHA: usize = 3;

/// Window size for the request latency average.
const LATENCY_WINDOW: usize = 100;

/// Upper bound on lookup rounds; terminates pathological topologies.
const MAX_LOOKUP_ROUNDS: usize = 20;

/// Depth of the actor command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// DHT engine configuration. Defaults follow the documented protocol
/// parameters; [`DhtConfig::validate`] refuses out-of-range values
/// before any task is spawned.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Local identifier; random when unset.
    pub node_id: Option<NodeId>,
    /// Replication factor / bucket capacity.
    pub k: usize,
    /// Lookup parallelism.
    pub alpha: usize,
    pub bucket_refresh_interval: Duration,
    pub republish_interval: Duration,
    /// Stored values older than this are dropped instead of
    /// republished.
    pub expire_interval: Duration,
    /// Bound on every outbound request.
    pub ping_timeout: Duration,
    /// Retries for replication sends.
    pub max_retries: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            k: DEFAULT_K,
            alpha: DEFAULT_ALPHA,
            bucket_refresh_interval: Duration::from_secs(60 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            expire_interval: Duration::from_secs(24 * 60 * 60),
            ping_timeout: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k == 0 {
            return Err(ConfigError::new("k must be positive"));
        }
        if self.alpha == 0 {
            return Err(ConfigError::new("alpha must be positive"));
        }
        if self.alpha > self.k {
            return Err(ConfigError::new("alpha must not exceed k"));
        }
        if self.bucket_refresh_interval.is_zero()
            || self.republish_interval.is_zero()
            || self.expire_interval.is_zero()
        {
            return Err(ConfigError::new("maintenance intervals must be positive"));
        }
        if self.ping_timeout.is_zero() {
            return Err(ConfigError::new("ping_timeout must be positive"));
        }
        Ok(())
    }
}

/// Outcome of a lookup. `found` is set only when a `find_value`
/// located the key; `find_node` reports the closest contacts alone.
#[derive(Clone, Debug, Default)]
pub struct LookupResult {
    pub nodes: Vec<Node>,
    pub value: Option<Vec<u8>>,
    pub found: bool,
}

/// Why a parked request waiter completed without a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestFailure {
    TimedOut,
    Cancelled,
}

impl fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestFailure::TimedOut => write!(f, "request timed out"),
            RequestFailure::Cancelled => write!(f, "request cancelled"),
        }
    }
}

/// Aggregate engine counters plus a point-in-time state snapshot.
#[derive(Clone, Debug, Default)]
pub struct DhtStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub requests_timed_out: u64,
    pub send_failures: u64,
    pub lookups: u64,
    pub store_operations: u64,
    pub values_found: u64,
    pub routing_table_size: usize,
    pub stored_keys: usize,
    pub pending_requests: usize,
    pub avg_request_latency_ms: f64,
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    requests_timed_out: AtomicU64,
    send_failures: AtomicU64,
    lookups: AtomicU64,
    store_operations: AtomicU64,
    values_found: AtomicU64,
}

struct StoredValue {
    value: Vec<u8>,
    stored_at_ms: u64,
}

struct PendingRequest {
    waiter: oneshot::Sender<Result<DhtMessage, RequestFailure>>,
    registered_at: Instant,
}

enum Command {
    AddNode(Node, oneshot::Sender<bool>),
    /// Fire-and-forget routing observation (lookup-discovered nodes).
    Observe(Node),
    RemoveNode(NodeId, oneshot::Sender<bool>),
    Closest(NodeId, usize, oneshot::Sender<Vec<Node>>),
    AllNodes(oneshot::Sender<Vec<Node>>),
    TableSize(oneshot::Sender<usize>),
    MarkAlive(NodeId, bool),
    BucketsNeedingRefresh(Duration, oneshot::Sender<Vec<usize>>),

    StoreLocal(Key, Vec<u8>, oneshot::Sender<bool>),
    GetLocal(Key, oneshot::Sender<Option<Vec<u8>>>),
    /// Drain republishable entries, dropping expired ones in place.
    Republishable(oneshot::Sender<Vec<(Key, Vec<u8>)>>),

    RegisterWaiter(u64, oneshot::Sender<Result<DhtMessage, RequestFailure>>),
    DropWaiter(u64),
    CompleteWaiter(Box<DhtMessage>),
    /// Fail pending requests older than the deadline.
    ExpirePending(Duration),

    HandleRequest(Box<DhtMessage>, oneshot::Sender<Option<DhtMessage>>),
    Snapshot(oneshot::Sender<(usize, usize, usize, f64)>),
    Quit,
}

struct DhtActor {
    cmd_rx: mpsc::Receiver<Command>,
    routing: RoutingTable,
    store: HashMap<Key, StoredValue>,
    pending: HashMap<u64, PendingRequest>,
    latencies: VecDeque<f64>,
    local: Node,
    config: DhtConfig,
}

struct RunState {
    started: bool,
    stopped: bool,
    tasks: Vec<JoinHandle<()>>,
}

/// Handle to the DHT engine. Clones share the underlying actor.
pub struct Dht<T: Transport> {
    cmd_tx: mpsc::Sender<Command>,
    local: Node,
    config: DhtConfig,
    transport: Arc<T>,
    counters: Arc<Counters>,
    run_state: Arc<Mutex<RunState>>,
    message_tap: Arc<Mutex<Option<mpsc::Sender<DhtMessage>>>>,
}

impl<T: Transport> Clone for Dht<T> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            local: self.local.clone(),
            config: self.config.clone(),
            transport: self.transport.clone(),
            counters: self.counters.clone(),
            run_state: self.run_state.clone(),
            message_tap: self.message_tap.clone(),
        }
    }
}

impl<T: Transport> Dht<T> {
    /// Create the engine and spawn its actor. Maintenance loops start
    /// with [`Dht::start`].
    ///
    /// # Errors
    /// Returns [`ConfigError`] for out-of-range configuration.
    pub fn new(
        config: DhtConfig,
        address: impl Into<String>,
        port: u16,
        transport: T,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let node_id = config.node_id.unwrap_or_else(NodeId::random);
        let local = Node::new(node_id, address, port);

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = DhtActor {
            cmd_rx,
            routing: RoutingTable::new(node_id, config.k),
            store: HashMap::new(),
            pending: HashMap::new(),
            latencies: VecDeque::with_capacity(LATENCY_WINDOW),
            local: local.clone(),
            config: config.clone(),
        };
        tokio::spawn(actor.run());

        Ok(Self {
            cmd_tx,
            local,
            config,
            transport: Arc::new(transport),
            counters: Arc::new(Counters::default()),
            run_state: Arc::new(Mutex::new(RunState {
                started: false,
                stopped: false,
                tasks: Vec::new(),
            })),
            message_tap: Arc::new(Mutex::new(None)),
        })
    }

    pub fn local_node(&self) -> Node {
        self.local.clone()
    }

    pub fn node_id(&self) -> NodeId {
        self.local.id
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    /// Start maintenance loops: bucket refresh, republish/expire, and
    /// the pending-request sweep. Idempotent.
    pub async fn start(&self) {
        let mut run = self.run_state.lock().await;
        if run.started || run.stopped {
            return;
        }
        run.started = true;

        run.tasks.push(self.spawn_bucket_refresh_loop());
        run.tasks.push(self.spawn_republish_loop());
        run.tasks.push(self.spawn_pending_sweep_loop());
        debug!(node = %self.local.id, "dht maintenance started");
    }

    /// Stop maintenance and the actor. Pending waiters complete with a
    /// cancellation. Idempotent; the engine does not restart.
    pub async fn stop(&self) {
        let mut run = self.run_state.lock().await;
        if run.stopped {
            return;
        }
        run.stopped = true;
        run.started = false;
        for task in run.tasks.drain(..) {
            task.abort();
        }
        drop(run);

        let _ = self.cmd_tx.send(Command::Quit).await;
        debug!(node = %self.local.id, "dht stopped");
    }

    /// Register an application tap for inbound messages. One tap at a
    /// time; re-registering replaces the previous one. This sits next
    /// to [`Dht::handle_message`], the protocol handler itself.
    pub async fn register_message_handler(&self, handler: mpsc::Sender<DhtMessage>) {
        *self.message_tap.lock().await = Some(handler);
    }

    /// Drive inbound messages from a transport mailbox into the
    /// engine. Returns the pump task handle.
    pub fn run_inbox(&self, mut inbox: mpsc::Receiver<DhtMessage>) -> JoinHandle<()> {
        let dht = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                if let Err(error) = dht.handle_message(message).await {
                    trace!(error = %error, "inbound message handling failed");
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Routing table views
    // ------------------------------------------------------------------

    pub async fn add_node(&self, node: Node) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::AddNode(node, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn remove_node(&self, id: &NodeId) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::RemoveNode(*id, tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn closest_nodes(&self, key: &NodeId, count: usize) -> Vec<Node> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Closest(*key, count, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Every contact currently known to routing.
    pub async fn discovered_nodes(&self) -> Vec<Node> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::AllNodes(tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn routing_table_size(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::TableSize(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Core operations
    // ------------------------------------------------------------------

    /// Store locally and replicate toward the k nodes closest to the
    /// key. True when the value landed anywhere (locally counts).
    pub async fn store(&self, key: Key, value: Vec<u8>) -> bool {
        if value.len() > MAX_VALUE_SIZE {
            warn!(size = value.len(), limit = MAX_VALUE_SIZE, "rejecting oversized value");
            return false;
        }
        self.counters.store_operations.fetch_add(1, Ordering::Relaxed);

        let stored_locally = {
            let (tx, rx) = oneshot::channel();
            self.cmd_tx
                .send(Command::StoreLocal(key, value.clone(), tx))
                .await
                .is_ok()
                && rx.await.unwrap_or(false)
        };

        let remote_acks = self.replicate(key, value).await;
        stored_locally || remote_acks > 0
    }

    /// Replicate a key/value toward its k closest nodes, with bounded
    /// retries per target. Returns the acknowledgement count.
    async fn replicate(&self, key: Key, value: Vec<u8>) -> usize {
        let target = NodeId::from_bytes(key);
        let lookup = self.find_node(target).await;

        let mut join_set = JoinSet::new();
        for node in lookup.nodes.into_iter().take(self.config.k) {
            let dht = self.clone();
            let value = value.clone();
            join_set.spawn(async move { dht.send_store_with_retries(&node, key, value).await });
        }

        let mut acks = 0;
        while let Some(joined) = join_set.join_next().await {
            if matches!(joined, Ok(true)) {
                acks += 1;
            }
        }
        acks
    }

    async fn send_store_with_retries(&self, node: &Node, key: Key, value: Vec<u8>) -> bool {
        for attempt in 0..self.config.max_retries.max(1) {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(100 << (attempt - 1))).await;
            }
            let message = DhtMessage::store(self.local.clone(), key, value.clone());
            if self.send_request(node, message).await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Look up a value. A local hit short-circuits; otherwise the
    /// iterative lookup runs until a responder returns the value or no
    /// round makes progress.
    pub async fn find_value(&self, key: Key) -> LookupResult {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);

        let local = {
            let (tx, rx) = oneshot::channel();
            if self.cmd_tx.send(Command::GetLocal(key, tx)).await.is_err() {
                None
            } else {
                rx.await.unwrap_or(None)
            }
        };
        if let Some(value) = local {
            self.counters.values_found.fetch_add(1, Ordering::Relaxed);
            return LookupResult { nodes: Vec::new(), value: Some(value), found: true };
        }

        let outcome = self.iterative_lookup(NodeId::from_bytes(key), Some(key)).await;
        let found = outcome.value.is_some();
        if found {
            self.counters.values_found.fetch_add(1, Ordering::Relaxed);
        }
        LookupResult { nodes: outcome.nodes, value: outcome.value, found }
    }

    /// Iterative lookup for the k contacts closest to `target`. Never
    /// terminates early on a value.
    pub async fn find_node(&self, target: NodeId) -> LookupResult {
        self.counters.lookups.fetch_add(1, Ordering::Relaxed);
        let outcome = self.iterative_lookup(target, None).await;
        LookupResult { nodes: outcome.nodes, value: None, found: false }
    }

    /// One-shot liveness probe. Success refreshes the contact's
    /// routing position; a timeout marks it not-alive (eligible for
    /// bucket replacement) without removing it.
    pub async fn ping(&self, node: &Node) -> bool {
        let message = DhtMessage::ping(self.local.clone(), node.id);
        self.send_request(node, message).await.is_ok()
    }

    /// Seed the routing table and look up the local id to populate the
    /// surrounding buckets.
    pub async fn bootstrap(&self, seeds: &[Node]) -> LookupResult {
        for seed in seeds {
            if seed.id == self.local.id {
                continue;
            }
            self.add_node(seed.clone()).await;
        }
        debug!(seeds = seeds.len(), node = %self.local.id, "bootstrapping");
        self.find_node(self.local.id).await
    }

    /// Issue a lookup for a synthetic id inside every bucket that has
    /// gone stale.
    pub async fn refresh_buckets(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::BucketsNeedingRefresh(self.config.bucket_refresh_interval, tx))
            .await
            .is_err()
        {
            return;
        }
        let due = rx.await.unwrap_or_default();
        if due.is_empty() {
            return;
        }
        debug!(count = due.len(), "refreshing stale buckets");
        for bucket_idx in due {
            let target = random_id_in_bucket(&self.local.id, bucket_idx);
            let _ = self.find_node(target).await;
        }
    }

    /// Send one message without expecting a response.
    pub async fn send_message(&self, node: &Node, message: DhtMessage) -> bool {
        match self.transport.send(node, message).await {
            Ok(()) => {
                self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(error) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                trace!(to = %node.id, error = %error, "send failed");
                false
            }
        }
    }

    pub async fn stats(&self) -> DhtStats {
        let (tx, rx) = oneshot::channel();
        let (routing_table_size, stored_keys, pending_requests, avg_request_latency_ms) =
            if self.cmd_tx.send(Command::Snapshot(tx)).await.is_ok() {
                rx.await.unwrap_or((0, 0, 0, 0.0))
            } else {
                (0, 0, 0, 0.0)
            };

        DhtStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_received: self.counters.messages_received.load(Ordering::Relaxed),
            requests_timed_out: self.counters.requests_timed_out.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            lookups: self.counters.lookups.load(Ordering::Relaxed),
            store_operations: self.counters.store_operations.load(Ordering::Relaxed),
            values_found: self.counters.values_found.load(Ordering::Relaxed),
            routing_table_size,
            stored_keys,
            pending_requests,
            avg_request_latency_ms,
        }
    }

    // ------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------

    /// The single inbound handler. The embedder's transport driver
    /// calls this (directly or through [`Dht::run_inbox`]) for every
    /// message addressed to this node.
    pub async fn handle_message(&self, message: DhtMessage) -> Result<()> {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);

        if let Some(tap) = self.message_tap.lock().await.clone() {
            // Lossy: a slow tap must not stall protocol handling.
            let _ = tap.try_send(message.clone());
        }

        if message.is_response {
            self.cmd_tx
                .send(Command::CompleteWaiter(Box::new(message)))
                .await
                .map_err(|_| anyhow!("dht actor closed"))?;
            return Ok(());
        }

        let source = message.source.clone();
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::HandleRequest(Box::new(message), tx))
            .await
            .map_err(|_| anyhow!("dht actor closed"))?;

        if let Ok(Some(reply)) = rx.await {
            if !self.send_message(&source, reply).await {
                return Err(anyhow!("failed to send response to {}", source.id));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Request plumbing
    // ------------------------------------------------------------------

    /// Send a request and await its correlated response, bounded by
    /// `ping_timeout`.
    async fn send_request(&self, to: &Node, message: DhtMessage) -> Result<DhtMessage> {
        let request_id = message.request_id;

        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::RegisterWaiter(request_id, tx))
            .await
            .map_err(|_| anyhow!("dht actor closed"))?;

        if let Err(error) = self.transport.send(to, message).await {
            self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
            let _ = self.cmd_tx.send(Command::DropWaiter(request_id)).await;
            return Err(error.context(format!("send to {} failed", to.id)));
        }
        self.counters.messages_sent.fetch_add(1, Ordering::Relaxed);

        match tokio::time::timeout(self.config.ping_timeout, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(failure))) => {
                if failure == RequestFailure::TimedOut {
                    self.counters.requests_timed_out.fetch_add(1, Ordering::Relaxed);
                    let _ = self.cmd_tx.send(Command::MarkAlive(to.id, false)).await;
                }
                Err(anyhow!("{failure}"))
            }
            Ok(Err(_)) => Err(anyhow!("{}", RequestFailure::Cancelled)),
            Err(_) => {
                self.counters.requests_timed_out.fetch_add(1, Ordering::Relaxed);
                let _ = self.cmd_tx.send(Command::DropWaiter(request_id)).await;
                let _ = self.cmd_tx.send(Command::MarkAlive(to.id, false)).await;
                Err(anyhow!("{}", RequestFailure::TimedOut))
            }
        }
    }

    async fn lookup_round_query(&self, node: Node, target: NodeId, key: Option<Key>) -> (Node, Result<DhtMessage>) {
        let message = match key {
            Some(key) => DhtMessage::find_value(self.local.clone(), key),
            None => DhtMessage::find_node(self.local.clone(), target),
        };
        let result = self.send_request(&node, message).await;
        (node, result)
    }

    /// The iterative α-parallel lookup shared by `find_node` and
    /// `find_value`.
    async fn iterative_lookup(&self, target: NodeId, key: Option<Key>) -> LookupOutcome {
        let k = self.config.k;
        let alpha = self.config.alpha;
        // Bound on shortlist growth between rounds.
        let shortlist_cap = k * alpha.max(1);

        let mut shortlist = self.closest_nodes(&target, alpha).await;
        let mut seen: HashSet<NodeId> = shortlist.iter().map(|n| n.id).collect();
        seen.insert(self.local.id);
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut value: Option<Vec<u8>> = None;

        for round in 0..MAX_LOOKUP_ROUNDS {
            let candidates: Vec<Node> = shortlist
                .iter()
                .filter(|n| !queried.contains(&n.id))
                .take(alpha)
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }
            for c in &candidates {
                queried.insert(c.id);
            }

            let mut join_set = JoinSet::new();
            for node in candidates {
                let dht = self.clone();
                join_set.spawn(async move { dht.lookup_round_query(node, target, key).await });
            }

            let mut progress = false;
            while let Some(joined) = join_set.join_next().await {
                let Ok((node, result)) = joined else { continue };
                match result {
                    Ok(response) => {
                        if response.value.is_some() {
                            value = response.value;
                        }
                        for found in response.nodes {
                            if found.id == self.local.id {
                                continue;
                            }
                            if seen.insert(found.id) {
                                // Discovered contacts also become
                                // routing candidates.
                                let _ = self.cmd_tx.send(Command::Observe(found.clone())).await;
                                shortlist.push(found);
                                progress = true;
                            }
                        }
                    }
                    Err(error) => {
                        // The failed arm stays queried; routing keeps
                        // the contact until bucket policy evicts it.
                        trace!(node = %node.id, round, error = %error, "lookup arm failed");
                    }
                }
            }

            shortlist.sort_by(|a, b| {
                let da = target.xor_distance(&a.id);
                let db = target.xor_distance(&b.id);
                distance_cmp(&da, &db).then_with(|| a.id.as_bytes().cmp(b.id.as_bytes()))
            });
            if shortlist.len() > shortlist_cap {
                shortlist.truncate(shortlist_cap);
            }

            if value.is_some() && key.is_some() {
                break;
            }
            if !progress {
                break;
            }
        }

        shortlist.sort_by(|a, b| {
            let da = target.xor_distance(&a.id);
            let db = target.xor_distance(&b.id);
            distance_cmp(&da, &db).then_with(|| a.id.as_bytes().cmp(b.id.as_bytes()))
        });
        shortlist.truncate(k);

        trace!(
            target = %target,
            found = shortlist.len(),
            queried = queried.len(),
            has_value = value.is_some(),
            "iterative lookup completed"
        );
        LookupOutcome { nodes: shortlist, value }
    }

    // ------------------------------------------------------------------
    // Maintenance loops
    // ------------------------------------------------------------------

    fn spawn_bucket_refresh_loop(&self) -> JoinHandle<()> {
        let dht = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(dht.config.bucket_refresh_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                dht.refresh_buckets().await;
            }
        })
    }

    fn spawn_republish_loop(&self) -> JoinHandle<()> {
        let dht = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(dht.config.republish_interval);
            interval.tick().await;
            loop {
                interval.tick().await;

                let (tx, rx) = oneshot::channel();
                if dht.cmd_tx.send(Command::Republishable(tx)).await.is_err() {
                    break;
                }
                let entries = rx.await.unwrap_or_default();
                if entries.is_empty() {
                    continue;
                }
                debug!(count = entries.len(), "republishing stored values");
                for (key, value) in entries {
                    // Replication only; the local timestamp keeps its
                    // original age so expiry still applies.
                    let _ = dht.replicate(key, value).await;
                }
            }
        })
    }

    fn spawn_pending_sweep_loop(&self) -> JoinHandle<()> {
        let dht = self.clone();
        tokio::spawn(async move {
            let period = (dht.config.ping_timeout / 2).max(Duration::from_millis(100));
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if dht
                    .cmd_tx
                    .send(Command::ExpirePending(dht.config.ping_timeout))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }
}

struct LookupOutcome {
    nodes: Vec<Node>,
    value: Option<Vec<u8>>,
}

impl DhtActor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::AddNode(node, reply) => {
                    let _ = reply.send(self.observe(node));
                }
                Command::Observe(node) => {
                    self.observe(node);
                }
                Command::RemoveNode(id, reply) => {
                    let _ = reply.send(self.routing.remove(&id));
                }
                Command::Closest(key, count, reply) => {
                    let _ = reply.send(self.routing.closest(&key, count));
                }
                Command::AllNodes(reply) => {
                    let _ = reply.send(self.routing.all_nodes());
                }
                Command::TableSize(reply) => {
                    let _ = reply.send(self.routing.len());
                }
                Command::MarkAlive(id, alive) => {
                    self.routing.mark_alive(&id, alive);
                }
                Command::BucketsNeedingRefresh(max_age, reply) => {
                    let _ = reply.send(self.routing.buckets_needing_refresh(max_age));
                }
                Command::StoreLocal(key, value, reply) => {
                    let _ = reply.send(self.store_local(key, value));
                }
                Command::GetLocal(key, reply) => {
                    let _ = reply.send(self.get_local(&key));
                }
                Command::Republishable(reply) => {
                    let _ = reply.send(self.collect_republishable());
                }
                Command::RegisterWaiter(request_id, waiter) => {
                    self.pending.insert(
                        request_id,
                        PendingRequest { waiter, registered_at: Instant::now() },
                    );
                }
                Command::DropWaiter(request_id) => {
                    self.pending.remove(&request_id);
                }
                Command::CompleteWaiter(message) => {
                    self.complete_waiter(*message);
                }
                Command::ExpirePending(max_age) => {
                    self.expire_pending(max_age);
                }
                Command::HandleRequest(message, reply) => {
                    let _ = reply.send(self.handle_request(*message));
                }
                Command::Snapshot(reply) => {
                    let avg = if self.latencies.is_empty() {
                        0.0
                    } else {
                        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
                    };
                    let _ = reply.send((
                        self.routing.len(),
                        self.store.len(),
                        self.pending.len(),
                        avg,
                    ));
                }
                Command::Quit => break,
            }
        }

        // Complete every parked waiter with a cancellation so no
        // caller hangs across shutdown.
        for (_, pending) in self.pending.drain() {
            let _ = pending.waiter.send(Err(RequestFailure::Cancelled));
        }
    }

    /// Feed an observed contact into routing.
    fn observe(&mut self, mut node: Node) -> bool {
        if node.id == self.local.id {
            return false;
        }
        node.alive = true;
        self.routing.add(node)
    }

    fn store_local(&mut self, key: Key, value: Vec<u8>) -> bool {
        if value.len() > MAX_VALUE_SIZE {
            return false;
        }
        self.store.insert(key, StoredValue { value, stored_at_ms: now_ms() });
        true
    }

    fn get_local(&mut self, key: &Key) -> Option<Vec<u8>> {
        let expire_ms = self.config.expire_interval.as_millis() as u64;
        let now = now_ms();
        match self.store.get(key) {
            Some(entry) if now.saturating_sub(entry.stored_at_ms) <= expire_ms => {
                Some(entry.value.clone())
            }
            Some(_) => {
                self.store.remove(key);
                None
            }
            None => None,
        }
    }

    fn collect_republishable(&mut self) -> Vec<(Key, Vec<u8>)> {
        let expire_ms = self.config.expire_interval.as_millis() as u64;
        let now = now_ms();

        let expired: Vec<Key> = self
            .store
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.stored_at_ms) > expire_ms)
            .map(|(key, _)| *key)
            .collect();
        if !expired.is_empty() {
            debug!(count = expired.len(), "dropping expired values");
        }
        for key in expired {
            self.store.remove(&key);
        }

        self.store
            .iter()
            .map(|(key, entry)| (*key, entry.value.clone()))
            .collect()
    }

    fn complete_waiter(&mut self, message: DhtMessage) {
        let request_id = message.request_id;
        // A duplicate or unsolicited response finds no entry; that is
        // a no-op, not an error.
        if let Some(pending) = self.pending.remove(&request_id) {
            let elapsed_ms = pending.registered_at.elapsed().as_secs_f64() * 1000.0;
            if self.latencies.len() == LATENCY_WINDOW {
                self.latencies.pop_front();
            }
            self.latencies.push_back(elapsed_ms);

            let source = message.source.clone();
            self.observe(source.clone());
            self.routing.update_last_seen(&source.id);

            let _ = pending.waiter.send(Ok(message));
        } else {
            trace!(request_id, "response without pending waiter");
        }
    }

    fn expire_pending(&mut self, max_age: Duration) {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.registered_at.elapsed() > max_age)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            if let Some(pending) = self.pending.remove(&request_id) {
                let _ = pending.waiter.send(Err(RequestFailure::TimedOut));
            }
        }
    }

    /// Serve an inbound request and produce the response message.
    fn handle_request(&mut self, message: DhtMessage) -> Option<DhtMessage> {
        // Every inbound message makes its source a routing candidate.
        self.observe(message.source.clone());

        let local = self.local.clone();
        let k = self.config.k;
        let response = match message.kind {
            MessageKind::Ping => message.response(local, Vec::new(), None),
            MessageKind::FindNode => {
                let mut closest = self.routing.closest(&message.target, k);
                closest.retain(|n| n.id != message.source.id);
                message.response(local, closest, None)
            }
            MessageKind::FindValue => {
                let key = message.key?;
                match self.get_local(&key) {
                    Some(value) => message.response(local, Vec::new(), Some(value)),
                    None => {
                        let mut closest = self.routing.closest(&message.target, k);
                        closest.retain(|n| n.id != message.source.id);
                        message.response(local, closest, None)
                    }
                }
            }
            MessageKind::Store => {
                let key = message.key?;
                let value = message.value.clone()?;
                let stored = self.store_local(key, value);
                if !stored {
                    trace!(source = %message.source.id, "store request refused");
                }
                message.response(local, Vec::new(), None)
            }
        };
        Some(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::key_for_bytes;
    use crate::transport::{InMemoryTransport, TransportHub};

    async fn dht_on_hub(hub: &TransportHub, port: u16, k: usize, alpha: usize) -> Dht<InMemoryTransport> {
        let endpoint = format!("127.0.0.1:{port}");
        let (transport, inbox) = hub.register(&endpoint).await;
        let config = DhtConfig { k, alpha, ping_timeout: Duration::from_millis(500), ..DhtConfig::default() };
        let dht = Dht::new(config, "127.0.0.1", port, transport).expect("config is valid");
        dht.run_inbox(inbox);
        dht
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        assert!(DhtConfig::default().validate().is_ok());
        assert!(DhtConfig { k: 0, ..DhtConfig::default() }.validate().is_err());
        assert!(DhtConfig { alpha: 0, ..DhtConfig::default() }.validate().is_err());
        assert!(DhtConfig { alpha: 21, k: 20, ..DhtConfig::default() }.validate().is_err());
        assert!(
            DhtConfig { ping_timeout: Duration::ZERO, ..DhtConfig::default() }
                .validate()
                .is_err()
        );
    }

    #[tokio::test]
    async fn local_store_and_find_value_short_circuits() {
        let hub = TransportHub::new();
        let dht = dht_on_hub(&hub, 4000, 4, 2).await;

        let key = key_for_bytes(b"status:alice");
        assert!(dht.store(key, b"online".to_vec()).await);

        let result = dht.find_value(key).await;
        assert!(result.found);
        assert_eq!(result.value.as_deref(), Some(b"online".as_slice()));
    }

    #[tokio::test]
    async fn find_value_misses_report_not_found() {
        let hub = TransportHub::new();
        let dht = dht_on_hub(&hub, 4001, 4, 2).await;

        let result = dht.find_value(key_for_bytes(b"missing")).await;
        assert!(!result.found);
        assert!(result.value.is_none());
    }

    #[tokio::test]
    async fn ping_round_trips_between_two_nodes() {
        let hub = TransportHub::new();
        let a = dht_on_hub(&hub, 4010, 4, 2).await;
        let b = dht_on_hub(&hub, 4011, 4, 2).await;

        assert!(a.ping(&b.local_node()).await);
        // The pinged node learned about the pinger.
        assert_eq!(b.routing_table_size().await, 1);
        // The pinger recorded the response source.
        assert_eq!(a.routing_table_size().await, 1);
    }

    #[tokio::test]
    async fn ping_times_out_for_unreachable_node() {
        let hub = TransportHub::new();
        let a = dht_on_hub(&hub, 4020, 4, 2).await;
        let b = dht_on_hub(&hub, 4021, 4, 2).await;

        a.add_node(b.local_node()).await;
        hub.set_unreachable(&b.local_node().endpoint(), true).await;

        assert!(!a.ping(&b.local_node()).await);
        // The contact is still in routing, only marked not-alive.
        assert_eq!(a.routing_table_size().await, 1);

        let stats = a.stats().await;
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn store_replicates_to_peers() {
        let hub = TransportHub::new();
        let a = dht_on_hub(&hub, 4030, 4, 2).await;
        let b = dht_on_hub(&hub, 4031, 4, 2).await;

        a.add_node(b.local_node()).await;

        let key = key_for_bytes(b"post:7");
        assert!(a.store(key, b"hello".to_vec()).await);

        // B can answer from its own store now.
        let at_b = b.find_value(key).await;
        assert!(at_b.found, "value should be replicated to b");
    }

    #[tokio::test]
    async fn find_node_learns_from_intermediate_hops() {
        let hub = TransportHub::new();
        let a = dht_on_hub(&hub, 4040, 8, 2).await;
        let b = dht_on_hub(&hub, 4041, 8, 2).await;
        let c = dht_on_hub(&hub, 4042, 8, 2).await;

        // A knows only B; B knows C.
        a.add_node(b.local_node()).await;
        b.add_node(c.local_node()).await;

        let result = a.find_node(c.node_id()).await;
        assert!(
            result.nodes.iter().any(|n| n.id == c.node_id()),
            "lookup should discover c through b"
        );
    }

    #[tokio::test]
    async fn oversized_values_are_refused() {
        let hub = TransportHub::new();
        let dht = dht_on_hub(&hub, 4050, 4, 2).await;

        let key = key_for_bytes(b"blob");
        let oversized = vec![0u8; MAX_VALUE_SIZE + 1];
        assert!(!dht.store(key, oversized).await);
        assert!(!dht.find_value(key).await.found);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_cancels_pending() {
        let hub = TransportHub::new();
        let dht = dht_on_hub(&hub, 4060, 4, 2).await;
        dht.start().await;
        dht.start().await;

        dht.stop().await;
        dht.stop().await;

        // Post-stop operations degrade gracefully.
        assert_eq!(dht.routing_table_size().await, 0);
        assert!(!dht.ping(&Node::new(NodeId::random(), "127.0.0.1", 9)).await);
    }

    #[tokio::test]
    async fn locally_stored_values_expire() {
        let hub = TransportHub::new();
        let endpoint = "127.0.0.1:4080";
        let (transport, inbox) = hub.register(endpoint).await;
        let config = DhtConfig {
            k: 4,
            alpha: 2,
            expire_interval: Duration::from_millis(30),
            ping_timeout: Duration::from_millis(500),
            ..DhtConfig::default()
        };
        let dht = Dht::new(config, "127.0.0.1", 4080, transport).expect("config is valid");
        dht.run_inbox(inbox);

        let key = key_for_bytes(b"ephemeral");
        assert!(dht.store(key, b"x".to_vec()).await);
        assert!(dht.find_value(key).await.found);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!dht.find_value(key).await.found, "expired value must not resolve");
    }

    #[tokio::test]
    async fn message_tap_observes_inbound_traffic() {
        let hub = TransportHub::new();
        let a = dht_on_hub(&hub, 4090, 4, 2).await;
        let b = dht_on_hub(&hub, 4091, 4, 2).await;

        let (tap_tx, mut tap_rx) = mpsc::channel(16);
        b.register_message_handler(tap_tx).await;

        a.ping(&b.local_node()).await;

        let observed = tap_rx.recv().await.expect("tap should see the ping");
        assert_eq!(observed.kind, MessageKind::Ping);
        assert_eq!(observed.source.id, a.node_id());
        assert!(!observed.is_response);
    }

    #[tokio::test]
    async fn stats_track_traffic() {
        let hub = TransportHub::new();
        let a = dht_on_hub(&hub, 4070, 4, 2).await;
        let b = dht_on_hub(&hub, 4071, 4, 2).await;

        a.ping(&b.local_node()).await;
        let stats = a.stats().await;
        assert!(stats.messages_sent >= 1);
        assert!(stats.messages_received >= 1);
        assert!(stats.avg_request_latency_ms >= 0.0);
    }
}
