//! Typed event bus for peer and network lifecycle events.
//!
//! Components emit [`Event`]s; the bus assigns monotonic ids, records
//! them to a bounded history, publishes them on a broadcast stream,
//! and dispatches them to registered handlers in descending priority
//! order. Handlers register with an optional filter and a dispatch
//! mode: `Sync` handlers are awaited inline (ordering preserved, one
//! event fully dispatched before the next), `Async` handlers run
//! detached.
//!
//! A handler that fails or panics stays registered; the failure is
//! re-reported as a low-severity [`EventPayload::DiscoveryError`].
//! Late subscribers can pull [`EventBus::history`] or ask for a
//! [`EventBus::replay`] of past events into their callback.
//!
//! Shutdown is cooperative and idempotent: queued events drain,
//! in-flight handlers finish, and later emissions are rejected.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

use std::sync::Mutex as StdMutex;

use crate::peer::{now_ms, Peer};

/// Bounded event history; oldest entries are discarded beyond this.
const HISTORY_CAP: usize = 1000;

/// Replay window of the live broadcast stream: a lagging subscriber
/// misses events older than this many.
const BROADCAST_CAPACITY: usize = 100;

/// Window size for callback latency statistics.
const CALLBACK_LATENCY_WINDOW: usize = 100;

/// Severity attached to reported discovery errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

/// Variant-specific payload of an event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventPayload {
    PeerDiscovered { peer: Peer },
    PeerLost { peer_id: String },
    PeerConnected { peer_id: String },
    PeerDisconnected { peer_id: String },
    PeerStatusChanged { peer_id: String, connected: bool },
    DiscoveryStarted,
    DiscoveryStopped,
    DiscoveryError { message: String, severity: ErrorSeverity, recoverable: bool },
    NetworkPartition { lost_peers: usize },
    NetworkMerge { gained_peers: usize },
    DhtOperation { operation: String, key: Option<String>, success: bool, duration_ms: u64 },
}

/// Runtime type tag of an event variant, used for typed subscriptions
/// and history filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    PeerDiscovered,
    PeerLost,
    PeerConnected,
    PeerDisconnected,
    PeerStatusChanged,
    DiscoveryStarted,
    DiscoveryStopped,
    DiscoveryError,
    NetworkPartition,
    NetworkMerge,
    DhtOperation,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::PeerDiscovered { .. } => EventKind::PeerDiscovered,
            EventPayload::PeerLost { .. } => EventKind::PeerLost,
            EventPayload::PeerConnected { .. } => EventKind::PeerConnected,
            EventPayload::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            EventPayload::PeerStatusChanged { .. } => EventKind::PeerStatusChanged,
            EventPayload::DiscoveryStarted => EventKind::DiscoveryStarted,
            EventPayload::DiscoveryStopped => EventKind::DiscoveryStopped,
            EventPayload::DiscoveryError { .. } => EventKind::DiscoveryError,
            EventPayload::NetworkPartition { .. } => EventKind::NetworkPartition,
            EventPayload::NetworkMerge { .. } => EventKind::NetworkMerge,
            EventPayload::DhtOperation { .. } => EventKind::DhtOperation,
        }
    }
}

/// One emitted event: monotonic id, wall-clock timestamp, payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub event_id: u64,
    pub timestamp_ms: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {:?}", self.event_id, self.kind())
    }
}

/// How a handler is driven for each matching event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// Awaited inline by the dispatcher; delivery order is preserved.
    Sync,
    /// Launched in a detached task; no ordering across events.
    Async,
}

/// A subscriber callback.
///
/// Closures `Fn(Event) -> anyhow::Result<()>` implement this
/// directly; implement the trait for handlers that need to await.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> Result<()>;
}

#[async_trait]
impl<F> EventHandler for F
where
    F: Fn(Event) -> Result<()> + Send + Sync + 'static,
{
    async fn handle(&self, event: Event) -> Result<()> {
        (self)(event)
    }
}

type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Clone)]
struct Registration {
    id: u64,
    priority: i32,
    seq: u64,
    mode: DispatchMode,
    filter: Option<EventFilter>,
    handler: Arc<dyn EventHandler>,
}

enum QueueItem {
    Deliver(Event),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct BusInner {
    next_event_id: u64,
    next_seq: u64,
    /// Kept sorted: descending priority, stable by registration order.
    callbacks: Vec<Registration>,
    history: VecDeque<Event>,
    shutdown: bool,
    events_emitted: u64,
    callbacks_executed: u64,
    callback_failures: u64,
    callback_latencies: VecDeque<f64>,
}

/// Point-in-time bus statistics.
#[derive(Clone, Debug, Default)]
pub struct EventBusStats {
    pub events_emitted: u64,
    pub callbacks_executed: u64,
    pub callback_failures: u64,
    pub active_callbacks: usize,
    pub history_size: usize,
    pub avg_callback_latency_ms: f64,
}

/// The event bus. Cloning shares all state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    queue_tx: mpsc::UnboundedSender<QueueItem>,
    broadcast_tx: broadcast::Sender<Event>,
    next_callback_id: Arc<AtomicU64>,
    dispatcher: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);

        let bus = Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_event_id: 1,
                next_seq: 0,
                callbacks: Vec::new(),
                history: VecDeque::with_capacity(HISTORY_CAP),
                shutdown: false,
                events_emitted: 0,
                callbacks_executed: 0,
                callback_failures: 0,
                callback_latencies: VecDeque::with_capacity(CALLBACK_LATENCY_WINDOW),
            })),
            queue_tx,
            broadcast_tx,
            next_callback_id: Arc::new(AtomicU64::new(1)),
            dispatcher: Arc::new(StdMutex::new(None)),
        };

        let dispatcher = tokio::spawn(dispatch_loop(bus.clone(), queue_rx));
        *bus.dispatcher.lock().expect("dispatcher slot poisoned") = Some(dispatcher);

        bus
    }

    /// Emit an event. Returns its assigned id.
    ///
    /// # Errors
    /// Rejected after [`EventBus::shutdown`].
    pub async fn emit(&self, payload: EventPayload) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if inner.shutdown {
            return Err(anyhow!("event bus is shut down"));
        }

        let event_id = inner.next_event_id;
        inner.next_event_id += 1;
        let event = Event { event_id, timestamp_ms: now_ms(), payload };

        if inner.history.len() == HISTORY_CAP {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());
        inner.events_emitted += 1;

        // Both sends happen under the lock so queue order, stream
        // order, and event ids all agree.
        let _ = self.broadcast_tx.send(event.clone());
        let _ = self.queue_tx.send(QueueItem::Deliver(event));

        Ok(event_id)
    }

    /// Register a handler. Higher priority runs earlier per event;
    /// the filter, when present, must accept an event for the handler
    /// to see it.
    pub async fn register_handler(
        &self,
        handler: impl EventHandler,
        priority: i32,
        filter: Option<Box<dyn Fn(&Event) -> bool + Send + Sync>>,
        mode: DispatchMode,
    ) -> u64 {
        let id = self.next_callback_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.callbacks.push(Registration {
            id,
            priority,
            seq,
            mode,
            filter: filter.map(|f| -> EventFilter { Arc::from(f) }),
            handler: Arc::new(handler),
        });
        inner
            .callbacks
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        id
    }

    /// Register a handler that only sees events of one variant.
    pub async fn register_typed(
        &self,
        kind: EventKind,
        handler: impl EventHandler,
        priority: i32,
        mode: DispatchMode,
    ) -> u64 {
        self.register_handler(
            handler,
            priority,
            Some(Box::new(move |event: &Event| event.kind() == kind)),
            mode,
        )
        .await
    }

    pub async fn unregister(&self, callback_id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        let before = inner.callbacks.len();
        inner.callbacks.retain(|r| r.id != callback_id);
        inner.callbacks.len() != before
    }

    /// Subscribe to the live stream. The receiver sees every event
    /// from subscription on, in emission order; a subscriber lagging
    /// past the replay window observes a gap, never a reorder.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.broadcast_tx.subscribe()
    }

    /// Query recorded history, oldest first. `limit` keeps the most
    /// recent matches.
    pub async fn history(
        &self,
        kind: Option<EventKind>,
        since_ms: Option<u64>,
        limit: Option<usize>,
    ) -> Vec<Event> {
        let inner = self.inner.lock().await;
        let mut matches: Vec<Event> = inner
            .history
            .iter()
            .filter(|e| kind.is_none_or(|k| e.kind() == k))
            .filter(|e| since_ms.is_none_or(|since| e.timestamp_ms >= since))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            if matches.len() > limit {
                matches.drain(..matches.len() - limit);
            }
        }
        matches
    }

    /// Re-deliver matching history to one registered callback, in
    /// original order, before this call returns.
    pub async fn replay(
        &self,
        callback_id: u64,
        kind: Option<EventKind>,
        since_ms: Option<u64>,
    ) -> Result<usize> {
        let (registration, events) = {
            let inner = self.inner.lock().await;
            let registration = inner
                .callbacks
                .iter()
                .find(|r| r.id == callback_id)
                .cloned()
                .ok_or_else(|| anyhow!("unknown callback {callback_id}"))?;
            let events: Vec<Event> = inner
                .history
                .iter()
                .filter(|e| kind.is_none_or(|k| e.kind() == k))
                .filter(|e| since_ms.is_none_or(|since| e.timestamp_ms >= since))
                .filter(|e| registration.filter.as_ref().is_none_or(|f| f(e)))
                .cloned()
                .collect();
            (registration, events)
        };

        let count = events.len();
        for event in events {
            if let Err(error) = registration.handler.handle(event).await {
                trace!(callback = callback_id, error = %error, "replay handler failed");
            }
        }
        Ok(count)
    }

    pub async fn stats(&self) -> EventBusStats {
        let inner = self.inner.lock().await;
        let avg = if inner.callback_latencies.is_empty() {
            0.0
        } else {
            inner.callback_latencies.iter().sum::<f64>() / inner.callback_latencies.len() as f64
        };
        EventBusStats {
            events_emitted: inner.events_emitted,
            callbacks_executed: inner.callbacks_executed,
            callback_failures: inner.callback_failures,
            active_callbacks: inner.callbacks.len(),
            history_size: inner.history.len(),
            avg_callback_latency_ms: avg,
        }
    }

    pub async fn clear_history(&self) {
        self.inner.lock().await.history.clear();
    }

    /// Wait until every event emitted so far has been dispatched.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.queue_tx.send(QueueItem::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Drain the queue, let in-flight handlers finish, and reject
    /// further emissions. Idempotent.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.shutdown {
                return;
            }
            inner.shutdown = true;
        }
        let _ = self.queue_tx.send(QueueItem::Shutdown);
        let handle = self.dispatcher.lock().expect("dispatcher slot poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn dispatch_loop(bus: EventBus, mut queue_rx: mpsc::UnboundedReceiver<QueueItem>) {
    while let Some(item) = queue_rx.recv().await {
        let event = match item {
            QueueItem::Deliver(event) => event,
            QueueItem::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            QueueItem::Shutdown => break,
        };

        let callbacks: Vec<Registration> = bus.inner.lock().await.callbacks.clone();

        for registration in callbacks {
            if let Some(filter) = &registration.filter {
                if !filter(&event) {
                    continue;
                }
            }

            match registration.mode {
                DispatchMode::Sync => {
                    let handler = registration.handler.clone();
                    let event_for_handler = event.clone();
                    let started = Instant::now();
                    // Run inside a task so a panicking handler is
                    // contained as a join error.
                    let joined =
                        tokio::spawn(async move { handler.handle(event_for_handler).await }).await;
                    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

                    let failure = match joined {
                        Ok(Ok(())) => None,
                        Ok(Err(error)) => Some(error.to_string()),
                        Err(join_error) => Some(format!("handler panicked: {join_error}")),
                    };
                    record_execution(&bus, Some(elapsed_ms), failure.is_some()).await;
                    if let Some(message) = failure {
                        report_callback_failure(&bus, registration.id, &event, message).await;
                    }
                }
                DispatchMode::Async => {
                    let handler = registration.handler.clone();
                    let event_for_handler = event.clone();
                    let bus_for_task = bus.clone();
                    let callback_id = registration.id;
                    record_execution(&bus, None, false).await;
                    tokio::spawn(async move {
                        if let Err(error) = handler.handle(event_for_handler.clone()).await {
                            {
                                let mut inner = bus_for_task.inner.lock().await;
                                inner.callback_failures += 1;
                            }
                            report_callback_failure(
                                &bus_for_task,
                                callback_id,
                                &event_for_handler,
                                error.to_string(),
                            )
                            .await;
                        }
                    });
                }
            }
        }
    }
}

async fn record_execution(bus: &EventBus, elapsed_ms: Option<f64>, failed: bool) {
    let mut inner = bus.inner.lock().await;
    inner.callbacks_executed += 1;
    if failed {
        inner.callback_failures += 1;
    }
    // Detached handlers are not timed; only inline runs feed the
    // latency window.
    if let Some(elapsed_ms) = elapsed_ms {
        if inner.callback_latencies.len() == CALLBACK_LATENCY_WINDOW {
            inner.callback_latencies.pop_front();
        }
        inner.callback_latencies.push_back(elapsed_ms);
    }
}

async fn report_callback_failure(bus: &EventBus, callback_id: u64, event: &Event, message: String) {
    warn!(callback = callback_id, event = %event, error = %message, "event handler failed");
    // A failure while handling a DiscoveryError is only logged;
    // re-reporting it would feed the failing handler forever.
    if event.kind() == EventKind::DiscoveryError {
        return;
    }
    let _ = bus
        .emit(EventPayload::DiscoveryError {
            message: format!("callback {callback_id} failed on {event}: {message}"),
            severity: ErrorSeverity::Low,
            recoverable: true,
        })
        .await;
}
