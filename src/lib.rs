//! # Lattica - Peer-Discovery Core for Decentralized Overlays
//!
//! Lattica is the peer-discovery engine of a decentralized social
//! platform: it finds peers, remembers them, scores them, and tells
//! the application what changed. It is built from four subsystems:
//!
//! - **DHT**: Kademlia-style routing and storage over a 160-bit XOR
//!   keyspace with iterative α-parallel lookups
//! - **Discovery**: bootstrap, periodic lookups, lifecycle rules, and
//!   peer-list merging for the embedding application
//! - **Cache**: a two-tier (hot/cold) peer cache with pluggable
//!   eviction, reputation tracking, and connection history
//! - **Events**: a typed, priority-aware event bus with bounded
//!   history and replay
//!
//! ## Architecture
//!
//! The crate uses the **Actor Pattern** for concurrent state: the DHT
//! engine has a public cloneable handle and a private actor that owns
//! all mutable state and processes commands sequentially off an async
//! channel. Caches and the event bus serialize shared state behind
//! async mutexes; observables are exposed as a current value plus a
//! change stream.
//!
//! The network itself stays outside: the engine hands outbound
//! messages to a caller-supplied [`Transport`] and receives inbound
//! messages through a single registered handler. An in-process
//! [`TransportHub`] ships with the crate for demos and tests.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `node_id` | 160-bit identifiers, XOR metric, bucket math |
//! | `peer` | DHT-level and application-level peer records |
//! | `messages` | Wire messages with bounded deserialization |
//! | `transport` | Transport trait and the in-memory hub |
//! | `routing` | 160 k-buckets with liveness-aware replacement |
//! | `dht` | Lookup engine, local store, maintenance loops |
//! | `cache` | Two-tier peer cache, eviction, reputation |
//! | `events` | Typed event bus with history and replay |
//! | `discovery` | Orchestrator tying the subsystems together |

use std::fmt;

pub mod cache;
pub mod dht;
pub mod discovery;
pub mod events;
pub mod messages;
pub mod node_id;
pub mod peer;
pub mod routing;
pub mod transport;

pub use cache::{CacheConfig, CacheStats, CachedPeer, ConnectionAttempt, EvictionPolicy, PeerCache, PeerPriority};
pub use dht::{Dht, DhtConfig, DhtStats, LookupResult};
pub use discovery::{Discovery, DiscoveryConfig, DiscoveryStats, NetworkStatus};
pub use events::{
    DispatchMode, ErrorSeverity, Event, EventBus, EventBusStats, EventHandler, EventKind,
    EventPayload,
};
pub use messages::{DhtMessage, MessageKind};
pub use node_id::{Key, NodeId};
pub use peer::{Node, Peer};
pub use transport::{InMemoryTransport, Transport, TransportHub};

/// A configuration value was outside its documented range. Reported
/// synchronously; the affected component refuses to start.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}
