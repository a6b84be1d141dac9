//! Peer records: the DHT-level and application-level views.
//!
//! The DHT tracks [`Node`]s (raw overlay contacts keyed by
//! [`NodeId`]); the application works with [`Peer`]s, which carry the
//! hex-rendered peer id instead. The two views convert losslessly
//! through the id mapping in [`crate::node_id`].

use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::node_id::NodeId;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A contact as the DHT sees it.
///
/// Identity is the node id alone: two `Node`s with the same id are the
/// same contact even when their endpoint or liveness differ.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub port: u16,
    pub last_seen_ms: u64,
    pub alive: bool,
}

impl Node {
    pub fn new(id: NodeId, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
            last_seen_ms: now_ms(),
            alive: true,
        }
    }

    /// Refresh the last-seen timestamp to now.
    pub fn touch(&mut self) {
        self.last_seen_ms = now_ms();
    }

    /// `address:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A peer as the application sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub peer_id: String,
    pub address: String,
    pub port: u16,
    pub connected: bool,
    pub last_seen_ms: u64,
}

impl Peer {
    pub fn new(peer_id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            peer_id: peer_id.into(),
            address: address.into(),
            port,
            connected: false,
            last_seen_ms: now_ms(),
        }
    }

    /// Project a DHT contact into the application view.
    pub fn from_node(node: &Node) -> Self {
        Self {
            peer_id: node.id.to_hex(),
            address: node.address.clone(),
            port: node.port,
            connected: false,
            last_seen_ms: node.last_seen_ms,
        }
    }

    /// Map back into the DHT view. Fails when the peer id is not a
    /// well-formed hex rendering of a node id.
    pub fn to_node(&self) -> Option<Node> {
        let id = NodeId::from_hex(&self.peer_id).ok()?;
        Some(Node {
            id,
            address: self.address.clone(),
            port: self.port,
            last_seen_ms: self.last_seen_ms,
            alive: true,
        })
    }

    /// The node id behind this peer, when the id is well formed.
    pub fn node_id(&self) -> Option<NodeId> {
        NodeId::from_hex(&self.peer_id).ok()
    }

    pub fn touch(&mut self) {
        self.last_seen_ms = now_ms();
    }
}
