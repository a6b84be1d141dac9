//! Wire messages for the DHT protocol.
//!
//! A single [`DhtMessage`] shape carries every operation; requests and
//! responses are distinguished by `is_response` and correlated by
//! `request_id`. Messages are serialized with bincode under explicit
//! size limits so a peer cannot feed the decoder an unbounded payload.
//!
//! | Operation | Request carries | Response carries |
//! |-----------|-----------------|------------------|
//! | `Ping` | source | source |
//! | `FindNode` | target | up to k closest nodes |
//! | `FindValue` | key | value, or closest nodes |
//! | `Store` | key + value | acknowledgement |
//!
//! The transport owes no ordering or dedup guarantees; responses are
//! idempotent in effect and duplicates collapse onto an already
//! completed waiter.

use std::sync::atomic::{AtomicU64, Ordering};

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::node_id::{Key, NodeId};
use crate::peer::Node;

/// Maximum size of a stored value (1 MiB). Larger payloads belong in
/// the application's content store, not the discovery DHT.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization, slightly above
/// [`MAX_VALUE_SIZE`] to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_VALUE_SIZE as u64) + 4096;

/// Process-wide request id source. Monotonic within a process, which
/// is all correlation requires.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced. Always use this instead of
/// raw `bincode::deserialize` for data that crossed the transport.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_message(message: &DhtMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

pub fn deserialize_message(bytes: &[u8]) -> Result<DhtMessage, bincode::Error> {
    deserialize_bounded(bytes)
}

/// The four DHT operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Ping,
    FindNode,
    FindValue,
    Store,
}

/// One DHT protocol message, request or response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DhtMessage {
    pub kind: MessageKind,
    pub request_id: u64,
    /// The sender's contact record; receivers feed it to routing.
    pub source: Node,
    /// The routing target of the operation. Responses echo the
    /// request's target; delivery is by transport plus `request_id`.
    pub target: NodeId,
    pub key: Option<Key>,
    pub value: Option<Vec<u8>>,
    pub nodes: Vec<Node>,
    pub is_response: bool,
}

impl DhtMessage {
    pub fn ping(source: Node, target: NodeId) -> Self {
        Self {
            kind: MessageKind::Ping,
            request_id: next_request_id(),
            source,
            target,
            key: None,
            value: None,
            nodes: Vec::new(),
            is_response: false,
        }
    }

    pub fn find_node(source: Node, target: NodeId) -> Self {
        Self {
            kind: MessageKind::FindNode,
            request_id: next_request_id(),
            source,
            target,
            key: None,
            value: None,
            nodes: Vec::new(),
            is_response: false,
        }
    }

    pub fn find_value(source: Node, key: Key) -> Self {
        Self {
            kind: MessageKind::FindValue,
            request_id: next_request_id(),
            source,
            target: NodeId::from_bytes(key),
            key: Some(key),
            value: None,
            nodes: Vec::new(),
            is_response: false,
        }
    }

    pub fn store(source: Node, key: Key, value: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Store,
            request_id: next_request_id(),
            source,
            target: NodeId::from_bytes(key),
            key: Some(key),
            value: Some(value),
            nodes: Vec::new(),
            is_response: false,
        }
    }

    /// Build the response to this request from the responder's view.
    ///
    /// `nodes` and `value` carry the operation result; the request id
    /// and target are echoed for correlation.
    pub fn response(&self, source: Node, nodes: Vec<Node>, value: Option<Vec<u8>>) -> Self {
        Self {
            kind: self.kind,
            request_id: self.request_id,
            source,
            target: self.target,
            key: self.key,
            value,
            nodes,
            is_response: true,
        }
    }
}
