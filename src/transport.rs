//! The transport boundary.
//!
//! The DHT engine does not own sockets. It hands outbound
//! [`DhtMessage`]s to a caller-supplied [`Transport`] and expects the
//! embedder to feed inbound messages to [`crate::dht::Dht::handle_message`],
//! the single inbound handler the engine registers. The transport owes
//! nothing beyond best-effort delivery: datagrams may be dropped,
//! duplicated, or reordered.
//!
//! [`TransportHub`] is an in-process implementation used by the demo
//! binary and the integration suites: every registered endpoint gets a
//! mailbox, and sends route between them with injectable latency and
//! unreachability.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::messages::DhtMessage;
use crate::peer::Node;

/// Mailbox depth per registered endpoint.
const ENDPOINT_MAILBOX_CAPACITY: usize = 256;

/// Delivers a message to a remote contact.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one message toward `to`. An error means this send failed;
    /// it says nothing about the peer's long-term reachability.
    async fn send(&self, to: &Node, message: DhtMessage) -> Result<()>;
}

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<String, mpsc::Sender<DhtMessage>>,
    unreachable: HashSet<String>,
    latency: HashMap<String, Duration>,
}

/// An in-process message switch connecting [`InMemoryTransport`]s.
///
/// Cloning shares the hub; all clones route over the same endpoints.
#[derive(Clone, Default)]
pub struct TransportHub {
    inner: Arc<Mutex<HubInner>>,
}

impl TransportHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint (an `address:port` string) and return the
    /// transport to send from plus the mailbox of inbound messages.
    ///
    /// Re-registering an endpoint replaces its mailbox.
    pub async fn register(&self, endpoint: &str) -> (InMemoryTransport, mpsc::Receiver<DhtMessage>) {
        let (tx, rx) = mpsc::channel(ENDPOINT_MAILBOX_CAPACITY);
        self.inner.lock().await.endpoints.insert(endpoint.to_string(), tx);
        (InMemoryTransport { inner: self.inner.clone() }, rx)
    }

    pub async fn unregister(&self, endpoint: &str) {
        let mut inner = self.inner.lock().await;
        inner.endpoints.remove(endpoint);
        inner.unreachable.remove(endpoint);
        inner.latency.remove(endpoint);
    }

    /// Make sends toward `endpoint` fail (or succeed again).
    pub async fn set_unreachable(&self, endpoint: &str, unreachable: bool) {
        let mut inner = self.inner.lock().await;
        if unreachable {
            inner.unreachable.insert(endpoint.to_string());
        } else {
            inner.unreachable.remove(endpoint);
        }
    }

    /// Delay delivery toward `endpoint` by `latency`.
    pub async fn set_latency(&self, endpoint: &str, latency: Duration) {
        self.inner.lock().await.latency.insert(endpoint.to_string(), latency);
    }
}

/// A [`Transport`] backed by a [`TransportHub`].
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Mutex<HubInner>>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, to: &Node, message: DhtMessage) -> Result<()> {
        let endpoint = to.endpoint();
        let (tx, delay) = {
            let inner = self.inner.lock().await;
            if inner.unreachable.contains(&endpoint) {
                bail!("endpoint {endpoint} unreachable");
            }
            let tx = inner
                .endpoints
                .get(&endpoint)
                .cloned()
                .with_context(|| format!("no route to {endpoint}"))?;
            (tx, inner.latency.get(&endpoint).copied())
        };

        trace!(
            to = %endpoint,
            kind = ?message.kind,
            request_id = message.request_id,
            is_response = message.is_response,
            "hub send"
        );

        match delay {
            // Delayed messages are handed off so the sender is not
            // held up; the hub models the wire, not a queue.
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(message).await;
                });
                Ok(())
            }
            None => tx
                .send(message)
                .await
                .map_err(|_| anyhow::anyhow!("endpoint {endpoint} mailbox closed")),
        }
    }
}
