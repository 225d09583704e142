use crate::error::FleetError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::messages::FleetMessage;
use shared::types::NodeId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Message plumbing between fleet members. Send failures surface to the
/// caller; what they mean for liveness is the health monitor's business,
/// not the transport's.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, to: &NodeId, message: FleetMessage) -> Result<(), FleetError>;

    /// Fire-and-forget delivery to every configured peer. Per-peer
    /// failures are logged and absorbed; periodic traffic tolerates loss.
    async fn broadcast(&self, message: FleetMessage) -> Result<(), FleetError>;

    async fn receive(&self) -> Result<(NodeId, FleetMessage), FleetError>;
}

/// Wire frame for `/internal/messages`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: FleetMessage,
}

/// Production transport: JSON envelopes over HTTP, one POST per message.
/// Inbound messages arrive through the API server, which feeds the
/// channel handed out by [`HttpTransport::new`].
pub struct HttpTransport {
    me: NodeId,
    peers: HashMap<NodeId, String>,
    client: reqwest::Client,
    inbox: Mutex<mpsc::Receiver<(NodeId, FleetMessage)>>,
}

impl HttpTransport {
    pub fn new(
        me: NodeId,
        peers: HashMap<NodeId, String>,
        timeout: Duration,
    ) -> (Self, mpsc::Sender<(NodeId, FleetMessage)>) {
        let (tx, rx) = mpsc::channel(256);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        (
            Self {
                me,
                peers,
                client,
                inbox: Mutex::new(rx),
            },
            tx,
        )
    }

    async fn post(
        client: reqwest::Client,
        url: String,
        envelope: Envelope,
    ) -> Result<(), FleetError> {
        let response = client
            .post(format!("{url}/internal/messages"))
            .json(&envelope)
            .send()
            .await
            .map_err(|e| FleetError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FleetError::Transport(format!(
                "peer answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, to: &NodeId, message: FleetMessage) -> Result<(), FleetError> {
        let url = self
            .peers
            .get(to)
            .cloned()
            .ok_or_else(|| FleetError::UnknownPeer(to.clone()))?;
        let envelope = Envelope {
            from: self.me.clone(),
            message,
        };
        Self::post(self.client.clone(), url, envelope)
            .await
            .map_err(|_| FleetError::NodeUnavailable(to.clone()))
    }

    async fn broadcast(&self, message: FleetMessage) -> Result<(), FleetError> {
        for (peer, url) in &self.peers {
            let envelope = Envelope {
                from: self.me.clone(),
                message: message.clone(),
            };
            let client = self.client.clone();
            let peer = peer.clone();
            let url = url.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::post(client, url, envelope).await {
                    debug!(peer = %peer, error = %e, "broadcast delivery failed");
                }
            });
        }
        Ok(())
    }

    async fn receive(&self) -> Result<(NodeId, FleetMessage), FleetError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(FleetError::ChannelClosed)
    }
}

type Mailbox = mpsc::UnboundedSender<(NodeId, FleetMessage)>;

/// Loopback fabric for tests and demos. Every transport created through
/// [`InMemoryHub::join`] can reach every other; dropping a node from the
/// hub silences it both ways, which is how tests fake a crash.
pub struct InMemoryHub {
    nodes: Mutex<HashMap<NodeId, Mailbox>>,
}

impl InMemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// Registers `id` and returns its transport. Joining an id that is
    /// already present replaces its mailbox, matching a process restart.
    pub async fn join(self: &Arc<Self>, id: impl Into<NodeId>) -> InMemoryTransport {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.lock().await.insert(id.clone(), tx);
        InMemoryTransport {
            me: id,
            hub: Arc::clone(self),
            inbox: Mutex::new(rx),
        }
    }

    pub async fn drop_node(&self, id: &NodeId) {
        self.nodes.lock().await.remove(id);
    }
}

pub struct InMemoryTransport {
    me: NodeId,
    hub: Arc<InMemoryHub>,
    inbox: Mutex<mpsc::UnboundedReceiver<(NodeId, FleetMessage)>>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, to: &NodeId, message: FleetMessage) -> Result<(), FleetError> {
        let nodes = self.hub.nodes.lock().await;
        let mailbox = nodes
            .get(to)
            .ok_or_else(|| FleetError::NodeUnavailable(to.clone()))?;
        mailbox
            .send((self.me.clone(), message))
            .map_err(|_| FleetError::NodeUnavailable(to.clone()))
    }

    async fn broadcast(&self, message: FleetMessage) -> Result<(), FleetError> {
        let nodes = self.hub.nodes.lock().await;
        for (id, mailbox) in nodes.iter() {
            if id == &self.me {
                continue;
            }
            if mailbox.send((self.me.clone(), message.clone())).is_err() {
                debug!(peer = %id, "broadcast delivery failed");
            }
        }
        Ok(())
    }

    async fn receive(&self) -> Result<(NodeId, FleetMessage), FleetError> {
        self.inbox
            .lock()
            .await
            .recv()
            .await
            .ok_or(FleetError::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::messages::Heartbeat;
    use shared::types::{LoadEstimate, Role};

    fn beacon(sender: &str, seq: u64) -> FleetMessage {
        FleetMessage::Heartbeat(Heartbeat {
            sender: sender.into(),
            role: Role::Worker,
            load: LoadEstimate::Unknown,
            seq,
        })
    }

    #[tokio::test]
    async fn delivers_point_to_point() {
        let hub = InMemoryHub::new();
        let a = hub.join("a").await;
        let b = hub.join("b").await;

        a.send(&"b".into(), beacon("a", 1)).await.unwrap();
        let (from, msg) = b.receive().await.unwrap();
        assert_eq!(from, "a");
        assert_eq!(msg.kind(), "heartbeat");
    }

    #[tokio::test]
    async fn broadcast_skips_the_sender() {
        let hub = InMemoryHub::new();
        let a = hub.join("a").await;
        let b = hub.join("b").await;
        let c = hub.join("c").await;

        a.broadcast(beacon("a", 1)).await.unwrap();
        assert!(b.receive().await.is_ok());
        assert!(c.receive().await.is_ok());

        // Nothing came back to the sender.
        b.send(&"a".into(), beacon("b", 1)).await.unwrap();
        let (from, _) = a.receive().await.unwrap();
        assert_eq!(from, "b");
    }

    #[tokio::test]
    async fn dropped_node_is_unreachable() {
        let hub = InMemoryHub::new();
        let a = hub.join("a").await;
        let _b = hub.join("b").await;

        hub.drop_node(&"b".into()).await;
        let err = a.send(&"b".into(), beacon("a", 1)).await.unwrap_err();
        assert!(matches!(err, FleetError::NodeUnavailable(_)));
    }

    #[tokio::test]
    async fn rejoining_replaces_the_mailbox() {
        let hub = InMemoryHub::new();
        let a = hub.join("a").await;
        let b_old = hub.join("b").await;
        let b_new = hub.join("b").await;

        a.send(&"b".into(), beacon("a", 7)).await.unwrap();
        let (_, msg) = b_new.receive().await.unwrap();
        assert_eq!(msg.kind(), "heartbeat");

        // The stale mailbox stays empty; give it no chance to block.
        drop(b_old);
    }
}
