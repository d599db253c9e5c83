//! Eventually-consistent replicated set.
//!
//! Every node keeps its own [`BroadcastEngine`]. A value is inserted at most
//! once; only a first insertion triggers gossip, so re-deliveries caused by
//! retries, duplicates or cycles in the topology die out at the insert check.
//! Gossip uses the ordinary `broadcast` message, so a peer's `broadcast_ok`
//! doubles as the acknowledgment that stops the retry task.
//!
//! Topology and broadcasts may arrive in any order. When a `topology` message
//! adds neighbors, everything already held is forwarded to them.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::TopologyMode;
use crate::error::NodeError;
use crate::message::{Body, Message};
use crate::node::Node;
use crate::topology::{Topology, TopologyRequest};

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    message: i64,
}

#[derive(Default)]
pub struct BroadcastEngine {
    values: Mutex<BTreeSet<i64>>,
    topology: Topology,
    mode: TopologyMode,
}

impl BroadcastEngine {
    pub fn new(mode: TopologyMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Inserts `value`; returns `false` if it was already present.
    pub async fn accept(&self, value: i64) -> bool {
        self.values.lock().await.insert(value)
    }

    /// Snapshot of every value seen so far, ascending.
    pub async fn snapshot(&self) -> Vec<i64> {
        self.values.lock().await.iter().copied().collect()
    }

    /// Peers a freshly accepted value should be forwarded to. `from` is the
    /// peer that delivered it and is skipped.
    pub async fn gossip_targets(&self, node: &Node, from: &str) -> Vec<String> {
        let candidates = match self.mode {
            TopologyMode::Provided => self.topology.neighbors(node.id()).await,
            TopologyMode::Mesh => node.peers().cloned().collect(),
        };
        candidates.into_iter().filter(|peer| peer != from).collect()
    }

    async fn on_broadcast(&self, node: &Arc<Node>, message: &Message) -> Result<(), NodeError> {
        let BroadcastRequest { message: value } = message.body.parse()?;
        let fresh = self.accept(value).await;
        node.reply(message, Body::new("broadcast_ok"))?;

        if !fresh {
            debug!(value, src = %message.src, "duplicate broadcast ignored");
            return Ok(());
        }

        for peer in self.gossip_targets(node, &message.src).await {
            node.send_until_acked(peer, gossip(value));
        }
        Ok(())
    }

    /// Forwards every value held so far to peers that just became neighbors.
    async fn catch_up(&self, node: &Arc<Node>, joined: &[String]) {
        if joined.is_empty() {
            return;
        }
        let values = self.snapshot().await;
        if values.is_empty() {
            return;
        }
        debug!(peers = ?joined, values = values.len(), "forwarding held values to new neighbors");
        for peer in joined {
            for &value in &values {
                node.send_until_acked(peer.clone(), gossip(value));
            }
        }
    }

    async fn on_read(&self, node: &Node, message: &Message) -> Result<(), NodeError> {
        let values = self.snapshot().await;
        node.reply(
            message,
            Body::with_fields("read_ok", json!({ "messages": values })),
        )
    }

    async fn on_topology(&self, node: &Arc<Node>, message: &Message) -> Result<(), NodeError> {
        let request: TopologyRequest = message.body.parse()?;
        request.validate(node.id(), node.node_ids().len())?;

        let previous = self.topology.neighbors(node.id()).await;
        self.topology.set(request.topology).await;
        let neighbors = self.topology.neighbors(node.id()).await;
        info!(neighbors = ?neighbors, mode = ?self.mode, "topology updated");
        node.reply(message, Body::new("topology_ok"))?;

        // Mesh gossip never consults the map, so there is nobody new to reach.
        if self.mode == TopologyMode::Provided {
            let joined: Vec<String> = neighbors
                .into_iter()
                .filter(|peer| !previous.contains(peer))
                .collect();
            self.catch_up(node, &joined).await;
        }
        Ok(())
    }
}

fn gossip(value: i64) -> Body {
    Body::with_fields("broadcast", json!({ "message": value }))
}

/// Registers `broadcast`, `read` and `topology` on `node`.
pub async fn register(node: &Node, engine: Arc<BroadcastEngine>) -> Result<(), NodeError> {
    let handler = Arc::clone(&engine);
    node.handle("broadcast", move |node, message| {
        let engine = Arc::clone(&handler);
        async move { engine.on_broadcast(&node, &message).await }
    })
    .await?;

    let handler = Arc::clone(&engine);
    node.handle("read", move |node, message| {
        let engine = Arc::clone(&handler);
        async move { engine.on_read(&node, &message).await }
    })
    .await?;

    node.handle("topology", move |node, message| {
        let engine = Arc::clone(&engine);
        async move { engine.on_topology(&node, &message).await }
    })
    .await
}
