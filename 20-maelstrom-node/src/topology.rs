use std::collections::HashMap;

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::error::NodeError;

/// Body of a `topology` request. The field is required: a body that lacks it
/// is rejected instead of silently producing an empty adjacency map.
#[derive(Debug, Deserialize)]
pub struct TopologyRequest {
    pub topology: HashMap<String, Vec<String>>,
}

impl TopologyRequest {
    /// Checks the decoded map against the cluster this node belongs to.
    ///
    /// In a multi-node cluster the map must name `self_id`, otherwise gossip
    /// would never leave this node.
    pub fn validate(&self, self_id: &str, cluster_size: usize) -> Result<(), NodeError> {
        if cluster_size <= 1 {
            return Ok(());
        }
        if self.topology.is_empty() {
            return Err(NodeError::MalformedRequest(format!(
                "empty topology for a cluster of {cluster_size} nodes"
            )));
        }
        if !self.topology.contains_key(self_id) {
            return Err(NodeError::MalformedRequest(format!(
                "topology has no adjacency entry for {self_id}"
            )));
        }
        Ok(())
    }
}

/// Directed peer-adjacency map, replaced wholesale by each `topology` message.
#[derive(Default)]
pub struct Topology {
    adjacency: RwLock<Option<HashMap<String, Vec<String>>>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the adjacency map. Last write wins.
    pub async fn set(&self, adjacency: HashMap<String, Vec<String>>) {
        *self.adjacency.write().await = Some(adjacency);
    }

    pub async fn is_configured(&self) -> bool {
        self.adjacency.read().await.is_some()
    }

    /// Neighbors of `id` in declaration order, without duplicates or `id`
    /// itself. Empty when no topology has been set.
    pub async fn neighbors(&self, id: &str) -> Vec<String> {
        let adjacency = self.adjacency.read().await;
        let Some(listed) = adjacency.as_ref().and_then(|map| map.get(id)) else {
            return Vec::new();
        };

        let mut neighbors: Vec<String> = Vec::with_capacity(listed.len());
        for peer in listed {
            if peer != id && !neighbors.contains(peer) {
                neighbors.push(peer.clone());
            }
        }
        neighbors
    }
}
