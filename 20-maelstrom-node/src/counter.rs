//! Counter shared by the whole cluster through the linearizable store.
//!
//! No node owns the value. Every `add` is a bounded read/compare-and-swap
//! loop against the store, so concurrent adds from different nodes serialize
//! on the store's CAS instead of overwriting each other.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::config::RetryPolicy;
use crate::error::NodeError;
use crate::kv::KvClient;
use crate::message::{Body, Message};
use crate::node::Node;

pub const DEFAULT_KEY: &str = "counter";

#[derive(Debug, Deserialize)]
struct AddRequest {
    delta: i64,
}

pub struct CounterEngine {
    kv: KvClient,
    key: String,
    policy: RetryPolicy,
}

impl CounterEngine {
    pub fn new(kv: KvClient, key: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            kv,
            key: key.into(),
            policy,
        }
    }

    /// Creates the key holding `0` unless it already exists.
    pub async fn init(&self, node: &Node) -> Result<(), NodeError> {
        let key = self.key.as_str();
        let result = self
            .kv
            .update(node, key, &self.policy, |current| match current {
                Some(_) => Ok(None),
                None => Ok(Some(json!(0))),
            })
            .await?;
        match result {
            Some(_) => info!(key, store = self.kv.service(), "counter created"),
            None => debug!(key, "counter already present"),
        }
        Ok(())
    }

    /// Adds `delta` and returns the value this node wrote.
    pub async fn add(&self, node: &Node, delta: i64) -> Result<i64, NodeError> {
        let key = self.key.as_str();
        let written = self
            .kv
            .update(node, key, &self.policy, |current| {
                let base = match current {
                    None => 0,
                    Some(value) => value.as_i64().ok_or_else(|| NodeError::CorruptValue {
                        key: key.to_string(),
                        detail: format!("{value} is not an integer"),
                    })?,
                };
                let next = base.checked_add(delta).ok_or_else(|| {
                    NodeError::MalformedRequest(format!("adding {delta} to {base} overflows"))
                })?;
                Ok(Some(Value::from(next)))
            })
            .await?;
        Ok(written.and_then(|value| value.as_i64()).unwrap_or_default())
    }

    /// Reads the current value straight from the store.
    pub async fn read(&self, node: &Node) -> Result<i64, NodeError> {
        self.kv.read_int(node, &self.key).await
    }

    async fn on_add(&self, node: &Node, message: &Message) -> Result<(), NodeError> {
        let AddRequest { delta } = message.body.parse()?;
        let value = self.add(node, delta).await?;
        debug!(delta, value, "counter incremented");
        node.reply(message, Body::new("add_ok"))
    }

    async fn on_read(&self, node: &Node, message: &Message) -> Result<(), NodeError> {
        let value = self.read(node).await?;
        node.reply(message, Body::with_fields("read_ok", json!({ "value": value })))
    }
}

/// Registers `init`, `add` and `read` on `node`.
pub async fn register(node: &Node, engine: Arc<CounterEngine>) -> Result<(), NodeError> {
    let handler = Arc::clone(&engine);
    node.handle("init", move |node, _message| {
        let engine = Arc::clone(&handler);
        async move { engine.init(&node).await }
    })
    .await?;

    let handler = Arc::clone(&engine);
    node.handle("add", move |node, message| {
        let engine = Arc::clone(&handler);
        async move { engine.on_add(&node, &message).await }
    })
    .await?;

    node.handle("read", move |node, message| {
        let engine = Arc::clone(&engine);
        async move { engine.on_read(&node, &message).await }
    })
    .await
}
