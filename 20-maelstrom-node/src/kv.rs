//! Client for the shared linearizable key-value service.
//!
//! The service is just another addressable peer (`lin-kv` or `seq-kv`)
//! speaking `read`, `write` and `cas`. Idempotent requests go through
//! [`Node::request_and_await`]; `cas` is sent exactly once per attempt,
//! because re-sending a swap that already applied would turn into a spurious
//! precondition failure and a second application by the caller.

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::debug;

use crate::config::RetryPolicy;
use crate::error::NodeError;
use crate::message::Body;
use crate::node::Node;

pub const LIN_KV: &str = "lin-kv";
pub const SEQ_KV: &str = "seq-kv";

#[derive(Debug, Deserialize)]
struct ReadOk {
    value: Value,
}

#[derive(Debug, Clone)]
pub struct KvClient {
    service: String,
}

impl KvClient {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn read(&self, node: &Node, key: &str) -> Result<Value, NodeError> {
        let body = Body::with_fields("read", json!({ "key": key }));
        let reply = self.call(node, body).await?;
        Ok(reply.parse::<ReadOk>()?.value)
    }

    pub async fn read_int(&self, node: &Node, key: &str) -> Result<i64, NodeError> {
        let value = self.read(node, key).await?;
        value.as_i64().ok_or_else(|| NodeError::CorruptValue {
            key: key.to_string(),
            detail: format!("{value} is not an integer"),
        })
    }

    pub async fn write(&self, node: &Node, key: &str, value: Value) -> Result<(), NodeError> {
        let body = Body::with_fields("write", json!({ "key": key, "value": value }));
        self.call(node, body).await.map(|_| ())
    }

    /// Swaps `from` for `to` in one round trip. With `create_if_absent` a
    /// missing key is created holding `to` regardless of `from`.
    ///
    /// A missing reply comes back as a bare [`NodeError::Timeout`]: unlike a
    /// refusal, it leaves the outcome of the swap unknown.
    pub async fn compare_and_swap(
        &self,
        node: &Node,
        key: &str,
        from: Value,
        to: Value,
        create_if_absent: bool,
    ) -> Result<(), NodeError> {
        let body = Body::with_fields(
            "cas",
            json!({
                "key": key,
                "from": from,
                "to": to,
                "create_if_not_exists": create_if_absent,
            }),
        );
        node.rpc(&self.service, body, node.config().rpc_timeout)
            .await
            .map(|_| ())
    }

    /// Optimistic read-modify-write bounded by `policy`.
    ///
    /// `apply` sees the current value (`None` when the key is absent) and
    /// returns the replacement, or `None` when nothing needs to change.
    /// Returns the value written, or `None` if `apply` declined.
    ///
    /// Contention, failed reads and swaps the store refused with a retryable
    /// code are all retried with backoff. A swap that got no reply is not:
    /// it may have applied, so it surfaces at once as
    /// [`NodeError::StoreUnavailable`]. When the attempts run out, the last
    /// store failure is returned if the final attempts failed that way,
    /// otherwise [`NodeError::ConcurrencyExhausted`].
    pub async fn update<F>(
        &self,
        node: &Node,
        key: &str,
        policy: &RetryPolicy,
        mut apply: F,
    ) -> Result<Option<Value>, NodeError>
    where
        F: FnMut(Option<&Value>) -> Result<Option<Value>, NodeError>,
    {
        let mut last_failure = None;
        for attempt in 1..=policy.max_attempts {
            let current = match self.read(node, key).await {
                Ok(value) => Some(value),
                Err(NodeError::KeyDoesNotExist(_)) => None,
                Err(err) if err.is_retryable() => {
                    debug!(%key, attempt, error = %err, "read failed; backing off");
                    last_failure = Some(err);
                    sleep(policy.backoff(attempt)).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let Some(next) = apply(current.as_ref())? else {
                return Ok(None);
            };

            let created = current.is_none();
            let from = current.unwrap_or(Value::Null);
            match self
                .compare_and_swap(node, key, from, next.clone(), created)
                .await
            {
                Ok(()) => return Ok(Some(next)),
                Err(err @ NodeError::Timeout(_)) => return Err(unavailable(err)),
                Err(NodeError::CasFailed(_)) | Err(NodeError::KeyDoesNotExist(_)) => {
                    debug!(%key, attempt, "contended swap; backing off");
                    last_failure = None;
                    sleep(policy.backoff(attempt)).await;
                }
                Err(err) if err.is_retryable() => {
                    debug!(%key, attempt, error = %err, "swap refused; backing off");
                    last_failure = Some(err);
                    sleep(policy.backoff(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_failure.unwrap_or_else(|| NodeError::ConcurrencyExhausted {
            key: key.to_string(),
            attempts: policy.max_attempts,
        }))
    }

    async fn call(&self, node: &Node, body: Body) -> Result<Body, NodeError> {
        node.request_and_await(&self.service, body, node.config().rpc_timeout)
            .await
            .map(|reply| reply.body)
            .map_err(unavailable)
    }
}

/// A store that never answers is reported as unavailable rather than as a
/// bare timeout, so callers can tell it apart from a slow peer.
fn unavailable(err: NodeError) -> NodeError {
    match err {
        NodeError::Timeout(after) => {
            NodeError::StoreUnavailable(format!("no reply from store within {after:?}"))
        }
        other => other,
    }
}
