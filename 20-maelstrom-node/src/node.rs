//! The message channel every workload is built on.
//!
//! A [`Node`] owns the outbound queue, the table of requests awaiting a
//! reply, and the handler registry. Inbound envelopes enter through
//! [`Node::dispatch`]: replies complete a pending request, everything else is
//! routed to the handler registered for its `type` and run as its own task.
//!
//! The node never touches stdin/stdout itself. Outbound envelopes land on an
//! unbounded channel whose receiver is drained either by
//! [`crate::runtime`] or by a simulated network in tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{
    Arc, OnceLock, PoisonError,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::message::{Body, Message};

pub type Outbox = mpsc::UnboundedReceiver<Message>;

type Pending = std::sync::Mutex<HashMap<u64, oneshot::Sender<Message>>>;

type Handler =
    Arc<dyn Fn(Arc<Node>, Message) -> BoxFuture<'static, Result<(), NodeError>> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct InitRequest {
    node_id: String,
    #[serde(default)]
    node_ids: Vec<String>,
}

pub struct Node {
    id: OnceLock<String>,
    node_ids: OnceLock<Vec<String>>,
    config: NodeConfig,
    next_msg_id: AtomicU64,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Pending,
    handlers: RwLock<HashMap<String, Handler>>,
}

impl Node {
    /// Creates a node and the receiver its outbound envelopes are queued on.
    pub fn new(config: NodeConfig) -> (Arc<Self>, Outbox) {
        let (outbound, outbox) = mpsc::unbounded_channel();
        let node = Arc::new(Self {
            id: OnceLock::new(),
            node_ids: OnceLock::new(),
            config,
            next_msg_id: AtomicU64::new(1),
            outbound,
            pending: Pending::default(),
            handlers: RwLock::new(HashMap::new()),
        });
        (node, outbox)
    }

    /// This node's id, or an empty string before `init`.
    pub fn id(&self) -> &str {
        self.id.get().map(String::as_str).unwrap_or_default()
    }

    pub fn node_ids(&self) -> &[String] {
        self.node_ids.get().map(Vec::as_slice).unwrap_or_default()
    }

    /// Cluster members other than this node.
    pub fn peers(&self) -> impl Iterator<Item = &String> {
        let me = self.id();
        self.node_ids().iter().filter(move |id| id.as_str() != me)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers the handler for one message type.
    ///
    /// `init` may be registered as well: it runs after the node learns its
    /// identity and before `init_ok` is sent.
    pub async fn handle<F, Fut>(&self, kind: &str, handler: F) -> Result<(), NodeError>
    where
        F: Fn(Arc<Node>, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NodeError>> + Send + 'static,
    {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(kind) {
            return Err(NodeError::DuplicateHandler(kind.to_string()));
        }
        let boxed: Handler = Arc::new(
            move |node: Arc<Node>, message: Message| -> BoxFuture<'static, Result<(), NodeError>> {
                Box::pin(handler(node, message))
            },
        );
        handlers.insert(kind.to_string(), boxed);
        Ok(())
    }

    /// Fire-and-forget send with a fresh `msg_id`.
    pub fn send(&self, dest: &str, mut body: Body) -> Result<u64, NodeError> {
        let msg_id = self.next_msg_id();
        body.msg_id = Some(msg_id);
        body.in_reply_to = None;
        self.enqueue(dest, body)?;
        Ok(msg_id)
    }

    /// Answers `request`, echoing its `msg_id` as `in_reply_to`.
    ///
    /// Requests without a `msg_id` cannot be correlated and get no reply.
    pub fn reply(&self, request: &Message, mut body: Body) -> Result<(), NodeError> {
        let Some(in_reply_to) = request.body.msg_id else {
            debug!(kind = %request.body.kind, src = %request.src, "request carries no msg_id; reply dropped");
            return Ok(());
        };
        body.msg_id = Some(self.next_msg_id());
        body.in_reply_to = Some(in_reply_to);
        self.enqueue(&request.src, body)
    }

    pub fn reply_error(&self, request: &Message, err: &NodeError) -> Result<(), NodeError> {
        self.reply(request, Body::error(err.code().code(), err.to_string()))
    }

    fn enqueue(&self, dest: &str, body: Body) -> Result<(), NodeError> {
        let message = Message {
            src: self.id().to_string(),
            dest: dest.to_string(),
            body,
        };
        self.outbound
            .send(message)
            .map_err(|_| NodeError::ChannelClosed)
    }

    /// Sends once and waits up to `wait` for the correlated reply.
    ///
    /// `error` replies come back as the matching [`NodeError`]. A reply that
    /// arrives after the deadline is dropped by [`Node::dispatch`].
    pub async fn rpc(&self, dest: &str, body: Body, wait: Duration) -> Result<Message, NodeError> {
        let msg_id = self.next_msg_id();
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(msg_id, tx);
        // Clears the entry on every exit, including this future being dropped.
        let _awaiting = AwaitingReply {
            pending: &self.pending,
            msg_id,
        };

        let mut body = body;
        body.msg_id = Some(msg_id);
        body.in_reply_to = None;
        self.enqueue(dest, body)?;

        match timeout(wait, rx).await {
            Ok(Ok(reply)) if reply.body.is_error() => Err(reply.body.into_error()),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NodeError::ChannelClosed),
            Err(_) => Err(NodeError::Timeout(wait)),
        }
    }

    /// Re-sends on the configured retry interval until a reply arrives or
    /// `deadline` elapses. Only use for idempotent requests.
    pub async fn request_and_await(
        &self,
        dest: &str,
        body: Body,
        deadline: Duration,
    ) -> Result<Message, NodeError> {
        let give_up = Instant::now() + deadline;
        loop {
            let remaining = give_up.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(NodeError::Timeout(deadline));
            }
            let attempt = remaining.min(self.config.retry_interval);
            match self.rpc(dest, body.clone(), attempt).await {
                Err(NodeError::Timeout(_)) => {
                    debug!(%dest, kind = %body.kind, "no reply yet; resending");
                }
                other => return other,
            }
        }
    }

    /// Spawns a task that keeps re-sending `body` until `dest` acknowledges
    /// it. There is no deadline; the task ends on an ack, on a non-retryable
    /// error reply, or when the process exits.
    pub fn send_until_acked(self: &Arc<Self>, dest: String, body: Body) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let interval = node.config.retry_interval;
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                match node.rpc(&dest, body.clone(), interval).await {
                    Ok(_) => {
                        debug!(%dest, attempts, "delivery acknowledged");
                        return;
                    }
                    Err(NodeError::ChannelClosed) => return,
                    Err(err) if err.is_retryable() => {
                        debug!(%dest, attempts, error = %err, "delivery not acknowledged; retrying");
                    }
                    Err(err) => {
                        warn!(%dest, error = %err, "peer rejected delivery");
                        return;
                    }
                }
            }
        })
    }

    /// Routes one inbound envelope.
    pub async fn dispatch(self: &Arc<Self>, message: Message) {
        if let Some(in_reply_to) = message.body.in_reply_to {
            self.complete_pending(in_reply_to, message);
            return;
        }

        if message.body.kind == "init" {
            let node = Arc::clone(self);
            tokio::spawn(async move { node.handle_init(message).await });
            return;
        }

        let handler = self.handlers.read().await.get(&message.body.kind).cloned();
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let result = match handler {
                Some(handler) => handler(Arc::clone(&node), message.clone()).await,
                None => Err(NodeError::UnknownMessageType(message.body.kind.clone())),
            };
            if let Err(err) = result {
                node.report_failure(&message, &err);
            }
        });
    }

    fn complete_pending(&self, in_reply_to: u64, reply: Message) {
        let waiter = lock(&self.pending).remove(&in_reply_to);
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(in_reply_to, src = %reply.src, "unmatched reply dropped"),
        }
    }

    async fn handle_init(self: Arc<Self>, message: Message) {
        let request = match message.body.parse::<InitRequest>() {
            Ok(request) => request,
            Err(err) => {
                self.report_failure(&message, &err);
                return;
            }
        };

        if self.id.set(request.node_id.clone()).is_err() {
            warn!(node = %self.id(), requested = %request.node_id, "duplicate init ignored");
        } else {
            let _ = self.node_ids.set(request.node_ids);
            info!(node = %self.id(), cluster = self.node_ids().len(), "node initialized");
        }

        let hook = self.handlers.read().await.get("init").cloned();
        if let Some(hook) = hook {
            if let Err(err) = hook(Arc::clone(&self), message.clone()).await {
                warn!(error = %err, "init hook failed");
            }
        }

        if let Err(err) = self.reply(&message, Body::new("init_ok")) {
            warn!(error = %err, "failed to acknowledge init");
        }
    }

    fn report_failure(&self, request: &Message, err: &NodeError) {
        warn!(kind = %request.body.kind, src = %request.src, error = %err, "request failed");
        if let Err(send_err) = self.reply_error(request, err) {
            warn!(error = %send_err, "failed to send error reply");
        }
    }
}

/// Removes an `rpc` entry from the pending table when dropped.
struct AwaitingReply<'a> {
    pending: &'a Pending,
    msg_id: u64,
}

impl Drop for AwaitingReply<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.msg_id);
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Message>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}
