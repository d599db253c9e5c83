//! In-memory cluster harness.
//!
//! Every node's outbox is drained by a router task that delivers envelopes to
//! other nodes, to test clients, or to a simulated `lin-kv` service. Links
//! can be cut and healed, and delivery can be doubled to exercise dedup.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use maelstrom_node::config::NodeConfig;
use maelstrom_node::kv::{LIN_KV, SEQ_KV};
use maelstrom_node::node::Outbox;
use maelstrom_node::{Body, Message, Node};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub fn fast_config() -> NodeConfig {
    NodeConfig {
        retry_interval: Duration::from_millis(20),
        rpc_timeout: Duration::from_millis(300),
    }
}

#[derive(Default)]
struct Network {
    nodes: Mutex<HashMap<String, Arc<Node>>>,
    clients: Mutex<HashMap<String, mpsc::UnboundedSender<Message>>>,
    kv: Mutex<HashMap<String, Value>>,
    cut: Mutex<HashSet<(String, String)>>,
    duplicate: AtomicBool,
    /// Error code and count of upcoming `cas` requests to refuse.
    refuse_cas: Mutex<Option<(u32, usize)>>,
}

impl Network {
    fn is_cut(&self, src: &str, dest: &str) -> bool {
        self.cut
            .lock()
            .expect("cut lock")
            .contains(&(src.to_string(), dest.to_string()))
    }

    async fn route(&self, message: Message) {
        if self.is_cut(&message.src, &message.dest) {
            return;
        }

        if message.dest == LIN_KV || message.dest == SEQ_KV {
            let reply = self.serve_kv(&message);
            if !self.is_cut(&reply.src, &reply.dest) {
                self.deliver(reply).await;
            }
            return;
        }

        let copies = if self.duplicate.load(Ordering::Relaxed) { 2 } else { 1 };
        for _ in 0..copies {
            self.deliver(message.clone()).await;
        }
    }

    async fn deliver(&self, message: Message) {
        let node = self
            .nodes
            .lock()
            .expect("nodes lock")
            .get(&message.dest)
            .cloned();
        if let Some(node) = node {
            node.dispatch(message).await;
            return;
        }
        let client = self
            .clients
            .lock()
            .expect("clients lock")
            .get(&message.dest)
            .cloned();
        if let Some(client) = client {
            let _ = client.send(message);
        }
    }

    fn take_cas_refusal(&self) -> Option<u32> {
        let mut refuse = self.refuse_cas.lock().expect("refuse lock");
        match refuse.as_mut() {
            Some((code, left)) if *left > 0 => {
                *left -= 1;
                Some(*code)
            }
            _ => None,
        }
    }

    fn serve_kv(&self, request: &Message) -> Message {
        let fields = &request.body.fields;
        let refused = if request.body.kind == "cas" {
            self.take_cas_refusal()
        } else {
            None
        };
        let key = match fields.get("key") {
            Some(Value::String(key)) => key.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let mut store = self.kv.lock().expect("kv lock");

        let body = match (request.body.kind.as_str(), refused) {
            ("cas", Some(code)) => Body::error(code, "cas refused by store"),
            ("read", _) => match store.get(&key) {
                Some(value) => Body::with_fields("read_ok", json!({ "value": value })),
                None => Body::error(20, format!("key {key} does not exist")),
            },
            ("write", _) => {
                let value = fields.get("value").cloned().unwrap_or(Value::Null);
                store.insert(key, value);
                Body::new("write_ok")
            }
            ("cas", None) => {
                let from = fields.get("from").cloned().unwrap_or(Value::Null);
                let to = fields.get("to").cloned().unwrap_or(Value::Null);
                let create = fields
                    .get("create_if_not_exists")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                match store.get(&key).cloned() {
                    None if create => {
                        store.insert(key, to);
                        Body::new("cas_ok")
                    }
                    None => Body::error(20, format!("key {key} does not exist")),
                    Some(current) if current == from => {
                        store.insert(key, to);
                        Body::new("cas_ok")
                    }
                    Some(current) => {
                        Body::error(22, format!("expected {from}, but had {current}"))
                    }
                }
            }
            (other, _) => Body::error(10, format!("unsupported kv operation {other}")),
        };

        let mut body = body;
        body.in_reply_to = request.body.msg_id;
        Message {
            src: request.dest.clone(),
            dest: request.src.clone(),
            body,
        }
    }
}

pub struct Cluster {
    ids: Vec<String>,
    net: Arc<Network>,
}

impl Cluster {
    /// Builds `size` nodes named `n1..=size`; call `init` once handlers are
    /// registered.
    pub fn new(size: usize, config: NodeConfig) -> Self {
        let net = Arc::new(Network::default());
        let ids: Vec<String> = (1..=size).map(|i| format!("n{i}")).collect();
        for id in &ids {
            let (node, outbox) = Node::new(config.clone());
            net.nodes
                .lock()
                .expect("nodes lock")
                .insert(id.clone(), node);
            spawn_router(Arc::clone(&net), outbox);
        }
        Self { ids, net }
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn node(&self, id: &str) -> Arc<Node> {
        self.net
            .nodes
            .lock()
            .expect("nodes lock")
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("no node {id}"))
    }

    /// Runs `register` against every node.
    pub async fn register<F, Fut>(&self, register: F)
    where
        F: Fn(Arc<Node>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        for id in &self.ids {
            register(self.node(id)).await.expect("register handlers");
        }
    }

    pub async fn init(&self) -> Result<()> {
        let mut admin = self.client("c0");
        for id in &self.ids {
            let reply = admin
                .request(
                    id,
                    Body::with_fields("init", json!({ "node_id": id, "node_ids": self.ids })),
                )
                .await?;
            if reply.body.kind != "init_ok" {
                bail!("{id} answered init with {}", reply.body.kind);
            }
        }
        Ok(())
    }

    pub fn client(&self, id: &str) -> Client {
        let (tx, rx) = mpsc::unbounded_channel();
        self.net
            .clients
            .lock()
            .expect("clients lock")
            .insert(id.to_string(), tx);
        Client {
            id: id.to_string(),
            inbox: rx,
            next_msg_id: AtomicU64::new(1),
            net: Arc::clone(&self.net),
        }
    }

    /// Drops every envelope between `a` and `b` in both directions.
    pub fn partition(&self, a: &str, b: &str) {
        let mut cut = self.net.cut.lock().expect("cut lock");
        cut.insert((a.to_string(), b.to_string()));
        cut.insert((b.to_string(), a.to_string()));
    }

    pub fn heal(&self) {
        self.net.cut.lock().expect("cut lock").clear();
    }

    pub fn duplicate_deliveries(&self, on: bool) {
        self.net.duplicate.store(on, Ordering::Relaxed);
    }

    /// Answers the next `times` `cas` requests with error `code`.
    pub fn refuse_cas(&self, code: u32, times: usize) {
        *self.net.refuse_cas.lock().expect("refuse lock") = Some((code, times));
    }

    pub fn kv_value(&self, key: &str) -> Option<Value> {
        self.net.kv.lock().expect("kv lock").get(key).cloned()
    }

    pub fn clear_kv(&self) {
        self.net.kv.lock().expect("kv lock").clear();
    }

    pub fn seed_kv(&self, key: &str, value: Value) {
        self.net
            .kv
            .lock()
            .expect("kv lock")
            .insert(key.to_string(), value);
    }
}

fn spawn_router(net: Arc<Network>, mut outbox: Outbox) {
    tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            net.route(message).await;
        }
    });
}

pub struct Client {
    id: String,
    inbox: mpsc::UnboundedReceiver<Message>,
    next_msg_id: AtomicU64,
    net: Arc<Network>,
}

impl Client {
    /// Sends `body` to `dest` and waits for the correlated reply.
    pub async fn request(&mut self, dest: &str, mut body: Body) -> Result<Message> {
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::Relaxed);
        body.msg_id = Some(msg_id);
        self.net
            .route(Message {
                src: self.id.clone(),
                dest: dest.to_string(),
                body,
            })
            .await;

        timeout(REPLY_TIMEOUT, async {
            loop {
                match self.inbox.recv().await {
                    Some(reply) if reply.body.in_reply_to == Some(msg_id) => return Ok(reply),
                    Some(_) => continue,
                    None => bail!("client inbox closed"),
                }
            }
        })
        .await
        .map_err(|_| anyhow!("no reply from {dest} to msg {msg_id}"))?
    }

    /// Like `request`, but fails unless the reply has type `expected`.
    pub async fn expect(&mut self, dest: &str, body: Body, expected: &str) -> Result<Message> {
        let reply = self.request(dest, body).await?;
        if reply.body.kind != expected {
            bail!(
                "expected {expected} from {dest}, got {}: {:?}",
                reply.body.kind,
                reply.body.fields
            );
        }
        Ok(reply)
    }
}

/// Error code carried by an `error` reply.
pub fn error_code(reply: &Message) -> Option<u64> {
    if reply.body.kind != "error" {
        return None;
    }
    reply.body.fields.get("code").and_then(Value::as_u64)
}

/// Wall-clock budget for conditions that only hold once gossip settles.
pub struct Deadline {
    give_up: Instant,
    within: Duration,
}

impl Deadline {
    pub fn after(within: Duration) -> Self {
        Self {
            give_up: Instant::now() + within,
            within,
        }
    }

    /// Sleeps briefly, or fails once the budget is spent.
    pub async fn tick(&self) -> Result<()> {
        if Instant::now() >= self.give_up {
            bail!("condition not reached within {:?}", self.within);
        }
        sleep(Duration::from_millis(20)).await;
        Ok(())
    }
}
