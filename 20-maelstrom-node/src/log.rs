//! Replicated append-only log with per-key partitions and commit watermarks.
//!
//! In [`LogMode::Shared`] each partition is one JSON array in the shared
//! linearizable store under `log/<key>`; appends go through the store's CAS,
//! so every node hands out the same offsets and serves the same polls.
//! Watermarks live under `commit/<key>` and only ever move up.
//!
//! [`LogMode::Local`] keeps everything in this process. It is correct only
//! when a single node serves every client.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::try_join_all;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::{LogMode, RetryPolicy};
use crate::error::NodeError;
use crate::kv::KvClient;
use crate::message::{Body, Message};
use crate::node::Node;

pub type Offset = u64;
pub type Entry = i64;
pub type Polled = BTreeMap<String, Vec<(Offset, Entry)>>;

#[derive(Debug, Deserialize)]
struct SendRequest {
    key: String,
    msg: Entry,
}

#[derive(Debug, Deserialize)]
struct OffsetsRequest {
    offsets: HashMap<String, Offset>,
}

#[derive(Debug, Deserialize)]
struct KeysRequest {
    keys: Vec<String>,
}

/// In-process partitions and watermarks.
#[derive(Default)]
pub struct LocalLog {
    partitions: Mutex<HashMap<String, Vec<Entry>>>,
    committed: Mutex<HashMap<String, Offset>>,
}

impl LocalLog {
    pub async fn append(&self, key: &str, entry: Entry) -> Offset {
        let mut partitions = self.partitions.lock().await;
        let partition = partitions.entry(key.to_string()).or_default();
        partition.push(entry);
        (partition.len() - 1) as Offset
    }

    pub async fn read_from(&self, key: &str, start: Offset, limit: usize) -> Vec<(Offset, Entry)> {
        let partitions = self.partitions.lock().await;
        partitions
            .get(key)
            .map(|entries| page(entries, start, limit))
            .unwrap_or_default()
    }

    pub async fn commit(&self, key: &str, offset: Offset) -> Offset {
        let mut committed = self.committed.lock().await;
        let watermark = committed.entry(key.to_string()).or_insert(offset);
        *watermark = (*watermark).max(offset);
        *watermark
    }

    pub async fn committed(&self, key: &str) -> Option<Offset> {
        self.committed.lock().await.get(key).copied()
    }
}

/// Partitions and watermarks kept in the shared store.
pub struct SharedLog {
    kv: KvClient,
    policy: RetryPolicy,
}

impl SharedLog {
    pub fn new(kv: KvClient, policy: RetryPolicy) -> Self {
        Self { kv, policy }
    }

    fn partition_key(key: &str) -> String {
        format!("log/{key}")
    }

    fn commit_key(key: &str) -> String {
        format!("commit/{key}")
    }

    pub async fn append(&self, node: &Node, key: &str, entry: Entry) -> Result<Offset, NodeError> {
        let store_key = Self::partition_key(key);
        let written = self
            .kv
            .update(node, &store_key, &self.policy, |current| {
                let mut entries = decode_entries(&store_key, current)?;
                entries.push(entry);
                Ok(Some(json!(entries)))
            })
            .await?;
        let len = written
            .as_ref()
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or_default();
        Ok(len.saturating_sub(1) as Offset)
    }

    pub async fn read_from(
        &self,
        node: &Node,
        key: &str,
        start: Offset,
        limit: usize,
    ) -> Result<Vec<(Offset, Entry)>, NodeError> {
        let store_key = Self::partition_key(key);
        let current = match self.kv.read(node, &store_key).await {
            Ok(value) => Some(value),
            Err(NodeError::KeyDoesNotExist(_)) => None,
            Err(err) => return Err(err),
        };
        let entries = decode_entries(&store_key, current.as_ref())?;
        Ok(page(&entries, start, limit))
    }

    pub async fn commit(&self, node: &Node, key: &str, offset: Offset) -> Result<(), NodeError> {
        let store_key = Self::commit_key(key);
        self.kv
            .update(node, &store_key, &self.policy, |current| {
                let existing = current.and_then(Value::as_u64);
                match existing {
                    Some(watermark) if watermark >= offset => Ok(None),
                    _ => Ok(Some(json!(offset))),
                }
            })
            .await
            .map(|_| ())
    }

    pub async fn committed(&self, node: &Node, key: &str) -> Result<Option<Offset>, NodeError> {
        match self.kv.read(node, &Self::commit_key(key)).await {
            Ok(value) => Ok(value.as_u64()),
            Err(NodeError::KeyDoesNotExist(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn decode_entries(store_key: &str, value: Option<&Value>) -> Result<Vec<Entry>, NodeError> {
    match value {
        None => Ok(Vec::new()),
        Some(value) => {
            serde_json::from_value(value.clone()).map_err(|err| NodeError::CorruptValue {
                key: store_key.to_string(),
                detail: format!("not a list of entries: {err}"),
            })
        }
    }
}

fn page(entries: &[Entry], start: Offset, limit: usize) -> Vec<(Offset, Entry)> {
    entries
        .iter()
        .copied()
        .enumerate()
        .skip(usize::try_from(start).unwrap_or(usize::MAX))
        .take(limit)
        .map(|(offset, entry)| (offset as Offset, entry))
        .collect()
}

pub enum LogStore {
    Local(LocalLog),
    Shared(SharedLog),
}

pub struct LogEngine {
    store: LogStore,
    max_poll_entries: usize,
}

impl LogEngine {
    pub fn new(mode: LogMode, kv: KvClient, policy: RetryPolicy, max_poll_entries: usize) -> Self {
        let store = match mode {
            LogMode::Local => LogStore::Local(LocalLog::default()),
            LogMode::Shared => LogStore::Shared(SharedLog::new(kv, policy)),
        };
        Self {
            store,
            max_poll_entries: max_poll_entries.max(1),
        }
    }

    /// Appends `entry` to `key` and returns its offset.
    pub async fn send(&self, node: &Node, key: &str, entry: Entry) -> Result<Offset, NodeError> {
        match &self.store {
            LogStore::Local(log) => Ok(log.append(key, entry).await),
            LogStore::Shared(log) => log.append(node, key, entry).await,
        }
    }

    /// Entries at or after each requested start offset, paired with their
    /// offsets. Unknown keys and starts past the end yield empty lists.
    pub async fn poll(
        &self,
        node: &Node,
        offsets: &HashMap<String, Offset>,
    ) -> Result<Polled, NodeError> {
        let limit = self.max_poll_entries;
        let reads = offsets.iter().map(|(key, &start)| async move {
            let entries = match &self.store {
                LogStore::Local(log) => log.read_from(key, start, limit).await,
                LogStore::Shared(log) => log.read_from(node, key, start, limit).await?,
            };
            Ok::<_, NodeError>((key.clone(), entries))
        });
        Ok(try_join_all(reads).await?.into_iter().collect())
    }

    /// Raises each watermark to at least the given offset.
    pub async fn commit_offsets(
        &self,
        node: &Node,
        offsets: &HashMap<String, Offset>,
    ) -> Result<(), NodeError> {
        let commits = offsets.iter().map(|(key, &offset)| async move {
            match &self.store {
                LogStore::Local(log) => {
                    log.commit(key, offset).await;
                    Ok(())
                }
                LogStore::Shared(log) => log.commit(node, key, offset).await,
            }
        });
        try_join_all(commits).await.map(|_| ())
    }

    /// Current watermark per key; keys never committed are left out.
    pub async fn list_committed_offsets(
        &self,
        node: &Node,
        keys: &[String],
    ) -> Result<BTreeMap<String, Offset>, NodeError> {
        let lookups = keys.iter().map(|key| async move {
            let committed = match &self.store {
                LogStore::Local(log) => log.committed(key).await,
                LogStore::Shared(log) => log.committed(node, key).await?,
            };
            Ok::<_, NodeError>(committed.map(|offset| (key.clone(), offset)))
        });
        Ok(try_join_all(lookups).await?.into_iter().flatten().collect())
    }

    async fn on_send(&self, node: &Node, message: &Message) -> Result<(), NodeError> {
        let SendRequest { key, msg } = message.body.parse()?;
        let offset = self.send(node, &key, msg).await?;
        debug!(%key, offset, "entry appended");
        node.reply(message, Body::with_fields("send_ok", json!({ "offset": offset })))
    }

    async fn on_poll(&self, node: &Node, message: &Message) -> Result<(), NodeError> {
        let OffsetsRequest { offsets } = message.body.parse()?;
        let msgs = self.poll(node, &offsets).await?;
        node.reply(message, Body::with_fields("poll_ok", json!({ "msgs": msgs })))
    }

    async fn on_commit_offsets(&self, node: &Node, message: &Message) -> Result<(), NodeError> {
        let OffsetsRequest { offsets } = message.body.parse()?;
        self.commit_offsets(node, &offsets).await?;
        node.reply(message, Body::new("commit_offsets_ok"))
    }

    async fn on_list_committed_offsets(
        &self,
        node: &Node,
        message: &Message,
    ) -> Result<(), NodeError> {
        let KeysRequest { keys } = message.body.parse()?;
        let offsets = self.list_committed_offsets(node, &keys).await?;
        node.reply(
            message,
            Body::with_fields("list_committed_offsets_ok", json!({ "offsets": offsets })),
        )
    }
}

/// Registers `send`, `poll`, `commit_offsets` and `list_committed_offsets`.
pub async fn register(node: &Node, engine: Arc<LogEngine>) -> Result<(), NodeError> {
    let handler = Arc::clone(&engine);
    node.handle("send", move |node, message| {
        let engine = Arc::clone(&handler);
        async move { engine.on_send(&node, &message).await }
    })
    .await?;

    let handler = Arc::clone(&engine);
    node.handle("poll", move |node, message| {
        let engine = Arc::clone(&handler);
        async move { engine.on_poll(&node, &message).await }
    })
    .await?;

    let handler = Arc::clone(&engine);
    node.handle("commit_offsets", move |node, message| {
        let engine = Arc::clone(&handler);
        async move { engine.on_commit_offsets(&node, &message).await }
    })
    .await?;

    node.handle("list_committed_offsets", move |node, message| {
        let engine = Arc::clone(&engine);
        async move { engine.on_list_committed_offsets(&node, &message).await }
    })
    .await
}
