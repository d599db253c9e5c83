use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::config::{LogMode, NodeConfig, RetryPolicy, TopologyMode};
use crate::counter::DEFAULT_KEY;
use crate::kv::LIN_KV;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub timing: TimingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve only `echo` and `generate`.
    Echo,
    /// Replicated set gossiped over the cluster topology.
    Broadcast(BroadcastArgs),
    /// Counter shared through the key-value service.
    Counter(CounterArgs),
    /// Multi-partition append-only log with committed offsets.
    Kafka(KafkaArgs),
}

#[derive(Args, Debug, Clone)]
pub struct TimingArgs {
    /// Milliseconds between re-sends of an unacknowledged message.
    #[arg(long, env = "NODE_RETRY_INTERVAL_MS", default_value_t = 250, global = true)]
    pub retry_interval_ms: u64,

    /// Milliseconds before a key-value request is reported as failed.
    #[arg(long, env = "NODE_RPC_TIMEOUT_MS", default_value_t = 2000, global = true)]
    pub rpc_timeout_ms: u64,

    /// Compare-and-swap attempts before giving up under contention.
    #[arg(long, env = "NODE_MAX_ATTEMPTS", default_value_t = 32, global = true)]
    pub max_attempts: u32,

    /// Base backoff in milliseconds between contended attempts.
    #[arg(long, env = "NODE_BACKOFF_MS", default_value_t = 5, global = true)]
    pub backoff_ms: u64,
}

impl TimingArgs {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            retry_interval: Duration::from_millis(self.retry_interval_ms.max(1)),
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms.max(1)),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let base_backoff = Duration::from_millis(self.backoff_ms);
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_backoff,
            max_backoff: base_backoff.saturating_mul(40),
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum TopologyArg {
    Provided,
    Mesh,
}

impl From<TopologyArg> for TopologyMode {
    fn from(arg: TopologyArg) -> Self {
        match arg {
            TopologyArg::Provided => TopologyMode::Provided,
            TopologyArg::Mesh => TopologyMode::Mesh,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum LogModeArg {
    Shared,
    Local,
}

impl From<LogModeArg> for LogMode {
    fn from(arg: LogModeArg) -> Self {
        match arg {
            LogModeArg::Shared => LogMode::Shared,
            LogModeArg::Local => LogMode::Local,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct BroadcastArgs {
    /// Where gossip targets come from.
    #[arg(long, value_enum, default_value_t = TopologyArg::Provided)]
    pub topology: TopologyArg,
}

#[derive(Args, Debug, Clone)]
pub struct CounterArgs {
    /// Key-value service holding the counter.
    #[arg(long, default_value = LIN_KV)]
    pub store: String,

    /// Key the counter is stored under.
    #[arg(long, default_value = DEFAULT_KEY)]
    pub key: String,
}

#[derive(Args, Debug, Clone)]
pub struct KafkaArgs {
    /// Keep partitions in the shared store or in this process only.
    #[arg(long, value_enum, default_value_t = LogModeArg::Shared)]
    pub mode: LogModeArg,

    /// Key-value service backing shared partitions.
    #[arg(long, default_value = LIN_KV)]
    pub store: String,

    /// Most entries returned per key by one poll.
    #[arg(long, default_value_t = 100)]
    pub max_poll_entries: usize,
}
