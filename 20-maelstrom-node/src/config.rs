//! Plain configuration values consumed by the library.
//!
//! The binary builds these from command-line flags (see [`crate::cli`]);
//! tests construct them directly.

use std::time::Duration;

use rand::Rng;

/// Timing knobs for the message channel.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Gap between re-sends of an unacknowledged request.
    pub retry_interval: Duration,
    /// Overall deadline for client-facing store requests.
    pub rpc_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(250),
            rpc_timeout: Duration::from_secs(2),
        }
    }
}

/// Bound and pacing for optimistic compare-and-swap loops.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 32,
            base_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter for the given 1-based attempt.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let ceiling = exp.min(self.max_backoff);
        let millis = ceiling.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Where the broadcast engine takes its gossip targets from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyMode {
    /// Neighbors from the most recent `topology` message.
    #[default]
    Provided,
    /// Every other member of the cluster.
    Mesh,
}

/// Storage strategy for the replicated log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    /// Partitions live in the shared linearizable store.
    #[default]
    Shared,
    /// Partitions live in this process only. Single-node deployments only.
    Local,
}
