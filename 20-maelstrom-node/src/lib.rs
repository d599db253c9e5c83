//! A node for Maelstrom-style distributed-systems workloads.
//!
//! One process is one peer in a cluster. Peers, clients and the shared
//! key-value service talk exclusively through JSON envelopes, and the
//! transport may delay, reorder or duplicate them. Each module owns one
//! concern:
//!
//! - [`message`] defines the envelope plus the line-oriented framing helpers.
//! - [`node`] is the message channel: handler registry, replies, and
//!   request/await with retry.
//! - [`runtime`] connects a node to stdin/stdout.
//! - [`topology`] stores the peer adjacency map.
//! - [`broadcast`] is the gossiped, eventually-consistent replicated set.
//! - [`kv`] is the client for the shared linearizable store, including the
//!   bounded compare-and-swap loop.
//! - [`counter`] is the cluster-wide counter built on that loop.
//! - [`log`] is the partitioned commit log with consumer watermarks.
//! - [`echo`] holds the stateless `echo` and `generate` handlers.
//! - [`cli`] and [`config`] turn flags into the settings above.
//!
//! Integration tests drive several nodes through an in-memory network with a
//! simulated key-value service.

pub mod broadcast;
pub mod cli;
pub mod config;
pub mod counter;
pub mod echo;
pub mod error;
pub mod kv;
pub mod log;
pub mod message;
pub mod node;
pub mod runtime;
pub mod topology;

pub use error::{ErrorCode, NodeError};
pub use message::{Body, Message};
pub use node::Node;
