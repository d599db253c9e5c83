//! Stateless handlers every workload carries: `echo` and `generate`.

use serde_json::Value;

use crate::error::NodeError;
use crate::message::{Body, Message};
use crate::node::Node;

/// Replies with every field of the request under type `echo_ok`.
pub fn echo(node: &Node, message: &Message) -> Result<(), NodeError> {
    let mut reply = Body::new("echo_ok");
    reply.fields = message.body.fields.clone();
    node.reply(message, reply)
}

/// Replies with an id unique across the cluster: the node id keeps ids from
/// different nodes apart, the random suffix keeps them apart within a node.
pub fn generate(node: &Node, message: &Message) -> Result<(), NodeError> {
    let id = format!("{}-{}", node.id(), nanoid::nanoid!());
    let mut reply = Body::new("generate_ok");
    reply.fields.insert("id".to_string(), Value::String(id));
    node.reply(message, reply)
}

pub async fn register(node: &Node) -> Result<(), NodeError> {
    node.handle("echo", |node, message| async move { echo(&node, &message) })
        .await?;
    node.handle("generate", |node, message| async move { generate(&node, &message) })
        .await
}
