use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use maelstrom_node::{
    broadcast::{self, BroadcastEngine},
    cli::{Cli, Command},
    counter::{self, CounterEngine},
    echo,
    kv::KvClient,
    log::{self, LogEngine},
    node::Node,
    runtime,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // Stdout carries protocol traffic, so diagnostics go to stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let (node, outbox) = Node::new(cli.timing.node_config());
    let policy = cli.timing.retry_policy();

    echo::register(&node).await?;
    match cli.command {
        Command::Echo => {}
        Command::Broadcast(args) => {
            let engine = Arc::new(BroadcastEngine::new(args.topology.into()));
            broadcast::register(&node, engine).await?;
        }
        Command::Counter(args) => {
            let engine = Arc::new(CounterEngine::new(KvClient::new(args.store), args.key, policy));
            counter::register(&node, engine).await?;
        }
        Command::Kafka(args) => {
            let engine = Arc::new(LogEngine::new(
                args.mode.into(),
                KvClient::new(args.store),
                policy,
                args.max_poll_entries,
            ));
            log::register(&node, engine).await?;
        }
    }

    info!("node ready; waiting for init");
    if let Err(err) = runtime::run_stdio(node, outbox).await {
        error!("node exited with error: {err:?}");
        return Err(err).context("transport failed");
    }

    Ok(())
}
