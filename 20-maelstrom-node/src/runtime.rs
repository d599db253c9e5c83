//! Wires a [`Node`] to a line-delimited JSON transport.
//!
//! One task drains the node's outbox into the writer; the calling task reads
//! envelopes and hands each to [`Node::dispatch`]. Stdin/stdout is the
//! production transport; tests can pass any `AsyncBufRead`/`AsyncWrite` pair.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::message::{Frames, write_frame};
use crate::node::{Node, Outbox};

const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

pub async fn run_stdio(node: Arc<Node>, outbox: Outbox) -> Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    serve(node, outbox, reader, tokio::io::stdout()).await
}

/// Serves until the reader hits EOF, then lets queued output drain.
pub async fn serve<R, W>(node: Arc<Node>, outbox: Outbox, reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut frames = Frames::new(reader);
    let mut writer_task = spawn_writer(outbox, writer);

    loop {
        let next = tokio::select! {
            next = frames.next() => next,
            finished = &mut writer_task => return writer_outcome(finished),
        };
        match next {
            Ok(Some(message)) => {
                debug!(src = %message.src, kind = %message.body.kind, "received");
                node.dispatch(message).await;
            }
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                warn!(error = %err, "skipping undecodable envelope");
            }
            Err(err) => return Err(err).context("failed to read from transport"),
        }
    }

    info!(node = %node.id(), "input closed; shutting down");
    // Retry tasks still hold the node, so the outbox may never close; give
    // queued replies a moment to flush and then stop regardless.
    drop(node);
    match timeout(SHUTDOWN_GRACE, &mut writer_task).await {
        Ok(finished) => writer_outcome(finished),
        Err(_) => {
            debug!("outbox still open at shutdown");
            writer_task.abort();
            Ok(())
        }
    }
}

fn writer_outcome(finished: Result<Result<()>, JoinError>) -> Result<()> {
    finished.context("writer task panicked")?
}

fn spawn_writer<W>(mut outbox: Outbox, mut writer: W) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            write_frame(&mut writer, &message)
                .await
                .context("failed to write to transport")?;
        }
        Ok(())
    })
}
