//! Feeder accept loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use beast_services::SessionId;

use crate::relay::{RelayContext, Session};

/// How long in-flight sessions get to finish teardown after shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct FeederListener {
    listener: TcpListener,
    ctx: Arc<RelayContext>,
    shutdown_tx: broadcast::Sender<()>,
    next_id: SessionId,
}

impl FeederListener {
    pub fn new(listener: TcpListener, ctx: Arc<RelayContext>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            listener,
            ctx,
            shutdown_tx,
            next_id: 1,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(live = tasks.len(), "listener shutting down");
                    break;
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "session task failed");
                    }
                }

                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            // Out of descriptors and the like; back off briefly.
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    let id = self.next_id;
                    self.next_id += 1;
                    tracing::debug!(session = id, addr = %addr, "accepted feeder connection");

                    let session = Session::new(id, self.ctx.clone(), self.shutdown_tx.subscribe());
                    tasks.spawn(session.run(stream));
                }
            }
        }

        drain(tasks, SHUTDOWN_GRACE).await;
        Ok(())
    }
}

/// Let sessions finish their teardown, then abort whatever is left.
async fn drain(mut tasks: JoinSet<()>, grace: Duration) {
    let finished = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if finished.is_err() {
        tracing::warn!(remaining = tasks.len(), "sessions did not finish in time, aborting");
        tasks.shutdown().await;
    }
}
