//! Long-running listeners share one capability: serve until shutdown or failure

use async_trait::async_trait;
use futures::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[async_trait]
pub trait Server: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Accept and serve until shutdown is signalled or a fatal error occurs
    async fn serve(&self) -> anyhow::Result<()>;
}

/// Run every server until the first one returns
pub async fn serve_all(servers: Vec<Arc<dyn Server>>) -> anyhow::Result<()> {
    if servers.is_empty() {
        return Ok(());
    }

    let tasks = servers.into_iter().map(|server| {
        tokio::spawn(async move {
            let name = server.name();
            info!(server = name, "Server starting");
            let result = server.serve().await;
            (name, result)
        })
    });

    let (joined, _, remaining) = select_all(tasks).await;
    for task in remaining {
        task.abort();
    }

    match joined {
        Ok((name, Ok(()))) => {
            info!(server = name, "Server stopped");
            Ok(())
        }
        Ok((name, Err(e))) => {
            error!(server = name, error = %e, "Server failed");
            Err(e.context(format!("{} server failed", name)))
        }
        Err(e) => Err(anyhow::anyhow!("server task panicked: {}", e)),
    }
}

/// Resolves once shutdown is signalled or the sender is gone
pub async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
