//! Ingress reconciler
//!
//! Keeps the routing store in line with the cluster's ingress rules. Only
//! internal-form targets are owned here; targets registered by other means
//! are never removed.

use crate::config::IngressConfig;
use crate::error::RouterError;
use crate::router::{parse_target, Router};
use crate::server::shutdown_signalled;
use crate::storage::normalize_host;
use futures::{FutureExt, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Quiet period after a change event before reconciling
const DEBOUNCE: Duration = Duration::from_millis(250);
const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
}

pub struct IngressReconciler {
    router: Arc<Router>,
    resync: Duration,
    backoff_max: Duration,
}

impl IngressReconciler {
    pub fn new(router: Arc<Router>, config: &IngressConfig) -> Self {
        Self {
            router,
            resync: Duration::from_secs(config.resync_secs),
            backoff_max: Duration::from_secs(config.backoff_max_secs),
        }
    }

    /// One pass: diff desired routes against every desired or known host
    pub async fn reconcile(&self) -> Result<ReconcileSummary, RouterError> {
        let mut desired: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for route in self.router.cluster().ingress_routes().await? {
            match normalize_host(&route.host) {
                Ok(host) => {
                    desired.entry(host).or_default().insert(route.target);
                }
                Err(e) => warn!(host = %route.host, error = %e, "Skipping ingress rule"),
            }
        }

        let mut hosts: BTreeSet<String> = desired.keys().cloned().collect();
        hosts.extend(self.router.storage().host_list()?);

        let mut summary = ReconcileSummary::default();
        let empty = BTreeSet::new();

        for host in &hosts {
            let wanted = desired.get(host).unwrap_or(&empty);
            let current: BTreeSet<String> = self.router.target_list(host)?.into_iter().collect();

            for target in wanted.difference(&current) {
                self.router.target_add(host, target).await?;
                summary.added += 1;
            }

            for target in current.difference(wanted) {
                if parse_target(target).is_none() {
                    continue;
                }
                info!(host, target, "Removing target no longer in ingress");
                self.router.target_remove(host, target)?;
                summary.removed += 1;
            }
        }

        Ok(summary)
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        BACKOFF_BASE.saturating_mul(factor).min(self.backoff_max)
    }

    /// Reconcile on every change and on the resync interval until shutdown
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(resync_secs = self.resync.as_secs(), "Ingress reconciler started");

        let mut changes = self.router.cluster().changes();
        let mut failures = 0u32;

        loop {
            match self.reconcile().await {
                Ok(summary) => {
                    failures = 0;
                    if summary != ReconcileSummary::default() {
                        info!(added = summary.added, removed = summary.removed, "Ingress reconciled");
                    } else {
                        debug!("Ingress already in sync");
                    }
                }
                Err(e) => {
                    failures += 1;
                    let delay = self.backoff(failures);
                    warn!(error = %e, failures, retry_ms = delay.as_millis() as u64, "Ingress reconcile failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown_signalled(&mut shutdown_rx) => break,
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.resync) => {
                    debug!("Ingress resync");
                }
                event = changes.next() => match event {
                    Some(Ok(())) => {
                        tokio::time::sleep(DEBOUNCE).await;
                        while let Some(Some(_)) = changes.next().now_or_never() {}
                    }
                    Some(Err(e)) => {
                        failures += 1;
                        let delay = self.backoff(failures);
                        warn!(error = %e, retry_ms = delay.as_millis() as u64, "Cluster watch failed");
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        failures += 1;
                        let delay = self.backoff(failures);
                        warn!(retry_ms = delay.as_millis() as u64, "Cluster watch ended, resubscribing");
                        tokio::time::sleep(delay).await;
                        changes = self.router.cluster().changes();
                    }
                },
                _ = shutdown_signalled(&mut shutdown_rx) => break,
            }
        }

        info!("Ingress reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{IngressRoute, StaticCluster};
    use crate::config::IdleConfig;
    use crate::router::internal_target;
    use crate::storage::MemoryStorage;

    fn setup() -> (IngressReconciler, Arc<Router>, Arc<StaticCluster>, watch::Sender<bool>) {
        let cluster = Arc::new(StaticCluster::new());
        let (tx, rx) = watch::channel(false);
        let router = Arc::new(Router::new(
            Arc::new(MemoryStorage::new()),
            cluster.clone(),
            &IdleConfig::default(),
            rx,
        ));
        let config = IngressConfig {
            resync_secs: 3600,
            backoff_max_secs: 1,
            ..IngressConfig::default()
        };
        (IngressReconciler::new(Arc::clone(&router), &config), router, cluster, tx)
    }

    fn route(host: &str, target: &str) -> IngressRoute {
        IngressRoute {
            host: host.to_string(),
            target: target.to_string(),
        }
    }

    #[tokio::test]
    async fn test_reconcile_adds_routes() {
        let (reconciler, router, cluster, _tx) = setup();
        let web = internal_target("web", "myapp", 3000);
        cluster.set_ingress_routes(vec![route("App.Example.com", &web)]);

        let summary = reconciler.reconcile().await.unwrap();
        assert_eq!(summary, ReconcileSummary { added: 1, removed: 0 });
        assert_eq!(router.target_list("app.example.com").unwrap(), vec![web]);

        let summary = reconciler.reconcile().await.unwrap();
        assert_eq!(summary, ReconcileSummary::default());
    }

    #[tokio::test]
    async fn test_reconcile_removes_only_internal_targets() {
        let (reconciler, router, cluster, _tx) = setup();
        let web = internal_target("web", "myapp", 3000);
        let api = internal_target("api", "myapp", 4000);
        cluster.set_ingress_routes(vec![route("app.example.com", &web), route("app.example.com", &api)]);
        reconciler.reconcile().await.unwrap();

        router.target_add("app.example.com", "http://10.0.0.9:80").await.unwrap();
        cluster.set_ingress_routes(vec![route("app.example.com", &web)]);

        let summary = reconciler.reconcile().await.unwrap();
        assert_eq!(summary, ReconcileSummary { added: 0, removed: 1 });

        let mut targets = router.target_list("app.example.com").unwrap();
        targets.sort();
        assert_eq!(targets, vec!["http://10.0.0.9:80".to_string(), web]);
    }

    #[tokio::test]
    async fn test_run_follows_changes() {
        let (reconciler, router, cluster, tx) = setup();
        let reconciler = Arc::new(reconciler);
        let rx = tx.subscribe();
        let task = {
            let reconciler = Arc::clone(&reconciler);
            tokio::spawn(async move { reconciler.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let web = internal_target("web", "myapp", 3000);
        cluster.set_ingress_routes(vec![route("app.example.com", &web)]);

        let mut found = false;
        for _ in 0..40 {
            if !router.target_list("app.example.com").unwrap().is_empty() {
                found = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(found);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_backoff_is_bounded() {
        let (reconciler, _router, _cluster, _tx) = setup();
        assert_eq!(reconciler.backoff(1), Duration::from_secs(1));
        assert_eq!(reconciler.backoff(30), Duration::from_secs(1));
    }
}
